//! PostgreSQL source and Redshift warehouse adapters
//!
//! Both speak the PostgreSQL wire protocol through `tokio-postgres`:
//! - `PostgresSource` introspects `information_schema.columns` and streams
//!   extraction results through a server-side cursor
//! - `RedshiftWarehouse` runs DDL, COPY and merge statements, wrapping load
//!   scripts in a single transaction
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = PostgresSource::connect(config.connection("appdb")?).await?;
//! let warehouse = RedshiftWarehouse::connect(config.connection("cosmo")?).await?;
//! ```

use crate::adapter::{CatalogError, RowCursor, SourceDatabase, TableName, TargetWarehouse};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use stagehouse_core::{ColumnSchema, ConnectionConfig, Row, Value};
use stagehouse_sql::{count_query, SourceDialect, KEEPALIVE_QUERY};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error};

/// Name of the server-side cursor used for extraction
const CURSOR_NAME: &str = "stagehouse_extract";

/// Open a client, spawning its connection task
async fn connect_client(config: &ConnectionConfig) -> Result<Client, CatalogError> {
    let conn_str = config.connection_string();
    let host = config.host.clone();
    let port = config.port();

    if config.tls {
        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| CatalogError::Config(format!("Failed to create TLS connector: {}", e)))?;
        let tls = MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(&conn_str, tls).await.map_err(|e| {
            CatalogError::Connection(format!("Failed to connect to {}:{} with TLS: {}", host, port, e))
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL TLS connection error ({}:{}): {}", host, port, e);
            }
        });
        Ok(client)
    } else {
        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls).await.map_err(|e| {
            CatalogError::Connection(format!("Failed to connect to {}:{}: {}", host, port, e))
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error ({}:{}): {}", host, port, e);
            }
        });
        Ok(client)
    }
}

/// Translate a driver error, keeping the statement, SQLSTATE and server message
fn query_error(sql: &str, e: tokio_postgres::Error) -> CatalogError {
    match e.as_db_error() {
        Some(db) => CatalogError::query(sql, db.code().code(), db.message()),
        None => CatalogError::query(sql, "", e.to_string()),
    }
}

/// Decode one text-protocol cell using the column's declared type
fn text_to_value(raw: Option<&str>, ty: &Type) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };

    if *ty == Type::BOOL {
        Value::Bool(raw == "t")
    } else if [Type::INT2, Type::INT4, Type::INT8].contains(ty) {
        raw.parse().map_or_else(|_| Value::Text(raw.to_string()), Value::Int)
    } else if [Type::FLOAT4, Type::FLOAT8].contains(ty) {
        raw.parse().map_or_else(|_| Value::Text(raw.to_string()), Value::Float)
    } else {
        Value::Text(raw.to_string())
    }
}

/// PostgreSQL source database
pub struct PostgresSource {
    client: Arc<Client>,
    dialect: SourceDialect,
}

impl PostgresSource {
    /// Connect using a named connection from configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, CatalogError> {
        let client = connect_client(config).await?;
        Ok(Self {
            client: Arc::new(client),
            dialect: SourceDialect::from(config.kind),
        })
    }
}

/// Server-side cursor fetched with the text protocol
///
/// The cursor lives inside a transaction opened by `open_cursor`; it is closed
/// and the transaction committed once the result is exhausted.
struct PostgresCursor {
    client: Arc<Client>,
    types: Vec<Type>,
    done: bool,
}

#[async_trait::async_trait]
impl RowCursor for PostgresCursor {
    async fn next_batch(&mut self, max_rows: usize) -> Result<Vec<Row>, CatalogError> {
        if self.done {
            return Ok(Vec::new());
        }

        let fetch = format!("fetch forward {} from {}", max_rows.max(1), CURSOR_NAME);
        let messages = self
            .client
            .simple_query(&fetch)
            .await
            .map_err(|e| query_error(&fetch, e))?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let values = (0..row.len())
                    .map(|i| text_to_value(row.get(i), self.types.get(i).unwrap_or(&Type::TEXT)))
                    .collect();
                rows.push(values);
            }
        }

        if rows.is_empty() {
            self.done = true;
            let close = format!("close {}; commit", CURSOR_NAME);
            self.client
                .batch_execute(&close)
                .await
                .map_err(|e| query_error(&close, e))?;
        }

        Ok(rows)
    }
}

#[async_trait::async_trait]
impl SourceDatabase for PostgresSource {
    fn name(&self) -> &str {
        "PostgreSQL"
    }

    fn dialect(&self) -> SourceDialect {
        self.dialect
    }

    async fn describe_columns(&self, table: &TableName) -> Result<Vec<ColumnSchema>, CatalogError> {
        // information_schema columns are domain types; cast them to plain ones
        let query = r#"
            SELECT
                column_name::text,
                data_type::text,
                character_maximum_length::int,
                numeric_precision::int,
                numeric_scale::int
            FROM information_schema.columns
            WHERE table_schema = $1
              AND table_name = $2
            ORDER BY ordinal_position
        "#;

        let rows = self
            .client
            .query(query, &[&table.schema, &table.table])
            .await
            .map_err(|e| query_error(query, e))?;

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let max_length: Option<i32> = row.get(2);
                let precision: Option<i32> = row.get(3);
                let scale: Option<i32> = row.get(4);

                let mut column = ColumnSchema::new(name, &data_type);
                if let Some(n) = max_length {
                    column = column.with_max_length(n as i64);
                }
                if let (Some(p), Some(s)) = (precision, scale) {
                    column = column.with_precision(p as i64, s as i64);
                }
                column
            })
            .collect();

        Ok(columns)
    }

    async fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor>, CatalogError> {
        // Column types come from the prepared statement; rows are fetched as text.
        let statement = self.client.prepare(sql).await.map_err(|e| query_error(sql, e))?;
        let types = statement.columns().iter().map(|c| c.type_().clone()).collect();

        let declare = format!("begin; declare {} no scroll cursor for {}", CURSOR_NAME, sql);
        self.client
            .batch_execute(&declare)
            .await
            .map_err(|e| query_error(sql, e))?;
        debug!("Opened cursor for: {}", sql);

        Ok(Box::new(PostgresCursor {
            client: Arc::clone(&self.client),
            types,
            done: false,
        }))
    }

    async fn execute(&self, sql: &str) -> Result<u64, CatalogError> {
        self.client.execute(sql, &[]).await.map_err(|e| query_error(sql, e))
    }

    async fn count(&self, table: &str) -> Result<i64, CatalogError> {
        let sql = count_query(table);
        let row = self.client.query_one(&sql, &[]).await.map_err(|e| query_error(&sql, e))?;
        Ok(row.get(0))
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        self.client
            .simple_query(KEEPALIVE_QUERY)
            .await
            .map(|_| ())
            .map_err(|e| CatalogError::Connection(e.to_string()))
    }
}

/// Redshift (or PostgreSQL) target warehouse
///
/// The client sits behind a mutex because transactions need exclusive access.
pub struct RedshiftWarehouse {
    client: Mutex<Client>,
}

impl RedshiftWarehouse {
    /// Connect using a named connection from configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, CatalogError> {
        let client = connect_client(config).await?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait::async_trait]
impl TargetWarehouse for RedshiftWarehouse {
    fn name(&self) -> &str {
        "Redshift"
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, CatalogError> {
        let query = "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2";
        let client = self.client.lock().await;
        let rows = client
            .query(query, &[&table.schema, &table.table])
            .await
            .map_err(|e| query_error(query, e))?;
        Ok(!rows.is_empty())
    }

    async fn execute(&self, sql: &str) -> Result<u64, CatalogError> {
        let client = self.client.lock().await;
        client.execute(sql, &[]).await.map_err(|e| query_error(sql, e))
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), CatalogError> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()))?;

        for sql in statements {
            // Dropping `tx` on error rolls the transaction back.
            tx.batch_execute(sql).await.map_err(|e| query_error(sql, e))?;
        }

        tx.commit().await.map_err(|e| query_error("commit", e))
    }

    async fn count(&self, table: &str) -> Result<i64, CatalogError> {
        let sql = count_query(table);
        let client = self.client.lock().await;
        let row = client.query_one(&sql, &[]).await.map_err(|e| query_error(&sql, e))?;
        Ok(row.get(0))
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        let client = self.client.lock().await;
        client
            .simple_query(KEEPALIVE_QUERY)
            .await
            .map(|_| ())
            .map_err(|e| CatalogError::Connection(e.to_string()))
    }
}
