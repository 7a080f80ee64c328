//! Collaborator traits consumed by the pipeline

use bytes::Bytes;
use stagehouse_core::{ColumnSchema, Row, Watermark};
use stagehouse_sql::{redact_credentials, SourceDialect};
use std::fmt;
use std::path::Path;

/// Identifies a table as `schema.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    /// Schema name
    pub schema: String,

    /// Table name
    pub table: String,
}

impl TableName {
    /// Create a new table name
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema.table`, falling back to `default_schema` when unqualified
    pub fn parse(raw: &str, default_schema: &str) -> Self {
        match raw.trim().split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(default_schema, raw.trim()),
        }
    }

    /// Get fully qualified name
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// Errors raised by databases, storage, and the batch service
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Query failed [{code}]: {message}\n  SQL: {sql}")]
    Query {
        sql: String,
        code: String,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Batch service error: {0}")]
    Batch(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CatalogError {
    /// Query failure with the offending statement attached
    ///
    /// Credentials in the statement are masked before it is stored.
    pub fn query(sql: &str, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            sql: redact_credentials(sql),
            code: code.into(),
            message: message.into(),
        }
    }

    /// SQLSTATE of a failed statement, if the server reported one
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } if !code.is_empty() => Some(code),
            _ => None,
        }
    }

    /// The statement referenced a table that does not exist
    pub fn is_missing_table(&self) -> bool {
        matches!(self, Self::TableNotFound(_)) || self.sql_state() == Some("42P01")
    }

    /// The connected role lacks a privilege the statement needs
    pub fn is_permission_denied(&self) -> bool {
        self.sql_state() == Some("42501")
    }
}

/// Incremental reader over a query result
#[async_trait::async_trait]
pub trait RowCursor: Send {
    /// Fetch up to `max_rows` rows; an empty batch means the result is exhausted
    async fn next_batch(&mut self, max_rows: usize) -> Result<Vec<Row>, CatalogError>;
}

/// Operational database rows are extracted from
#[async_trait::async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Get the adapter name
    fn name(&self) -> &str;

    /// SQL dialect used when building extraction queries
    fn dialect(&self) -> SourceDialect;

    /// Columns of `table` in ordinal order; empty when the table does not exist
    async fn describe_columns(&self, table: &TableName) -> Result<Vec<ColumnSchema>, CatalogError>;

    /// Start streaming the result of `sql`
    async fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor>, CatalogError>;

    /// Execute a statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64, CatalogError>;

    /// Row count of `table`
    async fn count(&self, table: &str) -> Result<i64, CatalogError>;

    /// No-op round trip that keeps the connection alive
    async fn ping(&self) -> Result<(), CatalogError>;
}

/// Analytical warehouse rows are loaded into
#[async_trait::async_trait]
pub trait TargetWarehouse: Send + Sync {
    /// Get the adapter name
    fn name(&self) -> &str;

    /// Whether `table` exists
    async fn table_exists(&self, table: &TableName) -> Result<bool, CatalogError>;

    /// Execute a statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64, CatalogError>;

    /// Execute all statements in one transaction; nothing is committed on failure
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), CatalogError>;

    /// Row count of `table`
    async fn count(&self, table: &str) -> Result<i64, CatalogError>;

    /// No-op round trip that keeps the connection alive
    async fn ping(&self) -> Result<(), CatalogError>;
}

/// Object storage that holds staging artifacts
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload a local file under `key`, returning its addressable URI
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, CatalogError>;

    /// Store `bytes` under `key`, returning its addressable URI
    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<String, CatalogError>;

    /// URI the warehouse uses to read `key`
    fn uri_for(&self, key: &str) -> String;
}

/// External batch/watermark service
#[async_trait::async_trait]
pub trait BatchService: Send + Sync {
    /// Open a batch for `workflow` and return its watermark
    async fn open(&self, workflow: &str) -> Result<Watermark, CatalogError>;

    /// Mark the open batch of `workflow` complete
    async fn close(&self, workflow: &str) -> Result<(), CatalogError>;

    /// Mark the open batch of `workflow` failed
    async fn fail(&self, workflow: &str) -> Result<(), CatalogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name() {
        let table = TableName::parse("edw.users", "public");
        assert_eq!(table.schema, "edw");
        assert_eq!(table.table, "users");
        assert_eq!(table.to_string(), "edw.users");

        let table = TableName::parse(" users ", "dbo");
        assert_eq!(table.fqn(), "dbo.users");
    }

    #[test]
    fn test_query_error_masks_credentials() {
        let err = CatalogError::query(
            "COPY t from 's3://b/k' CREDENTIALS 'aws_secret_access_key=abc';",
            "XX000",
            "load failed",
        );
        let text = err.to_string();
        assert!(text.contains("[XX000]"));
        assert!(text.contains("CREDENTIALS '***'"));
        assert!(!text.contains("abc"));
    }

    #[test]
    fn test_missing_table_keeps_statement_and_code() {
        let err = CatalogError::query(
            "COPY edw.gone from 's3://b/k' CREDENTIALS 'aws_iam_role=arn:role';",
            "42P01",
            "relation \"edw.gone\" does not exist",
        );
        assert!(err.is_missing_table());
        assert!(!err.is_permission_denied());
        assert_eq!(err.sql_state(), Some("42P01"));

        let text = err.to_string();
        assert!(text.contains("[42P01]"));
        assert!(text.contains("SQL: COPY edw.gone from 's3://b/k' CREDENTIALS '***';"));
    }

    #[test]
    fn test_permission_denied_keeps_statement_and_code() {
        let err = CatalogError::query("grant select on edw.users to group ro_users;", "42501", "permission denied");
        assert!(err.is_permission_denied());
        assert!(err.to_string().contains("SQL: grant select on edw.users to group ro_users;"));

        assert!(CatalogError::TableNotFound("dbo.gone".to_string()).is_missing_table());
        assert_eq!(CatalogError::Connection("refused".to_string()).sql_state(), None);
    }
}
