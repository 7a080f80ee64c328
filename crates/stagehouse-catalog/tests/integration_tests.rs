//! Integration tests for catalog adapters
//!
//! Tests using the in-memory doubles run everywhere. Tests requiring a real
//! database are marked with `#[ignore]` and can be run with `cargo test -- --ignored`.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all non-ignored tests (no credentials required)
//! cargo test -p stagehouse-catalog --test integration_tests
//!
//! # Run PostgreSQL / Redshift tests
//! STAGEHOUSE_PG_HOST=localhost \
//! STAGEHOUSE_PG_DATABASE=mydb \
//! STAGEHOUSE_PG_USER=user \
//! STAGEHOUSE_PG_PASSWORD=pass \
//! cargo test -p stagehouse-catalog --features postgres --test integration_tests -- --ignored
//! ```

mod fixtures;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use stagehouse_catalog::{
    MemorySourceBuilder, MemoryWarehouse, ObjectStorage, ObjectStoreStorage, SourceDatabase, TableName,
    TargetWarehouse,
};
use stagehouse_core::LoadPlan;
use stagehouse_sql::{ExtractQuery, LoadScript, SchemaTranslator};

// =============================================================================
// Memory doubles
// =============================================================================

#[tokio::test]
async fn test_memory_source_with_fixtures() {
    let source = MemorySourceBuilder::new()
        .with_table("dbo.users", fixtures::users_columns(), fixtures::users_rows())
        .with_table("dbo.orders", fixtures::orders_columns(), fixtures::orders_rows())
        .build();

    let cols = source.describe_columns(&TableName::new("dbo", "orders")).await.unwrap();
    assert_eq!(cols.len(), 6);
    assert_eq!(source.count("dbo.users").await.unwrap(), 3);

    let sql = ExtractQuery::new("dbo.orders", source.dialect()).build();
    let mut cursor = source.open_cursor(&sql).await.unwrap();
    assert_eq!(cursor.next_batch(10).await.unwrap().len(), 2);
    assert!(cursor.next_batch(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_generated_ddl_runs_on_memory_warehouse() {
    let clone = SchemaTranslator::translate("dbo.orders", "edw.orders", &fixtures::orders_columns()).unwrap();
    let warehouse = MemoryWarehouse::detached();

    warehouse.execute(&SchemaTranslator::drop_statement(&clone)).await.unwrap();
    warehouse.execute(&SchemaTranslator::create_statement(&clone)).await.unwrap();

    let columns = warehouse.columns("edw.orders").await.unwrap();
    assert_eq!(columns.len(), 10);
    assert_eq!(columns[5], "v_order");
    assert_eq!(columns[9], "etl_run_id");
}

#[tokio::test]
async fn test_incremental_script_is_idempotent() {
    let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
    let uri = storage
        .put_bytes("stage/edw-t/output.tsv", Bytes::from_static(b"1\ta\n2\tb\n"))
        .await
        .unwrap();

    let warehouse = MemoryWarehouse::new(storage);
    warehouse.add_table("edw.t", &["id", "v"]).await;

    let plan = LoadPlan::builder("edw.t")
        .incremental(vec!["id".to_string()])
        .gzip(false)
        .build()
        .unwrap();
    let script = LoadScript::for_plan(&plan, &uri, None);

    warehouse.execute_transaction(&script.statements).await.unwrap();
    warehouse.execute_transaction(&script.statements).await.unwrap();

    assert_eq!(warehouse.count("edw.t").await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_copy_leaves_target_untouched() {
    let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
    let uri = storage
        .put_bytes("stage/edw-t/output.tsv", Bytes::from_static(b"1\ta\textra\n"))
        .await
        .unwrap();

    let warehouse = MemoryWarehouse::new(storage);
    warehouse.add_table("edw.t", &["id", "v"]).await;

    let plan = LoadPlan::builder("edw.t").gzip(false).build().unwrap();
    let script = LoadScript::for_plan(&plan, &uri, Some("aws_iam_role=arn:aws:iam::1:role/x"));

    let err = warehouse.execute_transaction(&script.statements).await.unwrap_err();
    assert!(err.to_string().contains("stl_load_errors"));
    assert!(!err.to_string().contains("arn:aws"));
    assert!(warehouse.table_exists(&TableName::new("edw", "t")).await.unwrap());
}

// =============================================================================
// PostgreSQL / Redshift (requires a live database)
// =============================================================================

#[cfg(feature = "postgres")]
fn pg_config_from_env() -> Option<stagehouse_core::ConnectionConfig> {
    let host = std::env::var("STAGEHOUSE_PG_HOST").ok()?;
    Some(stagehouse_core::ConnectionConfig {
        kind: stagehouse_core::ConnectionKind::Postgres,
        host,
        port: std::env::var("STAGEHOUSE_PG_PORT").ok().and_then(|p| p.parse().ok()),
        database: std::env::var("STAGEHOUSE_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        user: std::env::var("STAGEHOUSE_PG_USER").unwrap_or_else(|_| "postgres".to_string()),
        password: std::env::var("STAGEHOUSE_PG_PASSWORD").unwrap_or_default(),
        tls: false,
        schema: "public".to_string(),
    })
}

#[cfg(feature = "postgres")]
#[tokio::test]
#[ignore]
async fn test_postgres_roundtrip() {
    use stagehouse_catalog::{PostgresSource, RedshiftWarehouse};

    let Some(config) = pg_config_from_env() else {
        eprintln!("Skipping: STAGEHOUSE_PG_HOST not set");
        return;
    };

    let warehouse = RedshiftWarehouse::connect(&config).await.unwrap();
    warehouse
        .execute_transaction(&[
            "drop table if exists public.stagehouse_it;".to_string(),
            "create table public.stagehouse_it (id int, flag boolean, name varchar(20));".to_string(),
            "insert into public.stagehouse_it values (1, true, 'a'), (2, false, null);".to_string(),
        ])
        .await
        .unwrap();
    warehouse.ping().await.unwrap();

    let source = PostgresSource::connect(&config).await.unwrap();
    let table = TableName::new("public", "stagehouse_it");
    assert_eq!(source.describe_columns(&table).await.unwrap().len(), 3);
    assert_eq!(source.count("public.stagehouse_it").await.unwrap(), 2);

    let mut cursor = source.open_cursor("select * from public.stagehouse_it order by id").await.unwrap();
    let rows = cursor.next_batch(100).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], stagehouse_core::Value::Bool(true));
    assert!(cursor.next_batch(100).await.unwrap().is_empty());

    warehouse.execute("drop table public.stagehouse_it;").await.unwrap();
}
