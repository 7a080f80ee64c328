//! Databases, storage and services the pipeline talks to
//!
//! The pipeline only sees the traits in [`adapter`]; concrete adapters are
//! chosen by the caller.
//!
//! ## Features
//!
//! - `postgres` - PostgreSQL source and Redshift warehouse via tokio-postgres
//! - `aws` - S3 staging storage
//! - `batchy` - Batchy batch-control HTTP client
//! - `all-backends` - all of the above
//!
//! The in-memory doubles in [`mock`] are always available.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stagehouse_catalog::{RedshiftWarehouse, TargetWarehouse, TableName};
//!
//! let warehouse = RedshiftWarehouse::connect(config.connection("cosmo")?).await?;
//! let exists = warehouse.table_exists(&TableName::parse("edw.users", "public")).await?;
//! ```

pub mod adapter;
pub mod batchy;
pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod storage;

pub use adapter::{
    BatchService, CatalogError, ObjectStorage, RowCursor, SourceDatabase, TableName, TargetWarehouse,
};
#[cfg(feature = "batchy")]
pub use batchy::BatchyClient;
pub use batchy::{base_url, parse_open_response, summarize_status, BatchStatusSummary};
pub use mock::{BatchEvent, MemoryBatchService, MemoryCursor, MemorySource, MemorySourceBuilder, MemoryWarehouse};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresSource, RedshiftWarehouse};
pub use storage::ObjectStoreStorage;
