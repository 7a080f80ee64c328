//! Stagehouse Core
//!
//! Domain model shared by every stage of a source-to-warehouse run.
//! Report field names are part of the public output format.

pub mod config;
pub mod plan;
pub mod report;
pub mod schema;
pub mod value;

pub use config::{Config, ConfigError, ConnectionConfig, ConnectionKind, CopyCredentials, StorageBackend, StorageConfig};
pub use plan::{LoadOptions, LoadPlan, LoadPlanBuilder, PlanError, StagingArtifact, Watermark};
pub use report::{ReportVersion, RunReport, TableReport, TableStatus};
pub use schema::{lineage_columns, ColumnSchema, SourceType, TableClone, TargetColumnDef, WarehouseType, LINEAGE_COLUMNS};
pub use value::{LineageValues, Row, Value, NULL_LITERAL};
