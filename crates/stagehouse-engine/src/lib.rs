//! Stagehouse engine - moving tables from a source database into the warehouse
//!
//! This crate implements the pipeline stages:
//! - Target schema cloning
//! - Staging export to object storage
//! - Warehouse load (full refresh or key-based merge)
//! - Row-count quality gate
//! - Batch watermark handling and the concurrent table runner

pub mod clone;
pub mod error;
pub mod exporter;
pub mod loader;
pub mod pipeline;
pub mod quality;
pub mod runner;

pub use clone::{CloneOutcome, SchemaCloner};
pub use error::PipelineError;
pub use exporter::{DelimitedWriter, ExportRequest, StagingExporter};
pub use loader::{build_manifest, WarehouseLoader};
pub use pipeline::{RunFailure, RunOutcome, Stage, StageToWarehouse, TableJob};
pub use quality::{DqResult, QualityGate, QualityGateError, DEFAULT_THRESHOLD};
pub use runner::{ConnectionFactory, TableRunner};
