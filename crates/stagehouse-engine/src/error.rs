//! Pipeline error taxonomy

use crate::pipeline::Stage;
use crate::quality::QualityGateError;
use stagehouse_catalog::CatalogError;
use stagehouse_core::PlanError;

/// Fatal pipeline errors
///
/// A missing source table and failed DDL are not errors: they surface as
/// [`crate::clone::CloneOutcome`] values and the run continues or exits cleanly.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid load plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Load failed: {0}")]
    Load(CatalogError),

    #[error(transparent)]
    QualityGate(#[from] QualityGateError),

    #[error("Batch service error: {0}")]
    Batch(CatalogError),

    #[error("Source error: {0}")]
    Source(CatalogError),

    #[error("Stage {stage} exceeded its {secs}s deadline")]
    Timeout { stage: Stage, secs: u64 },
}

impl PipelineError {
    /// Export failure from a catalog error
    pub fn export(e: impl std::fmt::Display) -> Self {
        Self::Export(e.to_string())
    }

    /// Whether the batch should stay open for a retry from the same watermark
    pub fn keeps_batch_open(&self) -> bool {
        matches!(self, Self::QualityGate(_))
    }
}
