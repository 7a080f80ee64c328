//! Stage-to-warehouse pipeline for one table
//!
//! ```text
//! Init -> SchemaReady -> Exported -> Loaded -> Verified -> Closed
//!              \______________________________________________/
//!                        no source table: nothing to do
//! ```
//!
//! Every stage runs under the configured deadline. Once a batch watermark has
//! been opened, any fatal error marks the batch failed, except a quality gate
//! failure which leaves it open so the next run retries from the same watermark.
//! A watermark handed in with the job belongs to the caller, who settles that
//! batch itself; the pipeline then never closes or fails it.

use crate::clone::SchemaCloner;
use crate::error::PipelineError;
use crate::exporter::{ExportRequest, StagingExporter};
use crate::loader::WarehouseLoader;
use crate::quality::{DqResult, QualityGate};
use chrono::Utc;
use serde::Serialize;
use stagehouse_catalog::{BatchService, ObjectStorage, SourceDatabase, TableName, TargetWarehouse};
use stagehouse_core::{Config, LineageValues, LoadPlan, Watermark};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    SchemaReady,
    Exported,
    Loaded,
    Verified,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::SchemaReady => "schema_ready",
            Self::Exported => "exported",
            Self::Loaded => "loaded",
            Self::Verified => "verified",
            Self::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// One source/target pair and how to move it
#[derive(Debug, Clone)]
pub struct TableJob {
    pub source: TableName,
    pub target: TableName,
    pub plan: LoadPlan,

    /// Columns compared against the watermark
    pub date_fields: Vec<String>,

    /// Batch-service workflow; without one the whole table is extracted
    pub workflow: Option<String>,

    /// Value of the `etl_source_system_cd` lineage column
    pub source_system: Option<String>,

    /// Watermark already opened by the caller for `workflow`; the caller also
    /// closes or fails that batch
    pub watermark: Option<Watermark>,
}

impl TableJob {
    pub fn new(source: TableName, target: TableName, plan: LoadPlan) -> Self {
        Self {
            source,
            target,
            plan,
            date_fields: Vec::new(),
            workflow: None,
            source_system: None,
            watermark: None,
        }
    }

    pub fn with_date_fields(mut self, date_fields: Vec<String>) -> Self {
        self.date_fields = date_fields;
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn with_source_system(mut self, source_system: impl Into<String>) -> Self {
        self.source_system = Some(source_system.into());
        self
    }

    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = Some(watermark);
        self
    }
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub target_table: String,

    /// Batch the run belonged to; `None` without a workflow
    pub batch_id: Option<i64>,

    /// `Closed` after a full run or an early exit
    pub stage: Stage,

    /// Whether the source table was missing and nothing was done
    pub no_source: bool,

    pub rows_exported: u64,
    pub dq: Option<DqResult>,
}

/// A failed run together with how far it got
#[derive(Debug)]
pub struct RunFailure {
    pub stage: Stage,
    pub batch_id: Option<i64>,
    pub error: PipelineError,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after stage {})", self.error, self.stage)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Moves one table from the source into the warehouse
pub struct StageToWarehouse<'a> {
    source: &'a dyn SourceDatabase,
    target: &'a dyn TargetWarehouse,
    storage: &'a dyn ObjectStorage,
    batch: Option<&'a dyn BatchService>,
    config: &'a Config,
}

impl<'a> StageToWarehouse<'a> {
    pub fn new(
        source: &'a dyn SourceDatabase,
        target: &'a dyn TargetWarehouse,
        storage: &'a dyn ObjectStorage,
        config: &'a Config,
    ) -> Self {
        Self {
            source,
            target,
            storage,
            batch: None,
            config,
        }
    }

    pub fn with_batch_service(mut self, batch: Option<&'a dyn BatchService>) -> Self {
        self.batch = batch;
        self
    }

    /// Run every stage for `job`
    pub async fn run(&self, job: &TableJob) -> Result<RunOutcome, PipelineError> {
        self.run_tracked(job).await.map_err(|f| f.error)
    }

    /// Like [`run`](Self::run), but a failure also reports the last stage reached
    pub async fn run_tracked(&self, job: &TableJob) -> Result<RunOutcome, RunFailure> {
        let mut stage = Stage::Init;
        let mut batch_id = None;

        let watermark = self.open_batch(job).await.map_err(|error| RunFailure {
            stage,
            batch_id,
            error,
        })?;
        batch_id = watermark.as_ref().map(|w| w.batch_id);

        match self.run_stages(job, watermark.as_ref(), &mut stage).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                error!("{} failed after stage {}: {}", job.target, stage, error);
                if watermark.is_some() && owns_batch(job) && !error.keeps_batch_open() {
                    self.fail_batch(job).await;
                }
                Err(RunFailure { stage, batch_id, error })
            }
        }
    }

    async fn open_batch(&self, job: &TableJob) -> Result<Option<Watermark>, PipelineError> {
        if let Some(watermark) = &job.watermark {
            return Ok(Some(watermark.clone()));
        }

        match (&job.workflow, self.batch) {
            (Some(workflow), Some(batch)) => {
                let watermark = self
                    .within(Stage::Init, batch.open(workflow))
                    .await?
                    .map_err(PipelineError::Batch)?;
                info!(
                    "opened batch {} for {}, from_date {}",
                    watermark.batch_id, workflow, watermark.from_date
                );
                Ok(Some(watermark))
            }
            (Some(workflow), None) => {
                warn!("no batch service configured, ignoring workflow {}", workflow);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn fail_batch(&self, job: &TableJob) {
        if let (Some(workflow), Some(batch)) = (&job.workflow, self.batch) {
            if let Err(e) = batch.fail(workflow).await {
                warn!("Failed to mark batch of {} failed: {}", workflow, e);
            }
        }
    }

    async fn run_stages(
        &self,
        job: &TableJob,
        watermark: Option<&Watermark>,
        stage: &mut Stage,
    ) -> Result<RunOutcome, PipelineError> {
        let batch_id = watermark.map(|w| w.batch_id);
        let mut outcome = RunOutcome {
            target_table: job.target.fqn(),
            batch_id,
            stage: Stage::Init,
            no_source: false,
            rows_exported: 0,
            dq: None,
        };

        let cloner = SchemaCloner::new(self.source, self.target);
        let cloned = self
            .within(Stage::SchemaReady, cloner.clone_table(&job.source, &job.target, job.plan.incremental))
            .await??;
        *stage = Stage::SchemaReady;
        info!("{}: {}", job.target, stage);

        if cloned.is_no_source() {
            outcome.no_source = true;
            self.close(job, stage, &mut outcome).await?;
            return Ok(outcome);
        }

        let src_count = self
            .within(Stage::Exported, self.source.count(&job.source.fqn()))
            .await?
            .map_err(PipelineError::Source)?;
        info!("{} has {} rows", job.source, src_count);

        let lineage = LineageValues::new(job.source_system.as_deref(), Utc::now());
        let exporter = StagingExporter::new(self.source, self.target, self.storage, self.config);
        let request = ExportRequest {
            source_table: &job.source,
            target_table: &job.target,
            plan: &job.plan,
            date_fields: &job.date_fields,
            from_date: watermark.map(|w| w.from_date),
            lineage: &lineage,
        };
        let artifact = self.within(Stage::Exported, exporter.export(&request)).await??;
        outcome.rows_exported = artifact.row_count;
        *stage = Stage::Exported;
        info!("{}: {} ({} rows to {})", job.target, stage, artifact.row_count, artifact.uri);

        let loader = WarehouseLoader::new(self.target, self.storage, self.config);
        self.within(Stage::Loaded, loader.load(&artifact, &job.plan)).await??;
        *stage = Stage::Loaded;
        info!("{}: {}", job.target, stage);

        let tgt_count = self
            .within(Stage::Verified, self.target.count(&job.target.fqn()))
            .await?
            .map_err(PipelineError::Load)?;
        let dq = QualityGate::new(self.config.quality.threshold).check(src_count, tgt_count)?;
        outcome.dq = Some(dq);
        *stage = Stage::Verified;
        info!("{}: {}", job.target, stage);

        self.close(job, stage, &mut outcome).await?;
        Ok(outcome)
    }

    async fn close(&self, job: &TableJob, stage: &mut Stage, outcome: &mut RunOutcome) -> Result<(), PipelineError> {
        match (&job.workflow, self.batch, outcome.batch_id) {
            (Some(workflow), Some(_), Some(_)) if !owns_batch(job) => {
                debug!("batch for {} is settled by the caller", workflow);
            }
            (Some(workflow), Some(batch), Some(_)) => {
                self.within(Stage::Closed, batch.close(workflow))
                    .await?
                    .map_err(PipelineError::Batch)?;
                info!("closed batch for {}", workflow);
            }
            _ => {}
        }
        *stage = Stage::Closed;
        outcome.stage = Stage::Closed;
        info!("{}: {}", job.target, stage);
        Ok(())
    }

    /// Bound a stage by the configured deadline
    async fn within<F, T>(&self, stage: Stage, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = T>,
    {
        let limit: Duration = self.config.runtime.stage_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PipelineError::Timeout {
                stage,
                secs: limit.as_secs(),
            })
    }
}

/// Whether the pipeline opened the job's batch and so has to settle it
fn owns_batch(job: &TableJob) -> bool {
    job.watermark.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::SchemaReady.to_string(), "schema_ready");
        assert_eq!(serde_json::to_string(&Stage::Closed).unwrap(), "\"closed\"");
    }

    #[test]
    fn test_table_job_builder() {
        let plan = LoadPlan::builder("edw.users").build().unwrap();
        let job = TableJob::new(TableName::new("dbo", "users"), TableName::new("edw", "users"), plan)
            .with_workflow("wf_users")
            .with_date_fields(vec!["updated".to_string()]);

        assert_eq!(job.workflow.as_deref(), Some("wf_users"));
        assert_eq!(job.date_fields.len(), 1);
        assert!(job.watermark.is_none());
    }
}
