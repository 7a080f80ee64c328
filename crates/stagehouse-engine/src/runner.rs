//! Runs many table jobs with bounded concurrency
//!
//! Each job gets its own source and target connections from a
//! [`ConnectionFactory`]; object storage, the batch service and configuration are
//! shared. A failing table never stops its siblings, it is reported instead.

use crate::pipeline::{Stage, StageToWarehouse, TableJob};
use stagehouse_catalog::{BatchService, CatalogError, ObjectStorage, SourceDatabase, TargetWarehouse};
use stagehouse_core::{Config, RunReport, TableReport, TableStatus, Watermark};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Opens the connection pair a worker uses for one table
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn source(&self) -> Result<Box<dyn SourceDatabase>, CatalogError>;

    async fn target(&self) -> Result<Box<dyn TargetWarehouse>, CatalogError>;
}

/// Drives a list of [`TableJob`]s to a [`RunReport`]
pub struct TableRunner {
    factory: Arc<dyn ConnectionFactory>,
    storage: Arc<dyn ObjectStorage>,
    batch: Option<Arc<dyn BatchService>>,
    config: Arc<Config>,
}

impl TableRunner {
    pub fn new(factory: Arc<dyn ConnectionFactory>, storage: Arc<dyn ObjectStorage>, config: Arc<Config>) -> Self {
        Self {
            factory,
            storage,
            batch: None,
            config,
        }
    }

    pub fn with_batch_service(mut self, batch: Arc<dyn BatchService>) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Run all jobs, at most `runtime.workers` at a time
    ///
    /// Jobs sharing a workflow share one batch: it is opened once here, every
    /// job extracts from the same watermark, and the batch is settled once all
    /// of them have finished.
    pub async fn run(&self, jobs: Vec<TableJob>) -> RunReport {
        let total = jobs.len();
        let workers = self.config.runtime.workers.max(1);
        info!("running {} table(s) with {} worker(s)", total, workers);

        let watermarks = self.open_shared_batches(&jobs).await;
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut slots: Vec<Option<(TableReport, Settlement)>> = vec![None; total];
        let mut pending: Vec<(String, String)> = Vec::with_capacity(total);
        let mut workflows: Vec<Option<String>> = Vec::with_capacity(total);
        let mut set = JoinSet::new();

        for (idx, mut job) in jobs.into_iter().enumerate() {
            pending.push((job.source.fqn(), job.target.fqn()));
            workflows.push(job.workflow.clone());

            if let Some(workflow) = job.workflow.clone() {
                match watermarks.get(&workflow) {
                    Some(Ok(watermark)) => job.watermark = Some(watermark.clone()),
                    Some(Err(e)) => {
                        let report = failed_report(&job.source.fqn(), &job.target.fqn(), "init", e, 0);
                        slots[idx] = Some((report, Settlement::Fail));
                        continue;
                    }
                    None => {}
                }
            }

            let semaphore = Arc::clone(&semaphore);
            let factory = Arc::clone(&self.factory);
            let storage = Arc::clone(&self.storage);
            let batch = self.batch.clone();
            let config = Arc::clone(&self.config);

            set.spawn(async move {
                // the semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                let finished = run_job(factory.as_ref(), storage.as_ref(), batch.as_deref(), &config, &job).await;
                (idx, finished)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, finished)) => slots[idx] = Some(finished),
                Err(e) => error!("table worker aborted: {}", e),
            }
        }

        let mut finished: Vec<(TableReport, Settlement)> = slots
            .into_iter()
            .zip(pending)
            .map(|(slot, (source, target))| {
                slot.unwrap_or_else(|| (failed_report(&source, &target, "init", "worker aborted", 0), Settlement::Fail))
            })
            .collect();

        self.settle_shared_batches(&watermarks, &workflows, &mut finished).await;

        let mut report = RunReport::new();
        for (table, _) in finished {
            report.add_table(table);
        }

        info!(
            "run finished: {} loaded, {} no work, {} failed",
            report.summary.loaded, report.summary.no_work, report.summary.failed
        );
        report
    }

    async fn open_shared_batches(&self, jobs: &[TableJob]) -> HashMap<String, Result<Watermark, String>> {
        let mut watermarks = HashMap::new();
        let Some(batch) = &self.batch else {
            return watermarks;
        };

        for workflow in jobs.iter().filter(|j| j.watermark.is_none()).filter_map(|j| j.workflow.as_ref()) {
            if watermarks.contains_key(workflow) {
                continue;
            }
            let opened = batch.open(workflow).await.map_err(|e| {
                error!("Failed to open batch for {}: {}", workflow, e);
                format!("Batch service error: {}", e)
            });
            watermarks.insert(workflow.clone(), opened);
        }
        watermarks
    }

    /// Close, fail or keep open every batch opened by [`Self::open_shared_batches`]
    ///
    /// A batch closes only when all of its tables loaded or had no work. Any
    /// other failure fails it; a quality gate failure alone leaves it open.
    async fn settle_shared_batches(
        &self,
        watermarks: &HashMap<String, Result<Watermark, String>>,
        workflows: &[Option<String>],
        finished: &mut [(TableReport, Settlement)],
    ) {
        let Some(batch) = &self.batch else {
            return;
        };

        let mut settled: Vec<&str> = Vec::new();
        for workflow in workflows.iter().flatten() {
            if settled.contains(&workflow.as_str()) || !matches!(watermarks.get(workflow), Some(Ok(_))) {
                continue;
            }
            settled.push(workflow);

            let members: Vec<usize> = workflows
                .iter()
                .enumerate()
                .filter(|(_, w)| w.as_deref() == Some(workflow.as_str()))
                .map(|(idx, _)| idx)
                .collect();
            let settlement = members
                .iter()
                .map(|&idx| finished[idx].1)
                .max()
                .unwrap_or(Settlement::Close);

            match settlement {
                Settlement::Close => match batch.close(workflow).await {
                    Ok(()) => info!("closed batch for {}", workflow),
                    Err(e) => {
                        error!("Failed to close batch for {}: {}", workflow, e);
                        for &idx in &members {
                            unsettled(&mut finished[idx].0, &e);
                        }
                    }
                },
                Settlement::KeepOpen => {
                    warn!("leaving batch for {} open, a table failed its quality gate", workflow)
                }
                Settlement::Fail => match batch.fail(workflow).await {
                    Ok(()) => info!("marked batch for {} failed", workflow),
                    Err(e) => warn!("Failed to mark batch of {} failed: {}", workflow, e),
                },
            }
        }
    }
}

/// What a finished job asks of its shared batch, in increasing precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Settlement {
    Close,
    KeepOpen,
    Fail,
}

/// A table whose work finished but whose batch could not be closed
fn unsettled(report: &mut TableReport, e: &CatalogError) {
    let last_stage = match report.status {
        TableStatus::NoWork => Stage::SchemaReady,
        _ => Stage::Verified,
    };
    if report.status != TableStatus::Failed {
        report.status = TableStatus::Failed;
        report.stage = last_stage.to_string();
        report.error = Some(format!("Batch service error: {}", e));
    }
}

async fn run_job(
    factory: &dyn ConnectionFactory,
    storage: &dyn ObjectStorage,
    batch: Option<&dyn BatchService>,
    config: &Config,
    job: &TableJob,
) -> (TableReport, Settlement) {
    let started = Instant::now();
    let (source_table, target_table) = (job.source.fqn(), job.target.fqn());

    let connections = async {
        let source = factory.source().await?;
        let target = factory.target().await?;
        Ok::<_, CatalogError>((source, target))
    }
    .await;

    let (source, target) = match connections {
        Ok(pair) => pair,
        Err(e) => {
            error!("{}: could not connect: {}", target_table, e);
            let report = failed_report(&source_table, &target_table, "init", e, elapsed_ms(started));
            return (report, Settlement::Fail);
        }
    };

    let pipeline = StageToWarehouse::new(source.as_ref(), target.as_ref(), storage, config).with_batch_service(batch);

    match pipeline.run_tracked(job).await {
        Ok(outcome) => {
            let report = TableReport {
                source_table,
                target_table,
                status: if outcome.no_source { TableStatus::NoWork } else { TableStatus::Loaded },
                stage: outcome.stage.to_string(),
                batch_id: outcome.batch_id,
                rows_exported: outcome.rows_exported,
                source_count: outcome.dq.map(|dq| dq.src_count),
                target_count: outcome.dq.map(|dq| dq.tgt_count),
                pct_diff: outcome.dq.map(|dq| dq.pct_diff),
                error: None,
                elapsed_ms: elapsed_ms(started),
            };
            (report, Settlement::Close)
        }
        Err(failure) => {
            let settlement = if failure.error.keeps_batch_open() {
                Settlement::KeepOpen
            } else {
                Settlement::Fail
            };
            let dq = match &failure.error {
                crate::PipelineError::QualityGate(e) => Some(e.result),
                _ => None,
            };
            let report = TableReport {
                source_table,
                target_table,
                status: TableStatus::Failed,
                stage: failure.stage.to_string(),
                batch_id: failure.batch_id,
                rows_exported: 0,
                source_count: dq.map(|d| d.src_count),
                target_count: dq.map(|d| d.tgt_count),
                pct_diff: dq.map(|d| d.pct_diff),
                error: Some(failure.error.to_string()),
                elapsed_ms: elapsed_ms(started),
            };
            (report, settlement)
        }
    }
}

fn failed_report(
    source_table: &str,
    target_table: &str,
    stage: &str,
    error: impl std::fmt::Display,
    elapsed_ms: u64,
) -> TableReport {
    TableReport {
        source_table: source_table.to_string(),
        target_table: target_table.to_string(),
        status: TableStatus::Failed,
        stage: stage.to_string(),
        batch_id: None,
        rows_exported: 0,
        source_count: None,
        target_count: None,
        pct_diff: None,
        error: Some(error.to_string()),
        elapsed_ms,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
