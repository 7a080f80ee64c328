//! Target table creation from the source catalog
//!
//! The cloner introspects the source table, translates its columns and creates
//! the target. It never aborts a run on bad DDL: the failure is logged and the
//! load that follows surfaces the real problem.

use crate::error::PipelineError;
use stagehouse_catalog::{SourceDatabase, TableName, TargetWarehouse};
use stagehouse_core::TableClone;
use stagehouse_sql::{redact_credentials, SchemaTranslator};
use tracing::{debug, info, warn};

/// What cloning did to the target
#[derive(Debug, Clone, PartialEq)]
pub enum CloneOutcome {
    /// Source table has no columns; there is no work to do
    NoSource,

    /// Incremental load into an existing target; the table is left as is
    Skipped,

    /// Target dropped and recreated
    Created(TableClone),

    /// DDL was rejected; the run continues with whatever target exists
    Failed(TableClone),
}

impl CloneOutcome {
    /// Whether the pipeline should stop without extracting anything
    pub fn is_no_source(&self) -> bool {
        matches!(self, Self::NoSource)
    }
}

/// Applies translated DDL to the target warehouse
pub struct SchemaCloner<'a> {
    source: &'a dyn SourceDatabase,
    target: &'a dyn TargetWarehouse,
}

impl<'a> SchemaCloner<'a> {
    pub fn new(source: &'a dyn SourceDatabase, target: &'a dyn TargetWarehouse) -> Self {
        Self { source, target }
    }

    /// Clone `source_table` into `target_table`
    ///
    /// Full loads always recreate the target. Incremental loads only create it
    /// when it does not exist yet.
    pub async fn clone_table(
        &self,
        source_table: &TableName,
        target_table: &TableName,
        incremental: bool,
    ) -> Result<CloneOutcome, PipelineError> {
        let columns = self
            .source
            .describe_columns(source_table)
            .await
            .map_err(PipelineError::Source)?;

        if columns.is_empty() {
            info!("no source found for {}, no work to do", source_table);
            return Ok(CloneOutcome::NoSource);
        }

        if incremental {
            let exists = self
                .target
                .table_exists(target_table)
                .await
                .map_err(PipelineError::Load)?;
            if exists {
                debug!("{} exists, keeping it for incremental load", target_table);
                return Ok(CloneOutcome::Skipped);
            }
        }

        let Some(clone) = SchemaTranslator::translate(&source_table.fqn(), &target_table.fqn(), &columns) else {
            return Ok(CloneOutcome::NoSource);
        };

        for statement in [SchemaTranslator::drop_statement(&clone), SchemaTranslator::create_statement(&clone)] {
            debug!("{}", statement);
            if let Err(e) = self.target.execute(&statement).await {
                warn!(
                    "DDL for {} failed, continuing with the existing target\n  SQL: {}\n  Error: {}",
                    target_table,
                    redact_credentials(&statement),
                    e
                );
                return Ok(CloneOutcome::Failed(clone));
            }
        }

        info!("created {} with {} columns", target_table, clone.columns.len());
        Ok(CloneOutcome::Created(clone))
    }
}
