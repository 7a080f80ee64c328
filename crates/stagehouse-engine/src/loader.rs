//! Loading staged artifacts into the warehouse

use crate::error::PipelineError;
use bytes::Bytes;
use stagehouse_catalog::{ObjectStorage, TargetWarehouse};
use stagehouse_core::config::GrantConfig;
use stagehouse_core::{Config, CopyCredentials, LoadPlan, StagingArtifact};
use stagehouse_sql::{grant_statements, manifest_json, redact_credentials, LoadScript};
use tracing::{debug, info, warn};

/// Redshift manifest listing `urls`, all mandatory
pub fn build_manifest(urls: &[String]) -> String {
    manifest_json(urls)
}

/// Runs the COPY script for an artifact in a single transaction
pub struct WarehouseLoader<'a> {
    target: &'a dyn TargetWarehouse,
    storage: &'a dyn ObjectStorage,
    credentials: Option<&'a CopyCredentials>,
    grants: &'a [GrantConfig],
    redact: bool,
}

impl<'a> WarehouseLoader<'a> {
    pub fn new(target: &'a dyn TargetWarehouse, storage: &'a dyn ObjectStorage, config: &'a Config) -> Self {
        Self {
            target,
            storage,
            credentials: config.copy_credentials.as_ref(),
            grants: &config.loader.grants,
            redact: config.redact_sensitive_data,
        }
    }

    /// Upload a manifest for `urls` under `key`, returning its URI
    pub async fn stage_manifest(&self, key: &str, urls: &[String]) -> Result<String, PipelineError> {
        let body = build_manifest(urls);
        debug!("manifest {}: {}", key, body);
        self.storage
            .put_bytes(key, Bytes::from(body))
            .await
            .map_err(PipelineError::Load)
    }

    /// Load `artifact` into the plan's target table
    ///
    /// Nothing is committed unless every statement succeeds. Grants run after
    /// the commit and only warn on failure.
    pub async fn load(&self, artifact: &StagingArtifact, plan: &LoadPlan) -> Result<(), PipelineError> {
        let uri = if plan.options.manifest {
            let key = format!("{}.manifest", artifact.key);
            self.stage_manifest(&key, &[artifact.uri.clone()]).await?
        } else {
            artifact.uri.clone()
        };

        let credentials = self.credentials.map(CopyCredentials::clause_value);
        let script = LoadScript::for_plan(plan, &uri, credentials.as_deref());

        for statement in &script.statements {
            debug!("{}", self.loggable(statement));
        }

        if let Err(e) = self.target.execute_transaction(&script.statements).await {
            if e.is_missing_table() {
                warn!("{} does not exist; its DDL was likely rejected earlier", plan.target_table);
            }
            return Err(PipelineError::Load(e));
        }

        info!(
            "{} load of {} complete",
            if plan.incremental { "incremental" } else { "full" },
            plan.target_table
        );

        for grant in grant_statements(&plan.target_table, self.grants) {
            debug!("{}", grant);
            match self.target.execute(&grant).await {
                Ok(_) => {}
                Err(e) if e.is_permission_denied() => {
                    warn!("Not allowed to grant on {}: {}", plan.target_table, e)
                }
                Err(e) => warn!("Grant on {} failed: {}", plan.target_table, e),
            }
        }

        Ok(())
    }

    fn loggable(&self, sql: &str) -> String {
        if self.redact {
            redact_credentials(sql)
        } else {
            sql.to_string()
        }
    }
}
