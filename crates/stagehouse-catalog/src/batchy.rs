//! Batchy batch-control service client
//!
//! Batchy hands out the watermark for a workflow and records whether each run
//! closed or failed. All endpoints are `GET /<action>/<workflow>` returning JSON.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let client = BatchyClient::new(&config.batch.unwrap_or_default())?;
//! let watermark = client.open("wf_users").await?;
//! // ... run the pipeline ...
//! client.close("wf_users").await?;
//! ```

#[cfg(feature = "batchy")]
use crate::adapter::BatchService;
use crate::adapter::CatalogError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use stagehouse_core::config::BatchConfig;
use stagehouse_core::Watermark;

/// Base URL of the service
///
/// Behind the HTTP gateway (port 80 on a gateway host) the service lives under
/// `/batchy`; anywhere else it is addressed by host and port.
pub fn base_url(config: &BatchConfig) -> String {
    if config.port == "80" && config.server.contains(&config.gateway) {
        format!("http://{}/batchy", config.server)
    } else {
        format!("http://{}:{}", config.server, config.port)
    }
}

fn parse_from_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Extract the watermark from an `open_batch` response
///
/// Expected shape: `{"global": {"from_date": "...", "batch_id": N}}`.
pub fn parse_open_response(body: &serde_json::Value) -> Result<Watermark, CatalogError> {
    let global = body
        .get("global")
        .ok_or_else(|| CatalogError::Batch("open_batch response has no 'global' section".to_string()))?;

    let raw_date = global
        .get("from_date")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CatalogError::Batch("open_batch response has no from_date".to_string()))?;
    let from_date = parse_from_date(raw_date)
        .ok_or_else(|| CatalogError::Batch(format!("Unparseable from_date '{}'", raw_date)))?;

    let batch_id = match global.get("batch_id") {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| CatalogError::Batch("open_batch response has no batch_id".to_string()))?;

    Ok(Watermark { from_date, batch_id })
}

/// Roll-up of the per-task status map returned by `get_status`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStatusSummary {
    pub batch_id: Option<i64>,

    /// `failure` if any task failed, else `open` if any is open, else `success`
    pub status: String,
    pub failure_count: usize,
    pub open_count: usize,
    pub batch_start: Option<String>,
    pub batch_end: Option<String>,
}

/// Summarize a `get_status` response into a single workflow status
pub fn summarize_status(details: &serde_json::Value) -> BatchStatusSummary {
    let mut summary = BatchStatusSummary::default();

    if let Some(tasks) = details.as_object() {
        for task in tasks.values() {
            match task.get("status").and_then(|s| s.as_str()) {
                Some("failure") => summary.failure_count += 1,
                Some("open") => summary.open_count += 1,
                _ => {}
            }

            if let Some(start) = task.get("batch_start").and_then(|v| v.as_str()) {
                if summary.batch_start.as_deref().map_or(true, |cur| start < cur) {
                    summary.batch_start = Some(start.to_string());
                }
            }
            if let Some(end) = task.get("batch_end").and_then(|v| v.as_str()) {
                if summary.batch_end.as_deref().map_or(true, |cur| end > cur) {
                    summary.batch_end = Some(end.to_string());
                }
            }
            if let Some(id) = task.get("batch_id").and_then(|v| v.as_i64()) {
                summary.batch_id = Some(id);
            }
        }
    }

    summary.status = if summary.failure_count > 0 {
        "failure"
    } else if summary.open_count > 0 {
        "open"
    } else {
        "success"
    }
    .to_string();

    summary
}

/// HTTP client for Batchy
#[cfg(feature = "batchy")]
#[derive(Debug, Clone)]
pub struct BatchyClient {
    http: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "batchy")]
impl BatchyClient {
    /// Create a client for the configured server
    pub fn new(config: &BatchConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| CatalogError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url(config),
        })
    }

    async fn call(&self, action: &str, workflow: &str) -> Result<serde_json::Value, CatalogError> {
        let url = format!("{}/{}/{}", self.base_url, action, workflow);
        tracing::debug!("Batchy request: {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Batch(format!("{} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Batch(format!("{} returned HTTP {}", url, status)));
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::Batch(format!("{} returned invalid JSON: {}", url, e)))
    }

    /// Raw per-task status of a workflow
    pub async fn status(&self, workflow: &str) -> Result<serde_json::Value, CatalogError> {
        self.call("get_status", workflow).await
    }

    /// Workflow status rolled up into one value
    pub async fn status_summary(&self, workflow: &str) -> Result<BatchStatusSummary, CatalogError> {
        Ok(summarize_status(&self.status(workflow).await?))
    }
}

#[cfg(feature = "batchy")]
#[async_trait::async_trait]
impl BatchService for BatchyClient {
    async fn open(&self, workflow: &str) -> Result<Watermark, CatalogError> {
        let body = self.call("open_batch", workflow).await?;
        parse_open_response(&body)
    }

    async fn close(&self, workflow: &str) -> Result<(), CatalogError> {
        self.call("close_batch", workflow).await.map(|_| ())
    }

    async fn fail(&self, workflow: &str) -> Result<(), CatalogError> {
        self.call("fail_batch", workflow).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url() {
        let direct = BatchConfig::default();
        assert_eq!(base_url(&direct), "http://0.0.0.0:8050");

        let gateway = BatchConfig {
            server: "hypergate.internal".to_string(),
            port: "80".to_string(),
            ..BatchConfig::default()
        };
        assert_eq!(base_url(&gateway), "http://hypergate.internal/batchy");

        let plain_http = BatchConfig {
            server: "batch.internal".to_string(),
            port: "80".to_string(),
            ..BatchConfig::default()
        };
        assert_eq!(base_url(&plain_http), "http://batch.internal:80");
    }

    #[test]
    fn test_parse_open_response() {
        let body = json!({"global": {"from_date": "2019-10-23T15:55:41.498998", "batch_id": 42}});
        let wm = parse_open_response(&body).unwrap();
        assert_eq!(wm.batch_id, 42);
        assert_eq!(wm.from_date.format("%Y-%m-%d %H:%M").to_string(), "2019-10-23 15:55");

        let body = json!({"global": {"from_date": "2019-10-23T07:53:51Z", "batch_id": "7"}});
        assert_eq!(parse_open_response(&body).unwrap().batch_id, 7);

        let body = json!({"global": {"from_date": "1776-07-04", "batch_id": 1}});
        assert_eq!(parse_open_response(&body).unwrap().from_date.to_string(), "1776-07-04 00:00:00");
    }

    #[test]
    fn test_parse_open_response_errors() {
        assert!(matches!(parse_open_response(&json!({})), Err(CatalogError::Batch(_))));
        let body = json!({"global": {"from_date": "yesterday", "batch_id": 1}});
        assert!(matches!(parse_open_response(&body), Err(CatalogError::Batch(_))));
    }

    #[test]
    fn test_summarize_status() {
        let details = json!({
            "extract": {"status": "success", "batch_id": 9, "batch_start": "2024-01-01 01:00", "batch_end": "2024-01-01 02:00"},
            "load": {"status": "open", "batch_id": 9, "batch_start": "2024-01-01 00:30", "batch_end": "2024-01-01 01:30"}
        });
        let summary = summarize_status(&details);
        assert_eq!(summary.status, "open");
        assert_eq!(summary.open_count, 1);
        assert_eq!(summary.batch_id, Some(9));
        assert_eq!(summary.batch_start.as_deref(), Some("2024-01-01 00:30"));
        assert_eq!(summary.batch_end.as_deref(), Some("2024-01-01 02:00"));

        let failed = json!({"a": {"status": "failure"}, "b": {"status": "open"}});
        assert_eq!(summarize_status(&failed).status, "failure");
    }
}
