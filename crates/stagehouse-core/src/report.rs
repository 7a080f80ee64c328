//! Run report (stable v1)
//!
//! One entry per table processed by a run. Field names are part of the output
//! format; add fields, never rename them.

use serde::{Deserialize, Serialize};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Final state of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Loaded and verified
    Loaded,

    /// Source table missing, nothing done
    NoWork,

    /// Aborted with an error
    Failed,
}

/// Outcome for one source/target pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReport {
    pub source_table: String,
    pub target_table: String,
    pub status: TableStatus,

    /// Last stage reached
    pub stage: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<i64>,

    #[serde(default)]
    pub rows_exported: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_count: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_count: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_diff: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub elapsed_ms: u64,
}

/// Summary statistics for a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub loaded: usize,
    pub no_work: usize,
    pub failed: usize,
}

/// Run report (report.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Summary statistics
    pub summary: ReportSummary,

    /// Per-table outcomes
    pub tables: Vec<TableReport>,

    /// Metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RunReport {
    /// Create a new empty report
    pub fn new() -> Self {
        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary: ReportSummary::default(),
            tables: Vec::new(),
            metadata: None,
        }
    }

    /// Add a table outcome to the report
    pub fn add_table(&mut self, table: TableReport) {
        match table.status {
            TableStatus::Loaded => self.summary.loaded += 1,
            TableStatus::NoWork => self.summary.no_work += 1,
            TableStatus::Failed => self.summary.failed += 1,
        }

        self.summary.total += 1;
        self.tables.push(table);
    }

    /// Check if any table failed
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(status: TableStatus) -> TableReport {
        TableReport {
            source_table: "dbo.users".into(),
            target_table: "edw.users".into(),
            status,
            stage: "closed".into(),
            batch_id: None,
            rows_exported: 0,
            source_count: None,
            target_count: None,
            pct_diff: None,
            error: None,
            elapsed_ms: 1,
        }
    }

    #[test]
    fn empty_report() {
        let report = RunReport::new();
        assert_eq!(report.version, ReportVersion::CURRENT);
        assert_eq!(report.summary.total, 0);
        assert!(!report.has_failures());
    }

    #[test]
    fn summary_counts() {
        let mut report = RunReport::new();
        report.add_table(table(TableStatus::Loaded));
        report.add_table(table(TableStatus::NoWork));
        report.add_table(table(TableStatus::Failed));

        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.loaded, 1);
        assert_eq!(report.summary.no_work, 1);
        assert!(report.has_failures());
    }

    #[test]
    fn report_serialization() {
        let mut report = RunReport::new();
        report.add_table(table(TableStatus::NoWork));
        let json = report.to_json().unwrap();
        assert!(json.contains("\"version\""));
        assert!(json.contains("\"no_work\""));
        assert!(!json.contains("\"batch_id\""));
    }
}
