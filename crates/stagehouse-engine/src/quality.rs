//! Row-count reconciliation between source and target

use serde::Serialize;
use tracing::{error, info};

/// Default tolerated fraction of missing rows
pub const DEFAULT_THRESHOLD: f64 = 0.01;

/// Outcome of a count comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DqResult {
    pub src_count: i64,
    pub tgt_count: i64,

    /// `src_count - tgt_count`
    pub diff: i64,

    /// `diff / max(src_count, 1)`
    pub pct_diff: f64,
}

/// Count mismatch beyond tolerance
#[derive(Debug, Clone, PartialEq)]
pub struct QualityGateError {
    pub result: DqResult,
    pub threshold: f64,
}

impl std::fmt::Display for QualityGateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Quality gate failed: source has {} rows, target has {} (diff={}, pct_diff={:.4} > threshold {})",
            self.result.src_count, self.result.tgt_count, self.result.diff, self.result.pct_diff, self.threshold
        )
    }
}

impl std::error::Error for QualityGateError {}

/// Compare counts; fails iff `pct_diff > threshold`
pub fn check(src_count: i64, tgt_count: i64, threshold: f64) -> Result<DqResult, QualityGateError> {
    let diff = src_count - tgt_count;
    let pct_diff = diff as f64 / src_count.max(1) as f64;
    let result = DqResult {
        src_count,
        tgt_count,
        diff,
        pct_diff,
    };

    if pct_diff > threshold {
        let err = QualityGateError { result, threshold };
        error!("{}", err);
        Err(err)
    } else {
        info!(
            "Quality gate passed: src={} tgt={} diff={} pct_diff={:.4}",
            src_count, tgt_count, diff, pct_diff
        );
        Ok(result)
    }
}

/// Quality gate bound to a configured threshold
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    threshold: f64,
}

impl QualityGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn check(&self, src_count: i64, tgt_count: i64) -> Result<DqResult, QualityGateError> {
        check(src_count, tgt_count, self.threshold)
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}
