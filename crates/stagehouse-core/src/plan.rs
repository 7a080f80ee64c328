//! Load plans and the staging artifacts they consume

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Independent COPY directives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Artifact is gzip compressed
    pub gzip: bool,

    /// Artifact URI points at a manifest rather than a data file
    pub manifest: bool,

    /// Strip surrounding quotes from fields
    pub remove_quotes: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gzip: true,
            manifest: false,
            remove_quotes: false,
        }
    }
}

/// How a staging artifact is loaded into its target table
///
/// Only constructed through [`LoadPlanBuilder::build`], which rejects combinations
/// that cannot succeed before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    pub target_table: String,
    pub incremental: bool,
    pub key_fields: Vec<String>,
    pub select_fields: Vec<String>,
    pub delimiter: char,
    pub options: LoadOptions,

    /// Load with `CSV` instead of an explicit delimiter
    pub csv_format: bool,

    /// Rejected rows tolerated before the warehouse fails the COPY
    pub max_errors: u32,
}

impl LoadPlan {
    /// Start building a plan for a target table
    pub fn builder(target_table: impl Into<String>) -> LoadPlanBuilder {
        LoadPlanBuilder::new(target_table)
    }
}

/// Builder for [`LoadPlan`]
#[derive(Debug, Clone)]
pub struct LoadPlanBuilder {
    target_table: String,
    incremental: bool,
    key_fields: Vec<String>,
    select_fields: Vec<String>,
    delimiter: char,
    options: LoadOptions,
    csv_format: bool,
    max_errors: u32,
}

impl LoadPlanBuilder {
    pub fn new(target_table: impl Into<String>) -> Self {
        Self {
            target_table: target_table.into(),
            incremental: false,
            key_fields: Vec::new(),
            select_fields: Vec::new(),
            delimiter: '\t',
            options: LoadOptions::default(),
            csv_format: false,
            max_errors: 0,
        }
    }

    /// Merge by key instead of truncate-and-load
    pub fn incremental(mut self, key_fields: Vec<String>) -> Self {
        self.incremental = true;
        self.key_fields = key_fields;
        self
    }

    pub fn select_fields(mut self, fields: Vec<String>) -> Self {
        self.select_fields = fields;
        self
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn gzip(mut self, gzip: bool) -> Self {
        self.options.gzip = gzip;
        self
    }

    pub fn remove_quotes(mut self, remove_quotes: bool) -> Self {
        self.options.remove_quotes = remove_quotes;
        self
    }

    pub fn manifest(mut self, manifest: bool) -> Self {
        self.options.manifest = manifest;
        self
    }

    pub fn csv_format(mut self, csv_format: bool) -> Self {
        self.csv_format = csv_format;
        self
    }

    pub fn max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Validate and produce the plan
    pub fn build(self) -> Result<LoadPlan, PlanError> {
        if self.target_table.trim().is_empty() {
            return Err(PlanError::MissingTarget);
        }
        if self.incremental && self.key_fields.is_empty() {
            return Err(PlanError::MissingKeyFields(self.target_table));
        }
        if !self.select_fields.is_empty() && !self.options.remove_quotes {
            return Err(PlanError::SelectRequiresRemoveQuotes(self.target_table));
        }

        Ok(LoadPlan {
            target_table: self.target_table,
            incremental: self.incremental,
            key_fields: self.key_fields,
            select_fields: self.select_fields,
            delimiter: self.delimiter,
            options: self.options,
            csv_format: self.csv_format,
            max_errors: self.max_errors,
        })
    }
}

/// Invalid load plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Load plan has no target table")]
    MissingTarget,

    #[error("Incremental load of {0} requires key fields")]
    MissingKeyFields(String),

    #[error("Select fields for {0} require the remove-quotes option")]
    SelectRequiresRemoveQuotes(String),
}

/// Delimited file staged in object storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingArtifact {
    /// Addressable URI, e.g. `s3://bucket/stagehouse/prod/edw-users/output.tsv.gz`
    pub uri: String,

    /// Object key within the bucket
    pub key: String,

    pub delimiter: char,
    pub compressed: bool,

    /// Data rows written
    pub row_count: u64,
}

/// Incremental cursor handed out by the batch service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Rows changed after this instant are extracted
    pub from_date: NaiveDateTime,

    pub batch_id: i64,
}
