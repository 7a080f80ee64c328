//! Row values fetched from a source and their staging-file rendering

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal written for SQL NULL; the COPY statement declares `NULL AS 'None'`
pub const NULL_LITERAL: &str = "None";

/// Format of lineage timestamps
pub const LINEAGE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

/// One source row, in select-list order
pub type Row = Vec<Value>;

impl Value {
    /// Render for a one-row-per-line staging file
    ///
    /// Booleans become `0`/`1`; newline, tab, carriage return and vertical tab are
    /// replaced with a space in every other value.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Self::Null => NULL_LITERAL.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Text(s) => strip_line_breaks(s),
            Self::Timestamp(ts) => ts.to_string(),
            Self::Date(d) => d.to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

fn strip_line_breaks(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\n' | '\t' | '\r' | '\x0B' => ' ',
            other => other,
        })
        .collect()
}

/// Lineage values appended to every staged row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageValues {
    pub source_system_cd: String,
    pub row_create_dts: String,
    pub row_update_dts: String,

    /// Epoch seconds at the start of the run
    pub run_id: i64,
}

impl LineageValues {
    /// Lineage for a run that started at `etl_date`
    pub fn new(source_system_cd: Option<&str>, etl_date: DateTime<Utc>) -> Self {
        let stamp = etl_date.format(LINEAGE_TIMESTAMP_FORMAT).to_string();
        Self {
            source_system_cd: source_system_cd.unwrap_or_default().to_string(),
            row_create_dts: stamp.clone(),
            row_update_dts: stamp,
            run_id: etl_date.timestamp(),
        }
    }

    /// Rendered in lineage column order
    pub fn rendered(&self) -> [String; 4] {
        [
            self.source_system_cd.clone(),
            self.row_create_dts.clone(),
            self.row_update_dts.clone(),
            self.run_id.to_string(),
        ]
    }
}
