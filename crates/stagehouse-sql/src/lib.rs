//! Stagehouse SQL generation
//!
//! Every SQL string the pipeline sends to a database is built here:
//! - Schema translation and target DDL
//! - Source extraction and count queries
//! - COPY, full-refresh and merge scripts
//!
//! Nothing in this crate performs I/O, so all of it is testable directly.

pub mod load;
pub mod query;
pub mod redact;
pub mod translator;

pub use load::{copy_columns, directive_clause, grant_statements, manifest_json, temp_table_name, CopyStatement, LoadScript};
pub use query::{count_query, ExtractQuery, SourceDialect, KEEPALIVE_QUERY, WATERMARK_FORMAT};
pub use redact::redact_credentials;
pub use translator::{map_column, map_type, quote_ident, SchemaTranslator};
