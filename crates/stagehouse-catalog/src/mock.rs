//! In-memory collaborators for testing
//!
//! These doubles stand in for real databases and services without any network:
//! - `MemorySource` serves predefined tables and answers extraction queries
//! - `MemoryWarehouse` interprets the SQL this workspace generates, reading COPY
//!   input from an in-memory `ObjectStoreStorage`
//! - `MemoryBatchService` hands out fixed watermarks and records batch events
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = MemorySourceBuilder::new()
//!     .with_table("dbo.users", columns, rows)
//!     .build();
//! let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
//! let warehouse = MemoryWarehouse::new(storage.clone());
//! ```
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Every statement containing "COPY" fails
//! let warehouse = MemoryWarehouse::new(storage).with_failure_on("COPY");
//!
//! // Extraction queries fail
//! let source = MemorySource::new().with_query_failure();
//! ```

use crate::adapter::{BatchService, CatalogError, ObjectStorage, RowCursor, SourceDatabase, TableName, TargetWarehouse};
use crate::storage::ObjectStoreStorage;
use chrono::NaiveDateTime;
use regex::Regex;
use stagehouse_core::{ColumnSchema, Row, Value, Watermark, NULL_LITERAL};
use stagehouse_sql::{redact_credentials, SourceDialect, WATERMARK_FORMAT};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

/// A source table: catalog columns plus its rows
#[derive(Debug, Clone, Default)]
struct SourceTable {
    columns: Vec<ColumnSchema>,
    rows: Vec<Row>,
}

/// Mock source database
///
/// Tables are keyed by their `schema.table` name. Extraction queries of the form
/// `select <list|*> from <table> [with (nolock)] [where d > 'ts' or ...]` are
/// evaluated against the stored rows.
pub struct MemorySource {
    tables: Arc<RwLock<HashMap<String, SourceTable>>>,
    dialect: SourceDialect,
    fail_queries: bool,
    queries: Arc<RwLock<Vec<String>>>,
    pings: Arc<AtomicUsize>,
}

impl MemorySource {
    /// Create a source with no tables
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            dialect: SourceDialect::Mssql,
            fail_queries: false,
            queries: Arc::new(RwLock::new(Vec::new())),
            pings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add or replace a table
    pub async fn add_table(&self, table: &str, columns: Vec<ColumnSchema>, rows: Vec<Row>) {
        self.tables
            .write()
            .await
            .insert(table.to_string(), SourceTable { columns, rows });
    }

    /// Append rows to an existing table
    pub async fn insert_rows(&self, table: &str, rows: Vec<Row>) {
        if let Some(t) = self.tables.write().await.get_mut(table) {
            t.rows.extend(rows);
        }
    }

    /// Make every extraction query fail
    pub fn with_query_failure(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    /// Answer as a different dialect
    pub fn with_dialect(mut self, dialect: SourceDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Extraction queries received so far
    pub async fn queries(&self) -> Vec<String> {
        self.queries.read().await.clone()
    }

    /// Number of keep-alive pings received
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemorySource {
    fn clone(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            dialect: self.dialect,
            fail_queries: self.fail_queries,
            queries: Arc::clone(&self.queries),
            pings: Arc::clone(&self.pings),
        }
    }
}

fn extract_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)^select\s+(.+?)\s+from\s+(\S+)(?:\s+with\s+\(nolock\))?(?:\s+where\s+(.+))?$")
            .expect("valid regex")
    })
}

fn predicate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\w+)\s*>\s*'([^']+)'").expect("valid regex"))
}

/// True when the value is later than the watermark
fn is_after(value: &Value, watermark: &NaiveDateTime) -> bool {
    match value {
        Value::Timestamp(ts) => ts > watermark,
        Value::Date(d) => d.and_hms_opt(0, 0, 0).map_or(false, |ts| &ts > watermark),
        _ => false,
    }
}

impl MemorySource {
    async fn evaluate(&self, sql: &str) -> Result<Vec<Row>, CatalogError> {
        let caps = extract_pattern()
            .captures(sql.trim())
            .ok_or_else(|| CatalogError::query(sql, "42601", "unsupported query"))?;

        let table_name = &caps[2];
        let tables = self.tables.read().await;
        let table = tables
            .get(table_name)
            .ok_or_else(|| CatalogError::query(sql, "42P01", format!("relation \"{}\" does not exist", table_name)))?;

        let index_of = |name: &str| {
            table
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| CatalogError::query(sql, "42703", format!("column \"{}\" does not exist", name)))
        };

        let projection: Vec<usize> = match caps[1].trim() {
            "*" => (0..table.columns.len()).collect(),
            list => list.split(',').map(|c| index_of(c.trim())).collect::<Result<_, _>>()?,
        };

        let mut filters = Vec::new();
        if let Some(clause) = caps.get(3) {
            for p in predicate_pattern().captures_iter(clause.as_str()) {
                let ts = NaiveDateTime::parse_from_str(&p[2], WATERMARK_FORMAT)
                    .map_err(|e| CatalogError::query(sql, "22007", e.to_string()))?;
                filters.push((index_of(&p[1])?, ts));
            }
        }

        Ok(table
            .rows
            .iter()
            .filter(|row| filters.is_empty() || filters.iter().any(|(i, ts)| is_after(&row[*i], ts)))
            .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }
}

/// Cursor over rows already materialized in memory
pub struct MemoryCursor {
    rows: VecDeque<Row>,
}

impl MemoryCursor {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }
}

#[async_trait::async_trait]
impl RowCursor for MemoryCursor {
    async fn next_batch(&mut self, max_rows: usize) -> Result<Vec<Row>, CatalogError> {
        let n = max_rows.max(1).min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }
}

#[async_trait::async_trait]
impl SourceDatabase for MemorySource {
    fn name(&self) -> &str {
        "MemorySource"
    }

    fn dialect(&self) -> SourceDialect {
        self.dialect
    }

    async fn describe_columns(&self, table: &TableName) -> Result<Vec<ColumnSchema>, CatalogError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table.fqn())
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor>, CatalogError> {
        self.queries.write().await.push(sql.to_string());
        if self.fail_queries {
            return Err(CatalogError::query(sql, "08S01", "Simulated query failure"));
        }
        let rows = self.evaluate(sql).await?;
        Ok(Box::new(MemoryCursor::new(rows)))
    }

    async fn execute(&self, sql: &str) -> Result<u64, CatalogError> {
        self.queries.write().await.push(sql.to_string());
        Ok(0)
    }

    async fn count(&self, table: &str) -> Result<i64, CatalogError> {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| CatalogError::TableNotFound(table.to_string()))
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder for a `MemorySource` with several tables
pub struct MemorySourceBuilder {
    tables: HashMap<String, SourceTable>,
    dialect: SourceDialect,
    fail_queries: bool,
}

impl MemorySourceBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            dialect: SourceDialect::Mssql,
            fail_queries: false,
        }
    }

    /// Add a table
    pub fn with_table(mut self, table: &str, columns: Vec<ColumnSchema>, rows: Vec<Row>) -> Self {
        self.tables.insert(table.to_string(), SourceTable { columns, rows });
        self
    }

    /// Set the dialect
    pub fn with_dialect(mut self, dialect: SourceDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Configure query failure
    pub fn with_query_failure(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    /// Build the MemorySource
    pub fn build(self) -> MemorySource {
        MemorySource {
            tables: Arc::new(RwLock::new(self.tables)),
            dialect: self.dialect,
            fail_queries: self.fail_queries,
            queries: Arc::new(RwLock::new(Vec::new())),
            pings: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for MemorySourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Warehouse cell; `None` is SQL NULL
pub type Cell = Option<String>;

#[derive(Debug, Clone, Default)]
struct WarehouseTable {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Default)]
struct WarehouseState {
    tables: HashMap<String, WarehouseTable>,
    grants: Vec<String>,
}

struct Grammar {
    drop: Regex,
    create: Regex,
    create_like: Regex,
    delete_all: Regex,
    delete_exists: Regex,
    insert_select: Regex,
    copy: Regex,
    delimiter: Regex,
    max_errors: Regex,
    quoted: Regex,
    and: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        drop: Regex::new(r"(?is)^drop\s+table\s+(if\s+exists\s+)?(\S+)$").expect("valid regex"),
        create: Regex::new(r"(?is)^create\s+table\s+(\S+)\s*\((.*)\)$").expect("valid regex"),
        create_like: Regex::new(r"(?is)^create\s+temporary\s+table\s+(\S+)\s*\(\s*like\s+(\S+)\s*\)$")
            .expect("valid regex"),
        delete_all: Regex::new(r"(?is)^delete\s+from\s+(\S+)$").expect("valid regex"),
        delete_exists: Regex::new(
            r"(?is)^delete\s+from\s+(\S+)\s+where\s+exists\s*\(\s*select\s+1\s+from\s+(\S+)\s+where\s+(.+)\)$",
        )
        .expect("valid regex"),
        insert_select: Regex::new(r"(?is)^insert\s+into\s+(\S+)\s+select\s+\*\s+from\s+(\S+)$").expect("valid regex"),
        copy: Regex::new(r"(?is)^copy\s+(\S+)(?:\s+\(([^)]*)\))?\s+from\s+'([^']+)'").expect("valid regex"),
        delimiter: Regex::new(r"(?i)\sdelimiter\s+'((?:[^']|'')*)'").expect("valid regex"),
        max_errors: Regex::new(r"(?i)\smaxerror\s+(\d+)").expect("valid regex"),
        quoted: Regex::new(r"'(?:[^']|'')*'").expect("valid regex"),
        and: Regex::new(r"(?i)\s+and\s+").expect("valid regex"),
    })
}

fn missing_relation(sql: &str, table: &str) -> CatalogError {
    CatalogError::query(sql, "42P01", format!("relation \"{}\" does not exist", table))
}

/// Column names from the body of a generated `create table`
fn parse_column_names(body: &str) -> Vec<String> {
    body.lines()
        .map(|l| l.trim().trim_end_matches(','))
        .filter(|l| !l.is_empty())
        .map(|l| {
            if let Some(rest) = l.strip_prefix('"') {
                rest.split('"').next().unwrap_or_default().to_string()
            } else {
                l.split_whitespace().next().unwrap_or_default().to_string()
            }
        })
        .collect()
}

/// Split one staged line; quote-aware only when the load strips quotes
fn split_record(line: &str, delimiter: char, strip_quotes: bool) -> Vec<String> {
    if !strip_quotes {
        return line.split(delimiter).map(str::to_string).collect();
    }

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

fn unescape_delimiter(raw: &str) -> char {
    match raw {
        "\\t" => '\t',
        "''" => '\'',
        other => other.chars().next().unwrap_or('|'),
    }
}

/// Mock warehouse
///
/// Interprets the statement shapes produced by `stagehouse-sql`:
/// `drop table [if exists]`, `create table`, `create temporary table ... (like ...)`,
/// `delete from`, the key-matching `delete ... where exists`, `insert into ... select *`,
/// `COPY`, and `grant`. Anything else is rejected as a syntax error.
pub struct MemoryWarehouse {
    state: Arc<RwLock<WarehouseState>>,
    statements: Arc<RwLock<Vec<String>>>,
    storage: Option<ObjectStoreStorage>,
    failures: Vec<String>,
    fail_connection: bool,
    pings: Arc<AtomicUsize>,
}

impl MemoryWarehouse {
    /// Create a warehouse whose COPY reads from `storage`
    pub fn new(storage: ObjectStoreStorage) -> Self {
        Self {
            storage: Some(storage),
            ..Self::detached()
        }
    }

    /// Create a warehouse without object storage; COPY always fails
    pub fn detached() -> Self {
        Self {
            state: Arc::new(RwLock::new(WarehouseState::default())),
            statements: Arc::new(RwLock::new(Vec::new())),
            storage: None,
            failures: Vec::new(),
            fail_connection: false,
            pings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every statement containing `fragment` (case-insensitive)
    pub fn with_failure_on(mut self, fragment: &str) -> Self {
        self.failures.push(fragment.to_lowercase());
        self
    }

    /// Fail all pings
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Pre-create a table
    pub async fn add_table(&self, table: &str, columns: &[&str]) {
        self.state.write().await.tables.insert(
            table.to_string(),
            WarehouseTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Column names of `table`
    pub async fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.state.read().await.tables.get(table).map(|t| t.columns.clone())
    }

    /// Rows of `table`
    pub async fn rows(&self, table: &str) -> Vec<Vec<Cell>> {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Grant statements applied so far
    pub async fn grants(&self) -> Vec<String> {
        self.state.read().await.grants.clone()
    }

    /// Every statement received, credentials masked
    pub async fn statements(&self) -> Vec<String> {
        self.statements.read().await.clone()
    }

    /// Number of keep-alive pings received
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, sql: &str) -> Option<CatalogError> {
        let lowered = sql.to_lowercase();
        self.failures
            .iter()
            .find(|f| lowered.contains(f.as_str()))
            .map(|_| CatalogError::query(sql, "XX000", "Simulated failure"))
    }

    async fn read_object(&self, sql: &str, uri: &str) -> Result<Vec<u8>, CatalogError> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| CatalogError::query(sql, "XX000", "no object storage attached"))?;
        let key = storage
            .key_for_uri(uri)
            .ok_or_else(|| CatalogError::query(sql, "XX000", format!("The specified S3 prefix '{}' does not exist", uri)))?;
        let bytes = storage
            .get(&key)
            .await
            .map_err(|e| CatalogError::query(sql, "XX000", e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn copy(&self, state: &mut WarehouseState, sql: &str) -> Result<u64, CatalogError> {
        let g = grammar();
        let caps = g
            .copy
            .captures(sql)
            .ok_or_else(|| CatalogError::query(sql, "42601", "syntax error in COPY"))?;

        let table = caps[1].to_string();
        let explicit: Option<Vec<String>> = caps
            .get(2)
            .map(|m| m.as_str().split(',').map(|c| c.trim().to_string()).collect());
        let uri = caps[3].to_string();

        let tail = &sql[caps.get(0).map_or(0, |m| m.end())..];
        let flags = g.quoted.replace_all(tail, "''").to_lowercase();
        let has = |word: &str| flags.split_whitespace().any(|t| t.trim_end_matches(';') == word);
        let gzip = has("gzip");
        let manifest = has("manifest");
        let csv = has("csv");
        let strip_quotes = has("removequotes") || csv;

        let default_delimiter = if csv { ',' } else { '|' };
        let delimiter = g
            .delimiter
            .captures(tail)
            .map_or(default_delimiter, |c| unescape_delimiter(&c[1]));
        let max_errors: usize = g.max_errors.captures(tail).and_then(|c| c[1].parse().ok()).unwrap_or(0);

        let target_columns = state
            .tables
            .get(&table)
            .ok_or_else(|| missing_relation(sql, &table))?
            .columns
            .clone();

        let positions: Vec<usize> = match &explicit {
            Some(cols) => cols
                .iter()
                .map(|c| {
                    target_columns
                        .iter()
                        .position(|t| t.eq_ignore_ascii_case(c))
                        .ok_or_else(|| CatalogError::query(sql, "42703", format!("column \"{}\" does not exist", c)))
                })
                .collect::<Result<_, _>>()?,
            None => (0..target_columns.len()).collect(),
        };

        let files = if manifest {
            let body = self.read_object(sql, &uri).await?;
            let parsed: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|e| CatalogError::query(sql, "XX000", format!("invalid manifest: {}", e)))?;
            parsed["entries"]
                .as_array()
                .map(|entries| entries.iter().filter_map(|e| e["url"].as_str().map(str::to_string)).collect())
                .unwrap_or_default()
        } else {
            vec![uri]
        };

        let mut loaded = Vec::new();
        let mut errors = 0usize;

        for file in files {
            let raw = self.read_object(sql, &file).await?;
            let text = if gzip {
                let mut out = String::new();
                flate2::read::GzDecoder::new(raw.as_slice())
                    .read_to_string(&mut out)
                    .map_err(|e| CatalogError::query(sql, "XX000", format!("gzip: {}", e)))?;
                out
            } else {
                String::from_utf8(raw).map_err(|e| CatalogError::query(sql, "XX000", e.to_string()))?
            };

            for line in text.lines().filter(|l| !l.is_empty()) {
                let fields = split_record(line, delimiter, strip_quotes);
                if fields.len() != positions.len() {
                    errors += 1;
                    continue;
                }
                let mut row: Vec<Cell> = vec![None; target_columns.len()];
                for (field, &pos) in fields.into_iter().zip(&positions) {
                    row[pos] = if field == NULL_LITERAL { None } else { Some(field) };
                }
                loaded.push(row);
            }
        }

        if errors > max_errors {
            return Err(CatalogError::query(
                sql,
                "XX000",
                format!("Load into table '{}' failed. Check 'stl_load_errors' system table for details.", table),
            ));
        }

        let count = loaded.len() as u64;
        if let Some(t) = state.tables.get_mut(&table) {
            t.rows.extend(loaded);
        }
        Ok(count)
    }

    async fn apply(&self, state: &mut WarehouseState, sql: &str) -> Result<u64, CatalogError> {
        self.statements.write().await.push(redact_credentials(sql));

        if let Some(err) = self.injected_failure(sql) {
            return Err(err);
        }

        let stmt = sql.trim().trim_end_matches(';').trim();
        let lowered = stmt.to_lowercase();
        let g = grammar();

        if lowered.starts_with("copy ") {
            return self.copy(state, stmt).await;
        }

        if lowered.starts_with("grant ") {
            state.grants.push(stmt.to_string());
            return Ok(0);
        }

        if lowered == "select 1" {
            return Ok(0);
        }

        if let Some(c) = g.drop.captures(stmt) {
            let removed = state.tables.remove(&c[2]);
            if removed.is_none() && c.get(1).is_none() {
                return Err(missing_relation(sql, &c[2]));
            }
            return Ok(0);
        }

        if let Some(c) = g.create_like.captures(stmt) {
            let columns = state
                .tables
                .get(&c[2])
                .ok_or_else(|| missing_relation(sql, &c[2]))?
                .columns
                .clone();
            state
                .tables
                .insert(c[1].to_string(), WarehouseTable { columns, rows: Vec::new() });
            return Ok(0);
        }

        if let Some(c) = g.create.captures(stmt) {
            if state.tables.contains_key(&c[1]) {
                return Err(CatalogError::query(sql, "42P07", format!("relation \"{}\" already exists", &c[1])));
            }
            let columns = parse_column_names(&c[2]);
            state
                .tables
                .insert(c[1].to_string(), WarehouseTable { columns, rows: Vec::new() });
            return Ok(0);
        }

        if let Some(c) = g.delete_exists.captures(stmt) {
            let keys: Vec<String> = g
                .and
                .split(&c[3])
                .filter_map(|pred| pred.split('=').next())
                .filter_map(|lhs| lhs.trim().rsplit('.').next().map(str::to_string))
                .collect();

            let incoming = state.tables.get(&c[2]).ok_or_else(|| missing_relation(sql, &c[2]))?;
            let incoming_idx = key_positions(&incoming.columns, &keys, sql)?;
            let incoming_keys: HashSet<Vec<String>> = incoming
                .rows
                .iter()
                .filter_map(|r| key_tuple(r, &incoming_idx))
                .collect();

            let target = state.tables.get_mut(&c[1]).ok_or_else(|| missing_relation(sql, &c[1]))?;
            let target_idx = key_positions(&target.columns, &keys, sql)?;
            let before = target.rows.len();
            target
                .rows
                .retain(|r| key_tuple(r, &target_idx).map_or(true, |k| !incoming_keys.contains(&k)));
            return Ok((before - target.rows.len()) as u64);
        }

        if let Some(c) = g.delete_all.captures(stmt) {
            let target = state.tables.get_mut(&c[1]).ok_or_else(|| missing_relation(sql, &c[1]))?;
            let removed = target.rows.len() as u64;
            target.rows.clear();
            return Ok(removed);
        }

        if let Some(c) = g.insert_select.captures(stmt) {
            let rows = state
                .tables
                .get(&c[2])
                .ok_or_else(|| missing_relation(sql, &c[2]))?
                .rows
                .clone();
            let target = state.tables.get_mut(&c[1]).ok_or_else(|| missing_relation(sql, &c[1]))?;
            if rows.first().map_or(false, |r| r.len() != target.columns.len()) {
                return Err(CatalogError::query(sql, "42601", "INSERT has more expressions than target columns"));
            }
            let inserted = rows.len() as u64;
            target.rows.extend(rows);
            return Ok(inserted);
        }

        Err(CatalogError::query(sql, "42601", "syntax error"))
    }
}

fn key_positions(columns: &[String], keys: &[String], sql: &str) -> Result<Vec<usize>, CatalogError> {
    keys.iter()
        .map(|k| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(k))
                .ok_or_else(|| CatalogError::query(sql, "42703", format!("column \"{}\" does not exist", k)))
        })
        .collect()
}

/// Key values of a row; `None` when any is NULL, since NULL never equals NULL
fn key_tuple(row: &[Cell], positions: &[usize]) -> Option<Vec<String>> {
    positions.iter().map(|&i| row[i].clone()).collect()
}

impl Clone for MemoryWarehouse {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            statements: Arc::clone(&self.statements),
            storage: self.storage.clone(),
            failures: self.failures.clone(),
            fail_connection: self.fail_connection,
            pings: Arc::clone(&self.pings),
        }
    }
}

#[async_trait::async_trait]
impl TargetWarehouse for MemoryWarehouse {
    fn name(&self) -> &str {
        "MemoryWarehouse"
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, CatalogError> {
        Ok(self.state.read().await.tables.contains_key(&table.fqn()))
    }

    async fn execute(&self, sql: &str) -> Result<u64, CatalogError> {
        let mut state = self.state.write().await;
        self.apply(&mut state, sql).await
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), CatalogError> {
        let mut state = self.state.write().await;
        let snapshot = state.clone();

        for sql in statements {
            if let Err(e) = self.apply(&mut state, sql).await {
                *state = snapshot;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<i64, CatalogError> {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| CatalogError::TableNotFound(table.to_string()))
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_connection {
            Err(CatalogError::Connection("Simulated connection failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// What happened to a workflow's batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Opened,
    Closed,
    Failed,
}

/// Mock batch service with fixed watermarks per workflow
#[derive(Clone, Default)]
pub struct MemoryBatchService {
    watermarks: Arc<RwLock<HashMap<String, Watermark>>>,
    events: Arc<RwLock<Vec<(String, BatchEvent)>>>,
}

impl MemoryBatchService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the watermark handed out for `workflow`
    pub async fn add_workflow(&self, workflow: &str, watermark: Watermark) {
        self.watermarks.write().await.insert(workflow.to_string(), watermark);
    }

    /// Events recorded so far, in order
    pub async fn events(&self) -> Vec<(String, BatchEvent)> {
        self.events.read().await.clone()
    }

    async fn record(&self, workflow: &str, event: BatchEvent) {
        self.events.write().await.push((workflow.to_string(), event));
    }
}

#[async_trait::async_trait]
impl BatchService for MemoryBatchService {
    async fn open(&self, workflow: &str) -> Result<Watermark, CatalogError> {
        let watermark = self
            .watermarks
            .read()
            .await
            .get(workflow)
            .cloned()
            .ok_or_else(|| CatalogError::Batch(format!("Unknown workflow '{}'", workflow)))?;
        self.record(workflow, BatchEvent::Opened).await;
        Ok(watermark)
    }

    async fn close(&self, workflow: &str) -> Result<(), CatalogError> {
        self.record(workflow, BatchEvent::Closed).await;
        Ok(())
    }

    async fn fail(&self, workflow: &str) -> Result<(), CatalogError> {
        self.record(workflow, BatchEvent::Failed).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::NaiveDate;

    fn ts(day: u32) -> Value {
        Value::Timestamp(NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(12, 0, 0).unwrap())
    }

    fn users_source() -> MemorySource {
        MemorySourceBuilder::new()
            .with_table(
                "dbo.users",
                vec![ColumnSchema::new("id", "int"), ColumnSchema::new("updated", "datetime")],
                vec![
                    vec![Value::Int(1), ts(1)],
                    vec![Value::Int(2), ts(5)],
                    vec![Value::Int(3), ts(9)],
                ],
            )
            .build()
    }

    async fn drain(mut cursor: Box<dyn RowCursor>) -> Vec<Row> {
        let mut all = Vec::new();
        loop {
            let batch = cursor.next_batch(2).await.unwrap();
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
        }
        all
    }

    #[tokio::test]
    async fn test_source_full_scan_in_batches() {
        let source = users_source();
        let rows = drain(source.open_cursor("select * from dbo.users with (nolock)").await.unwrap()).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(source.count("dbo.users").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_source_watermark_filter_and_projection() {
        let source = users_source();
        let sql = "select id from dbo.users with (nolock) where updated > '2024-01-04 00:00'";
        let rows = drain(source.open_cursor(sql).await.unwrap()).await;
        assert_eq!(rows, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    }

    #[tokio::test]
    async fn test_source_missing_table_has_no_columns() {
        let source = users_source();
        let cols = source.describe_columns(&TableName::new("dbo", "gone")).await.unwrap();
        assert!(cols.is_empty());
        assert!(matches!(source.count("dbo.gone").await, Err(CatalogError::TableNotFound(_))));
    }

    #[tokio::test]
    async fn test_source_query_failure() {
        let source = MemorySource::new().with_query_failure();
        assert!(matches!(source.open_cursor("select * from t").await, Err(CatalogError::Query { .. })));
    }

    #[tokio::test]
    async fn test_warehouse_ddl_and_copy() {
        let storage = ObjectStoreStorage::in_memory("bucket");
        storage
            .put_bytes("k/output.tsv", Bytes::from_static(b"1\tann\n2\tNone\n"))
            .await
            .unwrap();

        let wh = MemoryWarehouse::new(storage);
        wh.execute("create table edw.users (\n  \"id\" integer,\n  \"name\" varchar(50)\n);")
            .await
            .unwrap();
        assert!(wh.table_exists(&TableName::new("edw", "users")).await.unwrap());

        wh.execute("COPY edw.users from 'memory://bucket/k/output.tsv' CREDENTIALS 'x' delimiter '\\t' maxerror 0;")
            .await
            .unwrap();

        assert_eq!(
            wh.rows("edw.users").await,
            vec![
                vec![Some("1".to_string()), Some("ann".to_string())],
                vec![Some("2".to_string()), None],
            ]
        );
    }

    #[tokio::test]
    async fn test_warehouse_transaction_rolls_back() {
        let wh = MemoryWarehouse::detached().with_failure_on("insert into");
        wh.add_table("edw.users", &["id"]).await;

        let result = wh
            .execute_transaction(&[
                "drop table if exists edw.users;".to_string(),
                "insert into edw.users select * from edw.other;".to_string(),
            ])
            .await;

        assert!(result.is_err());
        assert!(wh.table_exists(&TableName::new("edw", "users")).await.unwrap());
    }

    #[tokio::test]
    async fn test_warehouse_rejects_unknown_sql() {
        let wh = MemoryWarehouse::detached();
        let err = wh.execute("vacuum edw.users").await.unwrap_err();
        assert!(matches!(err, CatalogError::Query { ref code, .. } if code == "42601"));
    }

    #[tokio::test]
    async fn test_batch_service_events() {
        let batch = MemoryBatchService::new();
        let wm = Watermark {
            from_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            batch_id: 11,
        };
        batch.add_workflow("wf", wm.clone()).await;

        assert_eq!(batch.open("wf").await.unwrap(), wm);
        batch.close("wf").await.unwrap();
        assert!(batch.open("other").await.is_err());

        assert_eq!(
            batch.events().await,
            vec![("wf".to_string(), BatchEvent::Opened), ("wf".to_string(), BatchEvent::Closed)]
        );
    }

    #[test]
    fn test_split_record_quotes() {
        assert_eq!(split_record("a\t\"b\"\"c\"", '\t', true), vec!["a", "b\"c"]);
        assert_eq!(split_record("a\t\"b\"", '\t', false), vec!["a", "\"b\""]);
    }
}
