//! Source extraction into a staged delimited file
//!
//! Rows are streamed from a source cursor into a local file (optionally gzip
//! compressed), each row followed by the lineage values of the run. The file is
//! then uploaded to object storage and removed locally.
//!
//! File writes and compression run on a blocking thread fed batch by batch
//! through a bounded channel, so fetching the next batch overlaps with writing
//! the previous one.

use crate::error::PipelineError;
use chrono::NaiveDateTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use stagehouse_catalog::{ObjectStorage, SourceDatabase, TableName, TargetWarehouse};
use stagehouse_core::config::ExportConfig;
use stagehouse_core::{Config, LineageValues, LoadPlan, StagingArtifact, StorageConfig, Value};
use stagehouse_sql::ExtractQuery;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fetched batches buffered between the cursor and the file writer
const WRITE_QUEUE_BATCHES: usize = 4;

/// Rendered records of one fetched batch
type RecordBatch = Vec<Vec<String>>;

/// Writes one record per line with minimal quoting
///
/// A field is quoted only when it contains the delimiter, a double quote or a
/// line break; embedded quotes are doubled.
pub struct DelimitedWriter<W: Write> {
    inner: W,
    delimiter: char,
    rows: u64,
    line: String,
}

impl<W: Write> DelimitedWriter<W> {
    pub fn new(inner: W, delimiter: char) -> Self {
        Self {
            inner,
            delimiter,
            rows: 0,
            line: String::new(),
        }
    }

    pub fn write_record<I, S>(&mut self, fields: I) -> io::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.line.clear();
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                self.line.push(self.delimiter);
            }
            push_field(&mut self.line, field.as_ref(), self.delimiter);
        }
        self.line.push('\n');
        self.inner.write_all(self.line.as_bytes())?;
        self.rows += 1;
        Ok(())
    }

    /// Records written so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn push_field(line: &mut String, field: &str, delimiter: char) {
    let needs_quotes = field.chars().any(|c| c == delimiter || c == '"' || c == '\n' || c == '\r');
    if !needs_quotes {
        line.push_str(field);
        return;
    }

    line.push('"');
    for c in field.chars() {
        if c == '"' {
            line.push('"');
        }
        line.push(c);
    }
    line.push('"');
}

/// Local staging file sink
enum StageSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl StageSink {
    fn create(path: &Path, gzip: bool) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if gzip {
            Self::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Self::Plain(file)
        })
    }

    /// Flush everything, writing the gzip trailer if compressed
    fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Gzip(enc) => enc.finish()?.flush(),
        }
    }
}

impl Write for StageSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}

/// Local staging file, removed when dropped
struct StagingFile {
    path: PathBuf,
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove staging file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Write every batch received on `batches` to `path`, returning the row count
///
/// The file is complete (gzip trailer included) once the task finishes.
fn spawn_writer(
    path: PathBuf,
    gzip: bool,
    delimiter: char,
    mut batches: mpsc::Receiver<RecordBatch>,
) -> JoinHandle<io::Result<u64>> {
    tokio::task::spawn_blocking(move || {
        let sink = StageSink::create(&path, gzip)?;
        let mut writer = DelimitedWriter::new(sink, delimiter);
        while let Some(records) = batches.blocking_recv() {
            for record in &records {
                writer.write_record(record)?;
            }
        }
        let rows = writer.rows();
        writer.into_inner().finish()?;
        Ok(rows)
    })
}

/// What to extract for one table
#[derive(Debug, Clone)]
pub struct ExportRequest<'a> {
    pub source_table: &'a TableName,
    pub target_table: &'a TableName,
    pub plan: &'a LoadPlan,

    /// Columns compared against the watermark
    pub date_fields: &'a [String],
    pub from_date: Option<NaiveDateTime>,
    pub lineage: &'a LineageValues,
}

/// Streams a source table into object storage
pub struct StagingExporter<'a> {
    source: &'a dyn SourceDatabase,
    target: &'a dyn TargetWarehouse,
    storage: &'a dyn ObjectStorage,
    export: &'a ExportConfig,
    storage_config: &'a StorageConfig,
    temp_dir: PathBuf,
}

impl<'a> StagingExporter<'a> {
    pub fn new(
        source: &'a dyn SourceDatabase,
        target: &'a dyn TargetWarehouse,
        storage: &'a dyn ObjectStorage,
        config: &'a Config,
    ) -> Self {
        Self {
            source,
            target,
            storage,
            export: &config.export,
            storage_config: &config.storage,
            temp_dir: config.temp_dir(),
        }
    }

    /// Local path of the staging file for `target_table`
    pub fn local_path(&self, target_table: &TableName, gzip: bool) -> PathBuf {
        let name = target_table.fqn().replace('.', "-");
        let file = if gzip { format!("{}.txt.gz", name) } else { format!("{}.txt", name) };
        self.temp_dir.join(file)
    }

    /// Extract, stage and upload; the local file never outlives this call
    pub async fn export(&self, request: &ExportRequest<'_>) -> Result<StagingArtifact, PipelineError> {
        let plan = request.plan;
        let gzip = plan.options.gzip;
        let source_table = request.source_table.fqn();

        let sql = ExtractQuery::new(&source_table, self.source.dialect())
            .select_fields(&plan.select_fields)
            .changed_since(request.date_fields, request.from_date)
            .build();
        info!("{}", sql);

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(PipelineError::export)?;
        let staging = StagingFile {
            path: self.local_path(request.target_table, gzip),
        };
        info!("exporting to {}", staging.path.display());

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_BATCHES);
        let writer = spawn_writer(staging.path.clone(), gzip, plan.delimiter, rx);
        let streamed = self.stream_rows(&sql, request.lineage, tx).await;

        // the writer has to be done with the file before the guard can remove it
        let written = writer.await.map_err(PipelineError::export)?;
        streamed?;
        let row_count = written.map_err(PipelineError::export)?;
        info!("staged {} rows from {}", row_count, source_table);

        // both connections sat idle while the file was written
        if let Err(e) = self.target.ping().await {
            warn!("Warehouse keepalive failed: {}", e);
        }
        if let Err(e) = self.source.ping().await {
            warn!("Source keepalive failed: {}", e);
        }

        let key = self.storage_config.object_key(&request.target_table.fqn(), gzip);
        info!("upload starting");
        let uri = self
            .storage
            .upload(&staging.path, &key)
            .await
            .map_err(PipelineError::export)?;
        info!("upload complete to {}", uri);

        Ok(StagingArtifact {
            uri,
            key,
            delimiter: plan.delimiter,
            compressed: gzip,
            row_count,
        })
    }

    /// Feed the extract result to the file writer, one fetched batch at a time
    ///
    /// Returns early without an error when the writer hangs up; its own error
    /// is the one worth reporting.
    async fn stream_rows(
        &self,
        sql: &str,
        lineage: &LineageValues,
        batches: mpsc::Sender<RecordBatch>,
    ) -> Result<(), PipelineError> {
        let lineage = lineage.rendered();
        let mut cursor = self.source.open_cursor(sql).await.map_err(PipelineError::export)?;
        let mut fetched = 0usize;

        loop {
            let rows = cursor
                .next_batch(self.export.fetch_batch_size)
                .await
                .map_err(PipelineError::export)?;
            if rows.is_empty() {
                return Ok(());
            }

            let records: RecordBatch = rows
                .iter()
                .map(|row| row.iter().map(Value::render).chain(lineage.iter().cloned()).collect())
                .collect();
            if batches.send(records).await.is_err() {
                return Ok(());
            }

            fetched += 1;
            if self.export.keepalive_batches > 0 && fetched % self.export.keepalive_batches == 0 {
                debug!("keepalive after {} batches", fetched);
                if let Err(e) = self.target.ping().await {
                    warn!("Warehouse keepalive failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use stagehouse_catalog::{MemorySource, MemorySourceBuilder, MemoryWarehouse, ObjectStoreStorage};
    use stagehouse_core::ColumnSchema;
    use std::io::Read;

    fn record(fields: &[&str], delimiter: char) -> String {
        let mut w = DelimitedWriter::new(Vec::new(), delimiter);
        w.write_record(fields).unwrap();
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn test_minimal_quoting() {
        assert_eq!(record(&["1", "ann"], '\t'), "1\tann\n");
        assert_eq!(record(&["a\tb", "c"], '\t'), "\"a\tb\"\tc\n");
        assert_eq!(record(&["say \"hi\""], '|'), "\"say \"\"hi\"\"\"\n");
        assert_eq!(record(&["a,b"], '\t'), "a,b\n");
    }

    fn source() -> MemorySource {
        MemorySourceBuilder::new()
            .with_table(
                "dbo.users",
                vec![ColumnSchema::new("id", "int"), ColumnSchema::new("name", "varchar")],
                vec![
                    vec![Value::Int(1), Value::from("ann")],
                    vec![Value::Int(2), Value::Null],
                    vec![Value::Int(3), Value::from("tab\there")],
                ],
            )
            .build()
    }

    fn config(temp: &Path) -> Config {
        let mut config = Config::default();
        config.export.temp_dir = temp.to_path_buf();
        config
    }

    fn lineage() -> LineageValues {
        LineageValues::new(Some("crm"), Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_export_stages_rows_with_lineage() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path());
        let source = source();
        let warehouse = MemoryWarehouse::detached();
        let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
        let exporter = StagingExporter::new(&source, &warehouse, &storage, &config);

        let (src, tgt) = (TableName::new("dbo", "users"), TableName::new("edw", "users"));
        let plan = LoadPlan::builder("edw.users").gzip(false).build().unwrap();
        let lineage = lineage();
        let request = ExportRequest {
            source_table: &src,
            target_table: &tgt,
            plan: &plan,
            date_fields: &[],
            from_date: None,
            lineage: &lineage,
        };

        let artifact = exporter.export(&request).await.unwrap();
        assert_eq!(artifact.row_count, 3);
        assert_eq!(artifact.key, "stagehouse/dev/edw-users/output.tsv");
        assert!(!exporter.local_path(&tgt, false).exists());

        let body = storage.get(&artifact.key).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "1\tann\tcrm\t2024-06-01 08:00:00\t2024-06-01 08:00:00\t1717228800");
        assert!(lines[1].starts_with("2\tNone\t"));
        assert!(lines[2].starts_with("3\ttab here\t"));
    }

    #[tokio::test]
    async fn test_gzip_export_and_keepalive() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config(temp.path());
        config.export.fetch_batch_size = 1;
        config.export.keepalive_batches = 1;

        let source = source();
        let warehouse = MemoryWarehouse::detached();
        let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
        let exporter = StagingExporter::new(&source, &warehouse, &storage, &config);

        let (src, tgt) = (TableName::new("dbo", "users"), TableName::new("edw", "users"));
        let plan = LoadPlan::builder("edw.users").build().unwrap();
        let lineage = lineage();
        let request = ExportRequest {
            source_table: &src,
            target_table: &tgt,
            plan: &plan,
            date_fields: &[],
            from_date: None,
            lineage: &lineage,
        };

        let artifact = exporter.export(&request).await.unwrap();
        assert!(artifact.compressed);
        assert!(artifact.uri.ends_with("output.tsv.gz"));

        // one ping per batch plus one after the file is closed
        assert_eq!(warehouse.ping_count(), 4);
        assert_eq!(source.ping_count(), 1);

        let body = storage.get(&artifact.key).await.unwrap();
        let mut text = String::new();
        flate2::read::GzDecoder::new(body.as_ref()).read_to_string(&mut text).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_unwritable_staging_file_is_export_error() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config(temp.path());
        config.export.fetch_batch_size = 1;

        let source = source();
        let warehouse = MemoryWarehouse::detached();
        let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
        let exporter = StagingExporter::new(&source, &warehouse, &storage, &config);

        let (src, tgt) = (TableName::new("dbo", "users"), TableName::new("edw", "users"));
        // a directory squatting on the staging path makes the writer fail
        std::fs::create_dir_all(exporter.local_path(&tgt, true)).unwrap();

        let plan = LoadPlan::builder("edw.users").build().unwrap();
        let lineage = lineage();
        let request = ExportRequest {
            source_table: &src,
            target_table: &tgt,
            plan: &plan,
            date_fields: &[],
            from_date: None,
            lineage: &lineage,
        };

        let err = exporter.export(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::Export(_)));
        assert!(storage.get("stagehouse/dev/edw-users/output.tsv.gz").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_extract_removes_local_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = config(temp.path());
        let source = source().with_query_failure();
        let warehouse = MemoryWarehouse::detached();
        let storage = ObjectStoreStorage::in_memory("stagehouse-temp");
        let exporter = StagingExporter::new(&source, &warehouse, &storage, &config);

        let (src, tgt) = (TableName::new("dbo", "users"), TableName::new("edw", "users"));
        let plan = LoadPlan::builder("edw.users").build().unwrap();
        let lineage = lineage();
        let request = ExportRequest {
            source_table: &src,
            target_table: &tgt,
            plan: &plan,
            date_fields: &[],
            from_date: None,
            lineage: &lineage,
        };

        let err = exporter.export(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::Export(_)));
        assert!(!exporter.local_path(&tgt, true).exists());
    }
}
