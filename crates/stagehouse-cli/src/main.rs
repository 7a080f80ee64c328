use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stagehouse_catalog::{
    BatchService, CatalogError, ObjectStoreStorage, SourceDatabase, TableName, TargetWarehouse,
};
use stagehouse_core::{Config, ConnectionConfig, LoadPlan, RunReport, TableStatus};
use stagehouse_engine::{ConnectionFactory, TableJob, TableRunner};
use stagehouse_sql::SchemaTranslator;

/// Stagehouse - stage source tables into the warehouse
#[derive(Parser)]
#[command(name = "stagehouse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: stagehouse.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage source tables into warehouse tables
    Stage(StageArgs),

    /// Print the warehouse DDL generated for a source table
    Ddl {
        /// Source connection name
        #[arg(long)]
        source_conn: String,

        /// Source table (schema.table)
        source_table: String,

        /// Target table (schema.table)
        target_table: String,
    },

    /// Show the batch status of a workflow
    Status {
        /// Workflow name
        work_flow: String,
    },
}

#[derive(Args)]
struct StageArgs {
    /// Source connection name
    #[arg(long)]
    source_conn: String,

    /// Target connection name
    #[arg(long)]
    target_conn: String,

    /// Source tables, paired by position with the target tables
    #[arg(long, num_args = 1.., required = true)]
    source_tables: Vec<String>,

    /// Target tables
    #[arg(long, num_args = 1.., required = true)]
    target_tables: Vec<String>,

    /// Merge by key fields instead of a full refresh
    #[arg(short, long)]
    incremental: bool,

    /// Stage uncompressed files
    #[arg(long)]
    no_gzip: bool,

    /// Strip quotes from fields on load (required with --select-fields)
    #[arg(short = 'q', long)]
    remove_quotes: bool,

    /// Load the staged file through a manifest
    #[arg(long)]
    manifest: bool,

    /// Load as CSV instead of delimited text
    #[arg(long)]
    csv: bool,

    /// Rejected rows tolerated by COPY (default from config)
    #[arg(long)]
    max_errors: Option<u32>,

    /// Only extract these columns
    #[arg(long, num_args = 0..)]
    select_fields: Vec<String>,

    /// Key columns for incremental merges
    #[arg(long, num_args = 0..)]
    key_fields: Vec<String>,

    /// Columns compared against the batch watermark
    #[arg(long, num_args = 0..)]
    date_fields: Vec<String>,

    /// Batch-service workflow name
    #[arg(long)]
    work_flow: Option<String>,

    /// Source system code written to the lineage columns
    #[arg(long)]
    source_system: Option<String>,

    /// Tables processed concurrently (default from config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Output file for the run report
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = load_config(cli.config.as_deref(), cli.verbose)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Stage(args) => stage_command(config, args).await,
        Commands::Ddl {
            source_conn,
            source_table,
            target_table,
        } => ddl_command(&config, &source_conn, &source_table, &target_table).await,
        Commands::Status { work_flow } => status_command(&config, &work_flow).await,
    }
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    if let Some(config_path) = path {
        return Config::from_file(config_path).with_context(|| format!("Failed to load {}", config_path.display()));
    }

    let default_path = Path::new("stagehouse.toml");
    if default_path.exists() {
        Ok(Config::from_file(default_path)?)
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Ok(Config::default())
    }
}

/// Connections opened from named entries of the config
struct ConfiguredConnections {
    source: ConnectionConfig,
    target: ConnectionConfig,
}

#[async_trait::async_trait]
impl ConnectionFactory for ConfiguredConnections {
    async fn source(&self) -> Result<Box<dyn SourceDatabase>, CatalogError> {
        connect_source(&self.source).await
    }

    async fn target(&self) -> Result<Box<dyn TargetWarehouse>, CatalogError> {
        connect_target(&self.target).await
    }
}

async fn connect_source(conn: &ConnectionConfig) -> Result<Box<dyn SourceDatabase>, CatalogError> {
    match conn.kind {
        #[cfg(feature = "postgres")]
        stagehouse_core::ConnectionKind::Postgres | stagehouse_core::ConnectionKind::Redshift => {
            Ok(Box::new(stagehouse_catalog::PostgresSource::connect(conn).await?))
        }
        other => Err(CatalogError::Config(format!(
            "No {:?} source driver in this build",
            other
        ))),
    }
}

async fn connect_target(conn: &ConnectionConfig) -> Result<Box<dyn TargetWarehouse>, CatalogError> {
    match conn.kind {
        #[cfg(feature = "postgres")]
        stagehouse_core::ConnectionKind::Postgres | stagehouse_core::ConnectionKind::Redshift => {
            Ok(Box::new(stagehouse_catalog::RedshiftWarehouse::connect(conn).await?))
        }
        other => Err(CatalogError::Config(format!(
            "No {:?} warehouse driver in this build",
            other
        ))),
    }
}

#[cfg(feature = "batchy")]
fn batch_service(config: &Config) -> Result<Arc<dyn BatchService>> {
    let client = stagehouse_catalog::BatchyClient::new(&config.batch.clone().unwrap_or_default())?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "batchy"))]
fn batch_service(_config: &Config) -> Result<Arc<dyn BatchService>> {
    anyhow::bail!("Workflows need the batch service client; rebuild with --features batchy")
}

/// Stage command - run every source/target pair
async fn stage_command(mut config: Config, args: StageArgs) -> Result<()> {
    if args.source_tables.len() != args.target_tables.len() {
        anyhow::bail!(
            "{} source tables but {} target tables; they are paired by position",
            args.source_tables.len(),
            args.target_tables.len()
        );
    }
    if let Some(workers) = args.workers {
        config.runtime.workers = workers;
    }

    let source_conn = config.connection(&args.source_conn)?.clone();
    let target_conn = config.connection(&args.target_conn)?.clone();

    let mut jobs = Vec::with_capacity(args.source_tables.len());
    for (source, target) in args.source_tables.iter().zip(&args.target_tables) {
        let target = TableName::parse(target, &target_conn.schema);

        let mut plan = LoadPlan::builder(target.fqn())
            .gzip(!args.no_gzip)
            .remove_quotes(args.remove_quotes)
            .manifest(args.manifest)
            .csv_format(args.csv)
            .select_fields(args.select_fields.clone())
            .max_errors(args.max_errors.unwrap_or(config.loader.max_errors));
        if args.incremental {
            plan = plan.incremental(args.key_fields.clone());
        }

        let mut job = TableJob::new(TableName::parse(source, &source_conn.schema), target, plan.build()?)
            .with_date_fields(args.date_fields.clone());
        if let Some(workflow) = &args.work_flow {
            job = job.with_workflow(workflow);
        }
        if let Some(source_system) = &args.source_system {
            job = job.with_source_system(source_system);
        }
        jobs.push(job);
    }

    let storage = ObjectStoreStorage::from_config(&config.storage)?;
    let batch = match &args.work_flow {
        Some(_) => Some(batch_service(&config)?),
        None => None,
    };

    let factory = Arc::new(ConfiguredConnections {
        source: source_conn,
        target: target_conn,
    });
    let mut runner = TableRunner::new(factory, Arc::new(storage), Arc::new(config));
    if let Some(batch) = batch {
        runner = runner.with_batch_service(batch);
    }

    let report = runner.run(jobs).await;

    if let Some(output) = &args.output {
        report.save_to_file(output)?;
        eprintln!("{} {}", "Report saved to:".green(), output.display());
    }

    print_report_summary(&report);

    if report.has_failures() {
        std::process::exit(1);
    }

    Ok(())
}

/// Ddl command - show what would be created in the warehouse
async fn ddl_command(config: &Config, source_conn: &str, source_table: &str, target_table: &str) -> Result<()> {
    let conn = config.connection(source_conn)?;
    let source = connect_source(conn).await?;
    let table = TableName::parse(source_table, &conn.schema);

    let columns = source.describe_columns(&table).await?;
    match SchemaTranslator::translate(&table.fqn(), target_table, &columns) {
        Some(clone) => println!("{}", SchemaTranslator::ddl(&clone)),
        None => eprintln!("{} {}", "No source table found:".yellow(), table),
    }

    Ok(())
}

/// Status command - roll up the batch status of a workflow
#[cfg(feature = "batchy")]
async fn status_command(config: &Config, work_flow: &str) -> Result<()> {
    let client = stagehouse_catalog::BatchyClient::new(&config.batch.clone().unwrap_or_default())?;
    let summary = client.status_summary(work_flow).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(not(feature = "batchy"))]
async fn status_command(_config: &Config, _work_flow: &str) -> Result<()> {
    anyhow::bail!("Batch status needs the batch service client; rebuild with --features batchy")
}

/// Print run summary to stdout
fn print_report_summary(report: &RunReport) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Stagehouse Run Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Version: {}", report.version);
    println!("Timestamp: {}", report.timestamp);
    println!();

    println!("{}", "Summary:".bold());
    println!("  Tables:  {}", report.summary.total);
    println!("  Loaded:  {}", report.summary.loaded.to_string().green());
    println!("  No work: {}", report.summary.no_work.to_string().yellow());

    if report.summary.failed > 0 {
        println!("  Failed:  {}", report.summary.failed.to_string().red().bold());
    } else {
        println!("  Failed:  {}", report.summary.failed.to_string().green());
    }
    println!();

    for table in &report.tables {
        let status = match table.status {
            TableStatus::Loaded => "LOADED".green().bold(),
            TableStatus::NoWork => "NO WORK".yellow().bold(),
            TableStatus::Failed => "FAILED".red().bold(),
        };

        println!(
            "  [{}] {} -> {} ({} rows, {} ms)",
            status, table.source_table, table.target_table, table.rows_exported, table.elapsed_ms
        );

        if let (Some(src), Some(tgt)) = (table.source_count, table.target_count) {
            println!("    Counts: source {} / target {}", src, tgt);
        }
        if let Some(error) = &table.error {
            println!("    {} {} (stage {})", "Error:".red(), error, table.stage);
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}
