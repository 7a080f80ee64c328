//! Configuration schema (stagehouse.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Database flavour behind a named connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Microsoft SQL Server
    Mssql,

    /// PostgreSQL
    Postgres,

    /// Amazon Redshift
    Redshift,
}

impl ConnectionKind {
    /// Default port for the flavour
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mssql => 1433,
            Self::Postgres => 5432,
            Self::Redshift => 5439,
        }
    }
}

/// A named database connection
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub kind: ConnectionKind,
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    pub database: String,
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Connect over TLS
    #[serde(default)]
    pub tls: bool,

    /// Schema assumed for unqualified table names
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ConnectionConfig {
    /// Effective port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// libpq-style connection string
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host,
            self.port(),
            self.database,
            self.user,
            self.password
        )
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("tls", &self.tls)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Object storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
    Memory,
}

/// Where staging files are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Environment name, part of the namespace (dev, qa, prod, ...)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub backend: StorageBackend,

    /// Root directory for the local backend
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

fn default_key_prefix() -> String {
    "stagehouse".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "stagehouse-temp".to_string(),
            key_prefix: default_key_prefix(),
            environment: default_environment(),
            region: None,
            backend: StorageBackend::default(),
            local_root: None,
        }
    }
}

impl StorageConfig {
    /// Key namespace shared by all tables of this environment
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.key_prefix.trim_matches('/'), self.environment)
    }

    /// Deterministic object key for a target table's staging file
    pub fn object_key(&self, target_table: &str, compressed: bool) -> String {
        let file = if compressed { "output.tsv.gz" } else { "output.tsv" };
        format!("{}/{}/{}", self.namespace(), target_table.replace('.', "-"), file)
    }
}

/// Credentials the warehouse uses to read the staging bucket
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopyCredentials {
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
    },
    IamRole {
        iam_role: String,
    },
}

impl CopyCredentials {
    /// Value of the COPY `CREDENTIALS` clause
    pub fn clause_value(&self) -> String {
        match self {
            Self::AccessKey { access_key_id, secret_access_key } => format!(
                "aws_access_key_id={};aws_secret_access_key={}",
                access_key_id, secret_access_key
            ),
            Self::IamRole { iam_role } => format!("aws_iam_role={}", iam_role),
        }
    }
}

impl std::fmt::Debug for CopyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessKey { access_key_id, .. } => f
                .debug_struct("AccessKey")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"***")
                .finish(),
            Self::IamRole { iam_role } => f.debug_struct("IamRole").field("iam_role", iam_role).finish(),
        }
    }
}

/// Batch control service endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_server")]
    pub server: String,

    #[serde(default = "default_batch_port")]
    pub port: String,

    /// Host name fragment of the HTTP gateway that serves the service under `/batchy`
    #[serde(default = "default_batch_gateway")]
    pub gateway: String,
}

fn default_batch_gateway() -> String {
    "hypergate".to_string()
}

fn default_batch_server() -> String {
    "0.0.0.0".to_string()
}

fn default_batch_port() -> String {
    "8050".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            server: default_batch_server(),
            port: default_batch_port(),
            gateway: default_batch_gateway(),
        }
    }
}

/// Source extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Rows fetched per round trip
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,

    /// Directory for local staging files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Ping the warehouse every N fetched batches
    #[serde(default = "default_keepalive_batches")]
    pub keepalive_batches: usize,
}

fn default_fetch_batch_size() -> usize {
    20_000
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_keepalive_batches() -> usize {
    50
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            fetch_batch_size: default_fetch_batch_size(),
            temp_dir: default_temp_dir(),
            keepalive_batches: default_keepalive_batches(),
        }
    }
}

/// A privilege granted on every loaded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantConfig {
    /// e.g. `all`, `select`
    pub privilege: String,

    /// e.g. `etl_user`, `group ro_users`
    pub grantee: String,
}

/// Warehouse load settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub max_errors: u32,

    #[serde(default)]
    pub grants: Vec<GrantConfig>,
}

/// Row-count reconciliation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Largest tolerated (source - target) / source
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.01
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

/// Execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Tables processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deadline for each pipeline stage
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

fn default_workers() -> usize {
    1
}

fn default_stage_timeout_secs() -> u64 {
    6 * 60 * 60
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn stage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Named database connections
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub copy_credentials: Option<CopyCredentials>,

    /// Batch control service (only needed for workflow runs)
    #[serde(default)]
    pub batch: Option<BatchConfig>,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Mask credentials in logged and reported SQL
    #[serde(default = "default_redact")]
    pub redact_sensitive_data: bool,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_redact() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            storage: StorageConfig::default(),
            copy_credentials: None,
            batch: None,
            export: ExportConfig::default(),
            loader: LoaderConfig::default(),
            quality: QualityConfig::default(),
            runtime: RuntimeConfig::default(),
            redact_sensitive_data: default_redact(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Look up a named connection
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, ConfigError> {
        self.connections
            .get(name)
            .ok_or_else(|| ConfigError::MissingConnection(name.to_string()))
    }

    /// Override connection passwords from `STAGEHOUSE_<NAME>_PASSWORD`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (name, conn) in self.connections.iter_mut() {
            let key = format!("STAGEHOUSE_{}_PASSWORD", name.to_uppercase().replace('-', "_"));
            if let Some(password) = lookup(&key) {
                conn.password = password;
            }
        }
    }

    /// Local staging directory, relative paths resolved against the project root
    pub fn temp_dir(&self) -> PathBuf {
        if self.export.temp_dir.is_absolute() {
            self.export.temp_dir.clone()
        } else {
            self.project_root.join(&self.export.temp_dir)
        }
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("No connection named '{0}' in config")]
    MissingConnection(String),
}
