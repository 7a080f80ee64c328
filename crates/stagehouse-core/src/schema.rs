//! Column metadata and the warehouse type system

use serde::{Deserialize, Serialize};

/// Source column type, classified into the families the warehouse mapping cares about
///
/// Every catalog `data_type` string maps to exactly one variant; names that are not
/// recognised land in `Unrecognized` rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "name", rename_all = "snake_case")]
pub enum SourceType {
    /// Date and time types that are widened to a warehouse timestamp
    Temporal(String),

    /// UUID / uniqueidentifier
    Uuid,

    /// Fixed and variable length character types
    Character(String),

    /// bit, tinyint, smallint
    SmallInteger(String),

    /// 32-bit integers
    Integer(String),

    /// 64-bit integers
    BigInteger(String),

    /// decimal / numeric
    Decimal(String),

    /// Scalar types the warehouse understands under the same name
    Scalar(String),

    /// Anything else
    Unrecognized(String),
}

impl SourceType {
    /// Classify a catalog type name
    pub fn parse(raw: &str) -> Self {
        let name = raw.trim().to_lowercase();

        match name.as_str() {
            "timestamp with time zone" | "timestamptz" | "time without time zone" | "time"
            | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" | "date" => {
                Self::Temporal(name)
            }

            "uuid" | "uniqueidentifier" => Self::Uuid,

            "char" | "varchar" | "character" | "nchar" | "bpchar" | "character varying"
            | "nvarchar" | "text" | "ntext" => Self::Character(name),

            "bit" | "tinyint" | "smallint" | "int2" => Self::SmallInteger(name),
            "int" | "integer" | "int4" => Self::Integer(name),
            "bigint" | "int8" => Self::BigInteger(name),

            "decimal" | "numeric" => Self::Decimal(name),

            "real" | "double precision" | "boolean" | "bool" | "float4" | "float8" | "float"
            | "timestamp" | "timestamp without time zone" => Self::Scalar(name),

            _ => Self::Unrecognized(name),
        }
    }

    /// Catalog name of the type (lower case)
    pub fn name(&self) -> &str {
        match self {
            Self::Uuid => "uuid",
            Self::Temporal(name)
            | Self::Character(name)
            | Self::SmallInteger(name)
            | Self::Integer(name)
            | Self::BigInteger(name)
            | Self::Decimal(name)
            | Self::Scalar(name)
            | Self::Unrecognized(name) => name,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A column as reported by the source catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name, case preserved
    pub name: String,

    /// Classified source type
    pub source_type: SourceType,

    /// Declared character length (`-1` for SQL Server `max`)
    pub max_length: Option<i64>,

    /// Declared numeric precision
    pub numeric_precision: Option<i64>,

    /// Declared numeric scale
    pub numeric_scale: Option<i64>,
}

impl ColumnSchema {
    /// Create a column from a name and a raw catalog type name
    pub fn new(name: impl Into<String>, data_type: &str) -> Self {
        Self {
            name: name.into(),
            source_type: SourceType::parse(data_type),
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
        }
    }

    /// Set the declared character length
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Set numeric precision and scale
    pub fn with_precision(mut self, precision: i64, scale: i64) -> Self {
        self.numeric_precision = Some(precision);
        self.numeric_scale = Some(scale);
        self
    }
}

/// Column type in warehouse DDL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "snake_case")]
pub enum WarehouseType {
    Timestamp,
    Varchar(u32),
    SmallInt,
    Integer,
    BigInt,

    /// numeric with optional (precision, scale)
    Numeric(Option<(i64, i64)>),

    /// Emitted verbatim
    PassThrough(String),
}

impl std::fmt::Display for WarehouseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp => write!(f, "timestamp"),
            Self::Varchar(n) => write!(f, "varchar({})", n),
            Self::SmallInt => write!(f, "smallint"),
            Self::Integer => write!(f, "integer"),
            Self::BigInt => write!(f, "bigint"),
            Self::Numeric(Some((p, s))) => write!(f, "numeric({},{})", p, s),
            Self::Numeric(None) => write!(f, "numeric"),
            Self::PassThrough(name) => write!(f, "{}", name),
        }
    }
}

/// A column definition in the target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumnDef {
    /// Target column name (reserved words already rewritten)
    pub name: String,

    /// Warehouse type
    pub warehouse_type: WarehouseType,

    /// True for the appended lineage columns
    pub is_metadata: bool,
}

impl TargetColumnDef {
    /// Create a data column
    pub fn new(name: impl Into<String>, warehouse_type: WarehouseType) -> Self {
        Self {
            name: name.into(),
            warehouse_type,
            is_metadata: false,
        }
    }

    /// Create a lineage column
    pub fn metadata(name: impl Into<String>, warehouse_type: WarehouseType) -> Self {
        Self {
            name: name.into(),
            warehouse_type,
            is_metadata: true,
        }
    }
}

/// Lineage column names, in the order they are appended to every table and row
pub const LINEAGE_COLUMNS: [&str; 4] = [
    "etl_source_system_cd",
    "etl_row_create_dts",
    "etl_row_update_dts",
    "etl_run_id",
];

/// The four lineage column definitions
pub fn lineage_columns() -> Vec<TargetColumnDef> {
    vec![
        TargetColumnDef::metadata(LINEAGE_COLUMNS[0], WarehouseType::Varchar(50)),
        TargetColumnDef::metadata(LINEAGE_COLUMNS[1], WarehouseType::Timestamp),
        TargetColumnDef::metadata(LINEAGE_COLUMNS[2], WarehouseType::Timestamp),
        TargetColumnDef::metadata(LINEAGE_COLUMNS[3], WarehouseType::BigInt),
    ]
}

/// Source table cloned into a target table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableClone {
    pub source_table: String,
    pub target_table: String,

    /// Data columns in source order followed by the lineage columns
    pub columns: Vec<TargetColumnDef>,
}

impl TableClone {
    /// Data columns only
    pub fn data_columns(&self) -> impl Iterator<Item = &TargetColumnDef> {
        self.columns.iter().filter(|c| !c.is_metadata)
    }

    /// Column names in table order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
