//! Source schema to warehouse DDL translation
//!
//! The mapping is total: every [`SourceType`] lands in exactly one warehouse type,
//! with `varchar(2000)` as the fallback for anything unrecognised.

use stagehouse_core::{lineage_columns, ColumnSchema, SourceType, TableClone, TargetColumnDef, WarehouseType};

/// Length used when the source reports none (or `-1` for `max`)
pub const DEFAULT_VARCHAR_LENGTH: u32 = 2000;

/// Largest varchar the warehouse accepts
pub const MAX_VARCHAR_LENGTH: u32 = 65535;

/// Width of a UUID rendered as text
pub const UUID_VARCHAR_LENGTH: u32 = 50;

/// Column names rewritten with a `v_` prefix
pub const RESERVED_NAMES: &[&str] = &[
    "partition", "user", "order", "group", "table", "column", "default", "offset", "limit",
    "from", "to", "select", "where", "open", "end",
];

/// Clamp a declared character length into the warehouse range
pub fn clamp_char_length(declared: Option<i64>) -> u32 {
    match declared {
        None => DEFAULT_VARCHAR_LENGTH,
        Some(n) if n < 0 => DEFAULT_VARCHAR_LENGTH,
        Some(n) if n > MAX_VARCHAR_LENGTH as i64 => MAX_VARCHAR_LENGTH,
        Some(n) => n as u32,
    }
}

/// Map one source column type to its warehouse type
pub fn map_type(column: &ColumnSchema) -> WarehouseType {
    match &column.source_type {
        SourceType::Temporal(_) => WarehouseType::Timestamp,
        SourceType::Uuid => WarehouseType::Varchar(UUID_VARCHAR_LENGTH),
        SourceType::Character(_) => WarehouseType::Varchar(clamp_char_length(column.max_length)),
        SourceType::SmallInteger(_) => WarehouseType::SmallInt,
        SourceType::Integer(_) => WarehouseType::Integer,
        SourceType::BigInteger(_) => WarehouseType::BigInt,
        SourceType::Decimal(_) => match (column.numeric_precision, column.numeric_scale) {
            (Some(p), Some(s)) => WarehouseType::Numeric(Some((p, s))),
            _ => WarehouseType::Numeric(None),
        },
        SourceType::Scalar(name) => WarehouseType::PassThrough(name.clone()),
        SourceType::Unrecognized(_) => WarehouseType::Varchar(DEFAULT_VARCHAR_LENGTH),
    }
}

/// Target name for a source column
pub fn target_column_name(name: &str) -> String {
    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        format!("v_{}", name)
    } else {
        name.to_string()
    }
}

/// Map one source column to its target definition
pub fn map_column(column: &ColumnSchema) -> TargetColumnDef {
    TargetColumnDef::new(target_column_name(&column.name), map_type(column))
}

/// Double-quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds target table definitions and their DDL
pub struct SchemaTranslator;

impl SchemaTranslator {
    /// Translate introspected source columns into a table clone
    ///
    /// Returns `None` when there are no columns: the source table does not exist
    /// and there is nothing to create.
    pub fn translate(
        source_table: &str,
        target_table: &str,
        columns: &[ColumnSchema],
    ) -> Option<TableClone> {
        if columns.is_empty() {
            return None;
        }

        let mut defs: Vec<TargetColumnDef> = columns.iter().map(map_column).collect();
        defs.extend(lineage_columns());

        Some(TableClone {
            source_table: source_table.to_string(),
            target_table: target_table.to_string(),
            columns: defs,
        })
    }

    /// `drop table if exists` for the target
    pub fn drop_statement(clone: &TableClone) -> String {
        format!("drop table if exists {};", clone.target_table)
    }

    /// `create table` for the target
    pub fn create_statement(clone: &TableClone) -> String {
        let body = clone
            .columns
            .iter()
            .map(|c| {
                // lineage names are fixed lower-case identifiers
                let name = if c.is_metadata { c.name.clone() } else { quote_ident(&c.name) };
                format!("  {} {}", name, c.warehouse_type)
            })
            .collect::<Vec<_>>()
            .join(",\n");

        format!("create table {} (\n{}\n);", clone.target_table, body)
    }

    /// Full DDL: drop then create
    pub fn ddl(clone: &TableClone) -> String {
        format!("{}\n{}", Self::drop_statement(clone), Self::create_statement(clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn col(name: &str, ty: &str) -> ColumnSchema {
        ColumnSchema::new(name, ty)
    }

    #[test]
    fn temporal_types_become_timestamp() {
        for ty in ["timestamp with time zone", "time without time zone", "datetime", "smalldatetime", "date"] {
            assert_eq!(map_type(&col("c", ty)), WarehouseType::Timestamp, "{}", ty);
        }
    }

    #[test]
    fn uuid_is_fixed_varchar() {
        assert_eq!(map_type(&col("id", "uuid")), WarehouseType::Varchar(50));
    }

    #[test]
    fn character_lengths_are_clamped() {
        assert_eq!(map_type(&col("c", "varchar").with_max_length(70000)), WarehouseType::Varchar(65535));
        assert_eq!(map_type(&col("c", "nvarchar").with_max_length(-5)), WarehouseType::Varchar(2000));
        assert_eq!(map_type(&col("c", "text")), WarehouseType::Varchar(2000));
        assert_eq!(map_type(&col("c", "char").with_max_length(3)), WarehouseType::Varchar(3));
        assert_eq!(clamp_char_length(Some(65535)), 65535);
    }

    #[test]
    fn integer_families() {
        for ty in ["bit", "tinyint", "smallint", "int2"] {
            assert_eq!(map_type(&col("c", ty)), WarehouseType::SmallInt);
        }
        assert_eq!(map_type(&col("c", "int")), WarehouseType::Integer);
        assert_eq!(map_type(&col("c", "int8")), WarehouseType::BigInt);
    }

    #[test]
    fn decimals_keep_precision_when_known() {
        assert_eq!(
            map_type(&col("c", "decimal").with_precision(18, 4)),
            WarehouseType::Numeric(Some((18, 4)))
        );
        assert_eq!(map_type(&col("c", "numeric")), WarehouseType::Numeric(None));
    }

    #[test]
    fn scalars_pass_through_and_unknown_falls_back() {
        assert_eq!(
            map_type(&col("c", "double precision")),
            WarehouseType::PassThrough("double precision".into())
        );
        assert_eq!(map_type(&col("c", "boolean")).to_string(), "boolean");
        assert_eq!(map_type(&col("c", "xml")), WarehouseType::Varchar(2000));
        assert_eq!(map_type(&col("c", "hierarchyid")), WarehouseType::Varchar(2000));
    }

    #[test]
    fn mapping_is_deterministic() {
        let columns = vec![
            col("a", "varchar").with_max_length(10),
            col("b", "numeric").with_precision(10, 2),
            col("c", "geometry"),
        ];
        let first: Vec<_> = columns.iter().map(map_column).collect();
        let second: Vec<_> = columns.iter().map(map_column).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn reserved_names_get_prefix() {
        assert_eq!(target_column_name("partition"), "v_partition");
        assert_eq!(target_column_name("Partition"), "v_Partition");
        assert_eq!(target_column_name("CustomerName"), "CustomerName");
    }

    #[test]
    fn no_columns_means_no_clone() {
        assert!(SchemaTranslator::translate("dbo.missing", "edw.missing", &[]).is_none());
    }

    #[test]
    fn clone_appends_lineage() {
        let clone = SchemaTranslator::translate(
            "dbo.users",
            "edw.users",
            &[col("id", "int"), col("name", "varchar").with_max_length(50), col("updated", "datetime")],
        )
        .unwrap();

        assert_eq!(clone.columns.len(), 3 + 4);
        assert_eq!(clone.data_columns().count(), 3);
        assert_eq!(
            SchemaTranslator::ddl(&clone),
            "drop table if exists edw.users;\n\
             create table edw.users (\n  \
             \"id\" integer,\n  \
             \"name\" varchar(50),\n  \
             \"updated\" timestamp,\n  \
             etl_source_system_cd varchar(50),\n  \
             etl_row_create_dts timestamp,\n  \
             etl_row_update_dts timestamp,\n  \
             etl_run_id bigint\n);"
        );
    }

    #[test]
    fn identifiers_escape_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
