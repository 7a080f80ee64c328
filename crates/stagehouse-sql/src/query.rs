//! Source-side queries: extraction and row counts

use chrono::NaiveDateTime;
use stagehouse_core::ConnectionKind;

/// Format of the watermark literal in extraction filters
pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M";

/// SQL dialect of the source database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceDialect {
    /// SQL Server: reads use a `with (nolock)` hint
    Mssql,

    /// PostgreSQL and Redshift
    Postgres,
}

impl From<ConnectionKind> for SourceDialect {
    fn from(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Mssql => Self::Mssql,
            ConnectionKind::Postgres | ConnectionKind::Redshift => Self::Postgres,
        }
    }
}

/// `select` used to stream a source table into a staging file
#[derive(Debug, Clone)]
pub struct ExtractQuery<'a> {
    source_table: &'a str,
    dialect: SourceDialect,
    select_fields: &'a [String],
    date_fields: &'a [String],
    from_date: Option<NaiveDateTime>,
}

impl<'a> ExtractQuery<'a> {
    pub fn new(source_table: &'a str, dialect: SourceDialect) -> Self {
        Self {
            source_table,
            dialect,
            select_fields: &[],
            date_fields: &[],
            from_date: None,
        }
    }

    /// Project an explicit column list instead of `*`
    pub fn select_fields(mut self, fields: &'a [String]) -> Self {
        self.select_fields = fields;
        self
    }

    /// Only rows where any date field is after the watermark
    ///
    /// Ignored unless both fields and a watermark are present.
    pub fn changed_since(mut self, date_fields: &'a [String], from_date: Option<NaiveDateTime>) -> Self {
        self.date_fields = date_fields;
        self.from_date = from_date;
        self
    }

    /// Whether the query filters on the watermark
    pub fn is_filtered(&self) -> bool {
        !self.date_fields.is_empty() && self.from_date.is_some()
    }

    pub fn build(&self) -> String {
        let select = if self.select_fields.is_empty() {
            "*".to_string()
        } else {
            self.select_fields.join(",")
        };

        let mut sql = format!("select {} from {}", select, self.source_table);

        if self.dialect == SourceDialect::Mssql {
            sql.push_str(" with (nolock)");
        }

        if let (false, Some(from_date)) = (self.date_fields.is_empty(), self.from_date) {
            let stamp = from_date.format(WATERMARK_FORMAT);
            let predicates = self
                .date_fields
                .iter()
                .map(|field| format!("{} > '{}'", field, stamp))
                .collect::<Vec<_>>()
                .join(" or ");
            sql.push_str(" where ");
            sql.push_str(&predicates);
        }

        sql
    }
}

/// Row count of a table
pub fn count_query(table: &str) -> String {
    format!("select count(1) from {}", table)
}

/// No-op query used to keep idle connections alive
pub const KEEPALIVE_QUERY: &str = "select 1";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn watermark() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(6, 30, 59).unwrap()
    }

    #[test]
    fn full_extract_on_sql_server() {
        let sql = ExtractQuery::new("dbo.users", SourceDialect::Mssql).build();
        assert_eq!(sql, "select * from dbo.users with (nolock)");
    }

    #[test]
    fn postgres_has_no_hint() {
        let sql = ExtractQuery::new("public.users", SourceDialect::Postgres).build();
        assert_eq!(sql, "select * from public.users");
    }

    #[test]
    fn date_filters_are_or_combined() {
        let dates = vec!["created_at".to_string(), "updated_at".to_string()];
        let q = ExtractQuery::new("dbo.users", SourceDialect::Mssql).changed_since(&dates, Some(watermark()));
        assert!(q.is_filtered());
        assert_eq!(
            q.build(),
            "select * from dbo.users with (nolock) where created_at > '2024-05-01 06:30' or updated_at > '2024-05-01 06:30'"
        );
    }

    #[test]
    fn filter_needs_watermark() {
        let dates = vec!["updated_at".to_string()];
        let q = ExtractQuery::new("dbo.users", SourceDialect::Postgres).changed_since(&dates, None);
        assert!(!q.is_filtered());
        assert_eq!(q.build(), "select * from dbo.users");
    }

    #[test]
    fn projection() {
        let fields = vec!["id".to_string(), "name".to_string()];
        let sql = ExtractQuery::new("users", SourceDialect::Postgres).select_fields(&fields).build();
        assert_eq!(sql, "select id,name from users");
    }

    #[test]
    fn dialect_from_connection_kind() {
        assert_eq!(SourceDialect::from(ConnectionKind::Mssql), SourceDialect::Mssql);
        assert_eq!(SourceDialect::from(ConnectionKind::Redshift), SourceDialect::Postgres);
        assert_eq!(count_query("edw.users"), "select count(1) from edw.users");
    }
}
