//! Warehouse load statements: COPY, full refresh, and key-based merge

use stagehouse_core::config::GrantConfig;
use crate::translator::target_column_name;
use stagehouse_core::{LoadOptions, LoadPlan, LINEAGE_COLUMNS, NULL_LITERAL};

/// COPY directives for the given options, in a fixed order
pub fn directive_clause(options: &LoadOptions) -> String {
    let mut directives = Vec::new();
    if options.gzip {
        directives.push("GZIP");
    }
    if options.manifest {
        directives.push("MANIFEST");
    }
    if options.remove_quotes {
        directives.push("REMOVEQUOTES");
    }
    directives.join(" ")
}

/// Render a delimiter as a COPY string literal body
fn delimiter_literal(delimiter: char) -> String {
    match delimiter {
        '\t' => "\\t".to_string(),
        '\'' => "''".to_string(),
        c => c.to_string(),
    }
}

/// COPY column list for a plan that extracts only some columns
///
/// Staged rows carry the lineage values after the selected fields, so the
/// lineage columns close the list. Empty when the whole table is extracted.
pub fn copy_columns(plan: &LoadPlan) -> Vec<String> {
    if plan.select_fields.is_empty() {
        return Vec::new();
    }
    plan.select_fields
        .iter()
        .map(|f| target_column_name(f))
        .chain(LINEAGE_COLUMNS.iter().map(|c| c.to_string()))
        .collect()
}

/// A single `COPY ... from '<uri>'` statement
#[derive(Debug, Clone)]
pub struct CopyStatement<'a> {
    table: &'a str,
    uri: &'a str,
    credentials: Option<&'a str>,
    plan: &'a LoadPlan,
}

impl<'a> CopyStatement<'a> {
    pub fn new(table: &'a str, uri: &'a str, plan: &'a LoadPlan) -> Self {
        Self {
            table,
            uri,
            credentials: None,
            plan,
        }
    }

    /// Value of the `CREDENTIALS` clause; without one the cluster's default role is used
    pub fn credentials(mut self, credentials: Option<&'a str>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn build(&self) -> String {
        let mut sql = format!("COPY {}", self.table);

        let columns = copy_columns(self.plan);
        if !columns.is_empty() {
            sql.push_str(&format!(" ({})", columns.join(",")));
        }

        sql.push_str(&format!(" from '{}'", self.uri));

        match self.credentials {
            Some(creds) => sql.push_str(&format!(" CREDENTIALS '{}'", creds)),
            None => sql.push_str(" IAM_ROLE default"),
        }

        if self.plan.csv_format {
            sql.push_str(" CSV");
        } else {
            sql.push_str(&format!(" delimiter '{}'", delimiter_literal(self.plan.delimiter)));
        }

        sql.push_str(&format!(
            " dateformat 'YYYY-MM-DD' NULL AS '{}' truncatecolumns maxerror {}",
            NULL_LITERAL, self.plan.max_errors
        ));

        let directives = directive_clause(&self.plan.options);
        if !directives.is_empty() {
            sql.push(' ');
            sql.push_str(&directives);
        }

        sql.push(';');
        sql
    }
}

/// Name of the session temp table used to merge into `target`
pub fn temp_table_name(target: &str) -> String {
    format!("tmp_{}", target.replace('.', "_"))
}

/// `tmp.k1 = target.k1 and tmp.k2 = target.k2`
pub fn merge_condition(keys: &[String], temp_table: &str, target: &str) -> String {
    keys.iter()
        .map(|k| format!("{}.{} = {}.{}", temp_table, k, target, k))
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Statements that load one artifact, meant to run as a single transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadScript {
    pub statements: Vec<String>,

    /// Temp table created by an incremental load
    pub temp_table: Option<String>,
}

impl LoadScript {
    /// Build the script for a plan
    pub fn for_plan(plan: &LoadPlan, uri: &str, credentials: Option<&str>) -> Self {
        if plan.incremental {
            Self::incremental(plan, uri, credentials)
        } else {
            Self::full(plan, uri, credentials)
        }
    }

    /// Delete everything, then COPY straight into the target
    fn full(plan: &LoadPlan, uri: &str, credentials: Option<&str>) -> Self {
        let target = plan.target_table.as_str();
        Self {
            statements: vec![
                format!("delete from {};", target),
                CopyStatement::new(target, uri, plan).credentials(credentials).build(),
            ],
            temp_table: None,
        }
    }

    /// COPY into a temp table shaped like the target, then replace matching keys
    fn incremental(plan: &LoadPlan, uri: &str, credentials: Option<&str>) -> Self {
        let target = plan.target_table.as_str();
        let tmp = temp_table_name(target);

        Self {
            statements: vec![
                format!("drop table if exists {};", tmp),
                format!("create temporary table {} (like {});", tmp, target),
                CopyStatement::new(&tmp, uri, plan).credentials(credentials).build(),
                format!(
                    "delete from {} where exists (select 1 from {} where {});",
                    target,
                    tmp,
                    merge_condition(&plan.key_fields, &tmp, target)
                ),
                format!("insert into {} select * from {};", target, tmp),
            ],
            temp_table: Some(tmp),
        }
    }
}

/// Grant statements applied after a load
pub fn grant_statements(target: &str, grants: &[GrantConfig]) -> Vec<String> {
    grants
        .iter()
        .map(|g| format!("grant {} on {} to {};", g.privilege, target, g.grantee))
        .collect()
}

/// Manifest listing the given object URLs, all mandatory
pub fn manifest_json(urls: &[String]) -> String {
    let entries: Vec<_> = urls
        .iter()
        .map(|url| serde_json::json!({ "url": url, "mandatory": true }))
        .collect();
    serde_json::json!({ "entries": entries }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const URI: &str = "s3://bucket/stagehouse/dev/edw-users/output.tsv.gz";

    fn options(gzip: bool, manifest: bool, remove_quotes: bool) -> LoadOptions {
        LoadOptions { gzip, manifest, remove_quotes }
    }

    #[test]
    fn directive_order_is_stable() {
        assert_eq!(directive_clause(&options(false, false, false)), "");
        assert_eq!(directive_clause(&options(true, false, false)), "GZIP");
        assert_eq!(directive_clause(&options(false, true, true)), "MANIFEST REMOVEQUOTES");
        assert_eq!(directive_clause(&options(true, true, true)), "GZIP MANIFEST REMOVEQUOTES");
    }

    #[test]
    fn copy_statement_full_form() {
        let plan = LoadPlan::builder("edw.users").max_errors(10).build().unwrap();
        let sql = CopyStatement::new("edw.users", URI, &plan)
            .credentials(Some("aws_iam_role=arn:role"))
            .build();
        assert_eq!(
            sql,
            "COPY edw.users from 's3://bucket/stagehouse/dev/edw-users/output.tsv.gz' \
             CREDENTIALS 'aws_iam_role=arn:role' delimiter '\\t' dateformat 'YYYY-MM-DD' \
             NULL AS 'None' truncatecolumns maxerror 10 GZIP;"
        );
    }

    #[test]
    fn copy_statement_with_columns_and_csv() {
        let plan = LoadPlan::builder("edw.users")
            .select_fields(vec!["id".into(), "name".into()])
            .remove_quotes(true)
            .gzip(false)
            .csv_format(true)
            .build()
            .unwrap();
        let sql = CopyStatement::new("edw.users", URI, &plan).build();
        assert!(sql.starts_with(
            "COPY edw.users (id,name,etl_source_system_cd,etl_row_create_dts,etl_row_update_dts,etl_run_id) from '"
        ));
        assert!(sql.contains(" IAM_ROLE default CSV dateformat"));
        assert!(sql.ends_with("maxerror 0 REMOVEQUOTES;"));
    }

    #[test]
    fn copy_columns_rename_reserved_fields() {
        let plan = LoadPlan::builder("edw.orders")
            .select_fields(vec!["id".into(), "order".into()])
            .remove_quotes(true)
            .build()
            .unwrap();
        assert_eq!(
            copy_columns(&plan),
            vec![
                "id",
                "v_order",
                "etl_source_system_cd",
                "etl_row_create_dts",
                "etl_row_update_dts",
                "etl_run_id"
            ]
        );

        let all = LoadPlan::builder("edw.orders").build().unwrap();
        assert!(copy_columns(&all).is_empty());
    }

    #[test]
    fn full_script_deletes_then_copies() {
        let plan = LoadPlan::builder("edw.users").build().unwrap();
        let script = LoadScript::for_plan(&plan, URI, None);
        assert_eq!(script.statements.len(), 2);
        assert_eq!(script.statements[0], "delete from edw.users;");
        assert!(script.statements[1].starts_with("COPY edw.users from"));
        assert!(script.temp_table.is_none());
    }

    #[test]
    fn incremental_script_merges_by_key() {
        let plan = LoadPlan::builder("edw.users")
            .incremental(vec!["id".into(), "region".into()])
            .build()
            .unwrap();
        let script = LoadScript::for_plan(&plan, URI, None);

        assert_eq!(script.temp_table.as_deref(), Some("tmp_edw_users"));
        assert_eq!(script.statements[0], "drop table if exists tmp_edw_users;");
        assert_eq!(script.statements[1], "create temporary table tmp_edw_users (like edw.users);");
        assert!(script.statements[2].starts_with("COPY tmp_edw_users from"));
        assert_eq!(
            script.statements[3],
            "delete from edw.users where exists (select 1 from tmp_edw_users where \
             tmp_edw_users.id = edw.users.id and tmp_edw_users.region = edw.users.region);"
        );
        assert_eq!(script.statements[4], "insert into edw.users select * from tmp_edw_users;");
    }

    #[test]
    fn grants() {
        let grants = vec![
            GrantConfig { privilege: "all".into(), grantee: "etl_user".into() },
            GrantConfig { privilege: "select".into(), grantee: "group ro_users".into() },
        ];
        assert_eq!(
            grant_statements("edw.users", &grants),
            vec![
                "grant all on edw.users to etl_user;".to_string(),
                "grant select on edw.users to group ro_users;".to_string(),
            ]
        );
        assert!(grant_statements("edw.users", &[]).is_empty());
    }

    #[test]
    fn manifest_entries() {
        let json = manifest_json(&["s3://b/k1".to_string(), "s3://b/k2".to_string()]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["entries"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["entries"][1]["url"], "s3://b/k2");
        assert_eq!(parsed["entries"][0]["mandatory"], true);
    }
}
