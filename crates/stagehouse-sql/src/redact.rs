//! Masking of secrets embedded in generated SQL

use regex::Regex;
use std::sync::OnceLock;

fn credentials_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)CREDENTIALS\s+'[^']*'").expect("valid regex"))
}

/// Replace the value of every `CREDENTIALS '...'` clause with `***`
pub fn redact_credentials(sql: &str) -> String {
    credentials_pattern()
        .replace_all(sql, "CREDENTIALS '***'")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_key_pairs() {
        let sql = "COPY t from 's3://b/k' CREDENTIALS 'aws_access_key_id=AKIA;aws_secret_access_key=abc' GZIP;";
        let redacted = redact_credentials(sql);
        assert_eq!(redacted, "COPY t from 's3://b/k' CREDENTIALS '***' GZIP;");
        assert!(!redacted.contains("abc"));
    }

    #[test]
    fn leaves_other_sql_alone() {
        assert_eq!(redact_credentials("delete from t;"), "delete from t;");
    }
}
