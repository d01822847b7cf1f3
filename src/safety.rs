//! Read-only safety gate for candidate SQL
//!
//! A syntactic last-resort check, not a parser: statements must begin with
//! SELECT or WITH after comment stripping, must not start with a destructive
//! keyword, and receive a row limit through the active dialect adapter.
//! Execution is still expected to run under a read-only-privileged credential
//! where the deployment allows it.

use crate::dialect::DialectAdapter;
use crate::error::{EngineError, EngineResult};

/// Keywords rejected as the first keyword of a statement, shared across
/// dialects. Adapters may extend this list, never shrink it.
pub const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "REPLACE", "MERGE",
    "EXEC", "EXECUTE",
];

/// A statement that has passed the gate, with its row limit applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeSql {
    pub sql: String,
    pub row_limit: u32,
}

/// Remove leading whitespace, `--` line comments, and `/* */` block comments
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = match stripped.find('\n') {
                Some(pos) => stripped[pos + 1..].trim_start(),
                None => "",
            };
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = match stripped.find("*/") {
                Some(pos) => stripped[pos + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// The first keyword of a statement, uppercased
pub fn first_keyword(sql: &str) -> Option<String> {
    let body = strip_leading_comments(sql);
    let token: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token.to_ascii_uppercase())
    }
}

/// Validate a candidate statement as read-only and inject the row limit.
///
/// Rejections carry the offending keyword or reason; the caller treats a
/// rejection of freshly generated SQL as a generation failure, not a
/// database error.
pub fn validate(
    sql: &str,
    adapter: &dyn DialectAdapter,
    row_limit: u32,
) -> EngineResult<SafeSql> {
    let body = strip_leading_comments(sql);
    if body.trim().is_empty() {
        return Err(EngineError::UnsafeSqlRejected(
            "empty statement".to_string(),
        ));
    }

    // One statement per request; anything after the first terminator is
    // rejected rather than silently dropped.
    if let Some(pos) = body.find(';') {
        if !body[pos + 1..].trim().is_empty() {
            return Err(EngineError::UnsafeSqlRejected(
                "multiple statements are not allowed".to_string(),
            ));
        }
    }

    let keyword = first_keyword(body).ok_or_else(|| {
        EngineError::UnsafeSqlRejected("statement does not begin with a keyword".to_string())
    })?;

    if DESTRUCTIVE_KEYWORDS.contains(&keyword.as_str())
        || adapter
            .extra_destructive_keywords()
            .iter()
            .any(|k| k.eq_ignore_ascii_case(&keyword))
    {
        return Err(EngineError::UnsafeSqlRejected(format!(
            "destructive keyword {keyword}"
        )));
    }

    if keyword != "SELECT" && keyword != "WITH" {
        return Err(EngineError::UnsafeSqlRejected(format!(
            "statement must begin with SELECT or WITH, found {keyword}"
        )));
    }

    let limited = adapter.inject_row_limit(body, row_limit)?;
    Ok(SafeSql {
        sql: limited,
        row_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{PostgresAdapter, SqliteAdapter};
    use rstest::rstest;

    #[rstest]
    #[case("DELETE FROM users")]
    #[case("INSERT INTO users VALUES (1)")]
    #[case("DROP TABLE users")]
    #[case("UPDATE users SET name = 'x'")]
    #[case("TRUNCATE users")]
    #[case("MERGE INTO users USING dual ON (1=1)")]
    #[case("EXEC sp_who")]
    #[case("  -- sneaky\nDELETE FROM users")]
    #[case("/* comment */ ALTER TABLE users ADD c int")]
    fn test_destructive_statements_rejected(#[case] sql: &str) {
        let err = validate(sql, &PostgresAdapter, 1000).unwrap_err();
        assert!(matches!(err, EngineError::UnsafeSqlRejected(_)), "{sql}");
    }

    #[rstest]
    #[case("SELECT 1")]
    #[case("  -- note\nSELECT 1")]
    #[case("/* leading */ SELECT id FROM orders")]
    #[case("WITH t AS (SELECT 1 AS n) SELECT n FROM t")]
    fn test_read_only_statements_accepted(#[case] sql: &str) {
        assert!(validate(sql, &PostgresAdapter, 1000).is_ok(), "{sql}");
    }

    #[test]
    fn test_limit_injected_with_configured_bound() {
        let safe = validate("SELECT id FROM orders", &PostgresAdapter, 250).unwrap();
        assert_eq!(safe.sql, "SELECT id FROM orders LIMIT 250;");
        assert_eq!(safe.row_limit, 250);
    }

    #[test]
    fn test_revalidation_does_not_duplicate_limit() {
        let once = validate("SELECT id FROM orders", &PostgresAdapter, 1000).unwrap();
        let twice = validate(&once.sql, &PostgresAdapter, 1000).unwrap();
        assert_eq!(twice.sql.matches("LIMIT").count(), 1);
    }

    #[test]
    fn test_adapter_extension_applies() {
        let err = validate("PRAGMA journal_mode = DELETE", &SqliteAdapter, 1000).unwrap_err();
        assert!(matches!(err, EngineError::UnsafeSqlRejected(_)));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let err = validate(
            "SELECT 1; DELETE FROM users",
            &PostgresAdapter,
            1000,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnsafeSqlRejected(_)));
    }

    #[test]
    fn test_non_keyword_start_rejected() {
        assert!(validate("123", &PostgresAdapter, 1000).is_err());
        assert!(validate("-- only a comment", &PostgresAdapter, 1000).is_err());
    }
}
