//! Identifier validation and quoting shared by every dialect.
//!
//! SQL identifiers (table, column and schema names) cannot be bound as
//! parameters, so every generated statement splices them into the text. Each
//! dialect therefore goes through this module: the name is validated first and
//! then wrapped in the engine's quote characters with the closing quote doubled.
//! Doubling keeps quoting injective: two different names never produce the same
//! quoted text, and no name can terminate the quoted region early.
//!
//! Job filter conditions are raw SQL predicates from configuration. They are
//! trusted input, but [`validate_filter_condition`] still refuses statement
//! stacking and comment markers before one is spliced into a query.

use crate::error::{Result, SyncError};

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - SQL Server: 128 characters
/// - MySQL: 64 characters
/// - Oracle: 128 bytes (12.2+)
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier.
///
/// Rejects empty names, names containing a null byte, and names longer than
/// [`MAX_IDENTIFIER_LENGTH`] bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(SyncError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

fn quote_with(name: &str, open: char, close: char) -> Result<String> {
    validate_identifier(name)?;
    let escaped = name.replace(close, &format!("{close}{close}"));
    Ok(format!("{open}{escaped}{close}"))
}

/// Quote an ANSI identifier with double quotes (PostgreSQL, Oracle, generic).
pub fn quote_ansi(name: &str) -> Result<String> {
    quote_with(name, '"', '"')
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    quote_with(name, '`', '`')
}

/// Quote a SQL Server identifier using brackets.
///
/// Only the closing bracket needs escaping inside a bracketed name.
pub fn quote_mssql(name: &str) -> Result<String> {
    quote_with(name, '[', ']')
}

/// Normalize an optional schema: blank or whitespace-only schemas become `None`.
pub fn normalize_schema(schema: Option<&str>) -> Option<String> {
    schema
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Validate a job filter condition before it is spliced into a WHERE clause.
///
/// Rejects semicolons (statement stacking) and SQL comment markers, which
/// could otherwise neutralize the predicates generated around the filter.
pub fn validate_filter_condition(condition: &str) -> Result<()> {
    if condition.trim().is_empty() {
        return Err(SyncError::Config(
            "filter_condition cannot be blank; omit it instead".to_string(),
        ));
    }

    if condition.contains(';') {
        return Err(SyncError::Config(format!(
            "SECURITY: filter_condition contains semicolon (possible injection): {:?}",
            condition
        )));
    }

    if condition.contains("--") || condition.contains("/*") || condition.contains("*/") {
        return Err(SyncError::Config(format!(
            "SECURITY: filter_condition contains SQL comment markers (possible injection): {:?}",
            condition
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("my_table").is_ok());
        assert!(validate_identifier("Order Details").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_bad_names() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("users\0; DROP TABLE x").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
        assert!(validate_identifier(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_quote_ansi_doubles_quotes() {
        assert_eq!(quote_ansi("users").unwrap(), "\"users\"");
        assert_eq!(quote_ansi("we\"ird").unwrap(), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_mysql_doubles_backticks() {
        assert_eq!(quote_mysql("users").unwrap(), "`users`");
        assert_eq!(quote_mysql("a`b").unwrap(), "`a``b`");
    }

    #[test]
    fn test_quote_mssql_escapes_closing_bracket() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("a]b").unwrap(), "[a]]b]");
        assert_eq!(quote_mssql("a[b").unwrap(), "[a[b]");
    }

    #[test]
    fn test_quoting_is_injective() {
        // "a""" and "a" + quote must not collide after quoting
        let one = quote_ansi("a\"").unwrap();
        let two = quote_ansi("a").unwrap();
        assert_ne!(one, two);
        assert_ne!(quote_mysql("x`").unwrap(), quote_mysql("x").unwrap());
    }

    #[test]
    fn test_normalize_schema() {
        assert_eq!(normalize_schema(None), None);
        assert_eq!(normalize_schema(Some("")), None);
        assert_eq!(normalize_schema(Some("   ")), None);
        assert_eq!(normalize_schema(Some(" dbo ")), Some("dbo".to_string()));
    }

    #[test]
    fn test_validate_filter_condition() {
        assert!(validate_filter_condition("status = 'ACTIVE'").is_ok());
        assert!(validate_filter_condition("tenant_id IN (1, 2)").is_ok());
        assert!(validate_filter_condition("1=1; DELETE FROM orders").is_err());
        assert!(validate_filter_condition("1=1 -- tail").is_err());
        assert!(validate_filter_condition("1=1 /* x */").is_err());
        assert!(validate_filter_condition("  ").is_err());
    }
}
