//! Fallback dialect for engines no other dialect recognizes.
//!
//! ANSI quoting, `?` placeholders and `LIMIT n`. There is no portable upsert,
//! so [`Dialect::build_upsert_sql`] emits a plain INSERT.

use crate::core::identifier::quote_ansi;
use crate::core::schema::TableRef;
use crate::core::traits::Dialect;
use crate::dialect::DialectKind;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct GenericDialect;

impl GenericDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for GenericDialect {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::Generic
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_ansi(name)
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn default_schema_expr(&self) -> &'static str {
        "CURRENT_SCHEMA"
    }

    fn build_upsert_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        _primary_key: &[String],
    ) -> Result<String> {
        self.build_insert_sql(table, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_upsert_is_plain_insert() {
        let d = GenericDialect::new();
        let columns = vec!["id".to_string(), "v".to_string()];
        assert_eq!(
            d.build_upsert_sql(&TableRef::new(None, "t"), &columns, &columns[..1]).unwrap(),
            "INSERT INTO \"t\" (\"id\", \"v\") VALUES (?, ?)"
        );
    }

    #[test]
    fn test_generic_has_no_range_digest() {
        let d = GenericDialect::new();
        let columns = vec!["id".to_string()];
        assert!(d
            .build_range_digest_sql(&TableRef::new(None, "t"), &columns, "id", true, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_by_key() {
        let d = GenericDialect::new();
        let key = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            d.build_delete_by_key_sql(&TableRef::new(None, "t"), &key).unwrap(),
            "DELETE FROM \"t\" WHERE \"a\" = ? AND \"b\" = ?"
        );
    }

    #[test]
    fn test_generic_rejects_invalid_identifier() {
        let d = GenericDialect::new();
        assert!(d.quote_identifier("a\0b").is_err());
    }
}
