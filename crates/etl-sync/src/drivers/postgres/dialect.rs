//! PostgreSQL SQL dialect (Strategy pattern).
//!
//! Double-quote quoting, `$n` placeholders and `ON CONFLICT ... DO UPDATE`
//! upserts. openGauss, KingbaseES and GaussDB share this syntax.
//!
//! Bucket digests hash each row server-side: every column is cast to text and
//! length-prefixed, the row text goes through `MD5`, and the first 60 bits of
//! the digest are summed.

use crate::core::identifier::quote_ansi;
use crate::core::schema::TableRef;
use crate::core::traits::Dialect;
use crate::dialect::{is_key_column, DialectKind};
use crate::error::Result;
use crate::verify::MODULUS;

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Create a new PostgreSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_ansi(name)
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn default_schema_expr(&self) -> &'static str {
        "current_schema()"
    }

    fn range_digest_select(&self, columns: &[String]) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            let text = format!("CAST({} AS TEXT)", self.quote_identifier(column)?);
            parts.push(format!("COALESCE(LENGTH({text}) || ':' || {text}, '~')"));
        }
        let row_hash = format!(
            "('x' || SUBSTR(MD5({}), 1, 15))::BIT(60)::BIGINT",
            parts.join(" || ")
        );
        Ok(Some(format!(
            "COUNT(*), (COALESCE(SUM({}), 0) % {})::BIGINT",
            row_hash, MODULUS
        )))
    }

    fn build_upsert_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
    ) -> Result<String> {
        let insert = self.build_insert_sql(table, columns)?;
        let conflict = self.column_list(primary_key)?;

        let mut updates = Vec::new();
        for column in columns.iter().filter(|c| !is_key_column(c, primary_key)) {
            let q = self.quote_identifier(column)?;
            updates.push(format!("{q} = EXCLUDED.{q}"));
        }
        if updates.is_empty() {
            if let Some(pk) = primary_key.first() {
                let q = self.quote_identifier(pk)?;
                updates.push(format!("{q} = EXCLUDED.{q}"));
            }
        }

        Ok(format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}",
            insert,
            conflict,
            updates.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::PageQuery;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quote_identifier() {
        let d = PostgresDialect::new();
        assert_eq!(d.quote_identifier("users").unwrap(), "\"users\"");
        assert_eq!(d.quote_identifier("my\"table").unwrap(), "\"my\"\"table\"");
    }

    #[test]
    fn test_upsert() {
        let d = PostgresDialect::new();
        let sql = d
            .build_upsert_sql(
                &TableRef::new(Some("public"), "orders"),
                &cols(&["id", "status", "total"]),
                &cols(&["id"]),
            )
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"orders\" (\"id\", \"status\", \"total\") VALUES ($1, $2, $3) \
             ON CONFLICT (\"id\") DO UPDATE SET \"status\" = EXCLUDED.\"status\", \"total\" = EXCLUDED.\"total\""
        );
    }

    #[test]
    fn test_upsert_all_key_columns() {
        let d = PostgresDialect::new();
        let sql = d
            .build_upsert_sql(&TableRef::new(None, "tags"), &cols(&["a", "b"]), &cols(&["a", "b"]))
            .unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"a\", \"b\") DO UPDATE SET \"a\" = EXCLUDED.\"a\""));
    }

    #[test]
    fn test_truncate_and_delete_all() {
        let d = PostgresDialect::new();
        let t = TableRef::new(Some("s"), "t");
        assert_eq!(d.build_truncate_sql(&t).unwrap(), "TRUNCATE TABLE \"s\".\"t\"");
        assert_eq!(d.build_delete_all_sql(&t).unwrap(), "DELETE FROM \"s\".\"t\"");
    }

    #[test]
    fn test_select_range() {
        let d = PostgresDialect::new();
        let t = TableRef::new(None, "t");
        assert_eq!(
            d.build_select_range_sql(&t, &cols(&["id", "v"]), "id", true, None).unwrap(),
            "SELECT \"id\", \"v\" FROM \"t\" WHERE \"id\" >= $1 AND \"id\" < $2"
        );
        assert_eq!(
            d.build_select_range_sql(&t, &cols(&["id"]), "id", false, Some("v > 0")).unwrap(),
            "SELECT \"id\" FROM \"t\" WHERE \"id\" >= $1 AND (v > 0)"
        );
    }

    #[test]
    fn test_range_digest() {
        let d = PostgresDialect::new();
        let sql = d
            .build_range_digest_sql(&TableRef::new(None, "t"), &cols(&["id", "v"]), "id", true, None)
            .unwrap()
            .unwrap();
        assert!(sql.starts_with("SELECT COUNT(*), (COALESCE(SUM(('x' || SUBSTR(MD5("));
        assert!(sql.contains("COALESCE(LENGTH(CAST(\"v\" AS TEXT)) || ':' || CAST(\"v\" AS TEXT), '~')"));
        assert!(sql.contains("% 2305843009213693951)::BIGINT"));
        assert!(sql.ends_with("FROM \"t\" WHERE \"id\" >= $1 AND \"id\" < $2"));
    }

    #[test]
    fn test_keyset_page_incremental() {
        let d = PostgresDialect::new();
        let t = TableRef::new(None, "t");
        let columns = cols(&["id", "updated_at", "v"]);
        let order = cols(&["updated_at", "id"]);
        let sql = d
            .build_keyset_page_sql(&PageQuery {
                table: &t,
                columns: &columns,
                order_by: &order,
                watermark_column: Some("updated_at"),
                has_watermark: true,
                has_cursor: true,
                filter: None,
                limit: 500,
            })
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\", \"updated_at\", \"v\" FROM \"t\" WHERE \"updated_at\" IS NOT NULL \
             AND \"updated_at\" > $1 AND ((\"updated_at\" > $2) OR (\"updated_at\" = $3 AND \"id\" > $4)) \
             ORDER BY \"updated_at\", \"id\" LIMIT 500"
        );
    }

    #[test]
    fn test_keyset_first_full_page() {
        let d = PostgresDialect::new();
        let t = TableRef::new(None, "t");
        let columns = cols(&["id"]);
        let sql = d
            .build_keyset_page_sql(&PageQuery {
                table: &t,
                columns: &columns,
                order_by: &columns,
                watermark_column: None,
                has_watermark: false,
                has_cursor: false,
                filter: Some("tenant = 1"),
                limit: 10,
            })
            .unwrap();
        assert_eq!(sql, "SELECT \"id\" FROM \"t\" WHERE (tenant = 1) ORDER BY \"id\" LIMIT 10");
    }

    #[test]
    fn test_bounds_and_count() {
        let d = PostgresDialect::new();
        let t = TableRef::new(None, "t");
        assert_eq!(
            d.build_bounds_sql(&t, "id", None).unwrap(),
            "SELECT MIN(\"id\"), MAX(\"id\") FROM \"t\""
        );
        assert_eq!(
            d.build_count_sql(&t, Some("a = 1")).unwrap(),
            "SELECT COUNT(*) FROM \"t\" WHERE (a = 1)"
        );
    }

    #[test]
    fn test_delete_by_pk_in() {
        let d = PostgresDialect::new();
        assert_eq!(
            d.build_delete_by_pk_in_sql(&TableRef::new(None, "t"), "id", 3).unwrap(),
            "DELETE FROM \"t\" WHERE \"id\" IN ($1, $2, $3)"
        );
    }
}
