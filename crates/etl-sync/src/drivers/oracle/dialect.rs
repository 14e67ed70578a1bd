//! Oracle SQL dialect.
//!
//! Double-quote quoting, `:n` placeholders, `FETCH FIRST n ROWS ONLY` and
//! `MERGE ... USING (SELECT ... FROM dual)` upserts.

use crate::core::identifier::quote_ansi;
use crate::core::schema::TableRef;
use crate::core::traits::Dialect;
use crate::dialect::{merge_clauses, DialectKind};
use crate::error::Result;

/// Oracle dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct OracleDialect;

impl OracleDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::Oracle
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_ansi(name)
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn default_schema_expr(&self) -> &'static str {
        "SYS_CONTEXT('USERENV','CURRENT_SCHEMA')"
    }

    fn apply_limit(&self, columns_sql: &str, rest_sql: &str, limit: usize) -> String {
        format!(
            "SELECT {} {} FETCH FIRST {} ROWS ONLY",
            columns_sql, rest_sql, limit
        )
    }

    fn build_upsert_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
    ) -> Result<String> {
        let mut selected = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            selected.push(format!(
                "{} AS {}",
                self.param_placeholder(i + 1),
                self.quote_identifier(column)?
            ));
        }
        let (on, update, insert_cols, insert_vals) = merge_clauses(self, columns, primary_key)?;

        let mut sql = format!(
            "MERGE INTO {} target USING (SELECT {} FROM dual) source ON ({})",
            self.qualify_table(table)?,
            selected.join(", "),
            on
        );
        if !update.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", update));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            insert_cols, insert_vals
        ));
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_placeholders_and_limit() {
        let d = OracleDialect::new();
        assert_eq!(d.placeholders(1, 3), ":1, :2, :3");
        assert_eq!(
            d.apply_limit("\"A\"", "FROM \"T\" ORDER BY \"A\"", 50),
            "SELECT \"A\" FROM \"T\" ORDER BY \"A\" FETCH FIRST 50 ROWS ONLY"
        );
    }

    #[test]
    fn test_merge_upsert() {
        let d = OracleDialect::new();
        let sql = d
            .build_upsert_sql(&TableRef::new(Some("APP"), "ITEMS"), &cols(&["ID", "NAME"]), &cols(&["ID"]))
            .unwrap();
        assert_eq!(
            sql,
            "MERGE INTO \"APP\".\"ITEMS\" target USING (SELECT :1 AS \"ID\", :2 AS \"NAME\" FROM dual) source \
             ON (target.\"ID\" = source.\"ID\") \
             WHEN MATCHED THEN UPDATE SET target.\"NAME\" = source.\"NAME\" \
             WHEN NOT MATCHED THEN INSERT (\"ID\", \"NAME\") VALUES (source.\"ID\", source.\"NAME\")"
        );
    }

    #[test]
    fn test_merge_without_update_when_all_columns_are_keys() {
        let d = OracleDialect::new();
        let sql = d
            .build_upsert_sql(&TableRef::new(None, "L"), &cols(&["A", "B"]), &cols(&["A", "B"]))
            .unwrap();
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("ON (target.\"A\" = source.\"A\" AND target.\"B\" = source.\"B\")"));
    }
}
