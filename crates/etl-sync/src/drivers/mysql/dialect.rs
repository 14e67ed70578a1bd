//! MySQL/MariaDB SQL dialect (Strategy pattern).
//!
//! Backtick quoting, `?` placeholders and `ON DUPLICATE KEY UPDATE` upserts.
//! Also used for TiDB, PolarDB and StarRocks, which speak the same syntax.

use crate::core::identifier::quote_mysql;
use crate::core::schema::TableRef;
use crate::core::traits::Dialect;
use crate::dialect::{is_key_column, DialectKind};
use crate::error::Result;
use crate::verify::MODULUS;

/// MySQL/MariaDB dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Create a new MySQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::Mysql
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_mysql(name)
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn default_schema_expr(&self) -> &'static str {
        "DATABASE()"
    }

    /// Length-prefixed `CONCAT` of every column, `MD5`, first 60 bits via
    /// `CONV`, summed as DECIMAL and reduced.
    fn range_digest_select(&self, columns: &[String]) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            let q = self.quote_identifier(column)?;
            parts.push(format!("COALESCE(CONCAT(CHAR_LENGTH({q}), ':', {q}), '~')"));
        }
        let row_hash = format!(
            "CAST(CONV(SUBSTRING(MD5(CONCAT({})), 1, 15), 16, 10) AS UNSIGNED)",
            parts.join(", ")
        );
        Ok(Some(format!(
            "COUNT(*), CAST(COALESCE(SUM({}), 0) % {} AS SIGNED)",
            row_hash, MODULUS
        )))
    }

    /// `INSERT ... ON DUPLICATE KEY UPDATE c = VALUES(c)` for each non-key
    /// column. When every column is a key, `pk = pk` keeps the statement valid
    /// while updating nothing.
    fn build_upsert_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
    ) -> Result<String> {
        let insert = self.build_insert_sql(table, columns)?;

        let mut updates = Vec::new();
        for column in columns.iter().filter(|c| !is_key_column(c, primary_key)) {
            let q = self.quote_identifier(column)?;
            updates.push(format!("{q} = VALUES({q})"));
        }
        if updates.is_empty() {
            let pk = primary_key.first().or_else(|| columns.first());
            if let Some(pk) = pk {
                let q = self.quote_identifier(pk)?;
                updates.push(format!("{q} = {q}"));
            }
        }

        Ok(format!("{} ON DUPLICATE KEY UPDATE {}", insert, updates.join(", ")))
    }
}
