//! SQL Server dialect (Strategy pattern).
//!
//! Bracket quoting, `@Pn` placeholders, `SELECT TOP (n)` and MERGE upserts
//! terminated with `;` as SQL Server requires.

use crate::core::identifier::quote_mssql;
use crate::core::schema::TableRef;
use crate::core::traits::Dialect;
use crate::dialect::{merge_clauses, DialectKind};
use crate::error::Result;
use crate::verify::MODULUS;

/// SQL Server dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new SQL Server dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn kind(&self) -> DialectKind {
        DialectKind::SqlServer
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_mssql(name)
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn default_schema_expr(&self) -> &'static str {
        "SCHEMA_NAME()"
    }

    fn apply_limit(&self, columns_sql: &str, rest_sql: &str, limit: usize) -> String {
        format!("SELECT TOP ({}) {} {}", limit, columns_sql, rest_sql)
    }

    /// `HASHBYTES('MD5', ...)` over the length-prefixed NVARCHAR text of each
    /// column, masked to 60 bits and summed as DECIMAL(38, 0).
    fn range_digest_select(&self, columns: &[String]) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            let q = self.quote_identifier(column)?;
            let text = format!("CAST({} AS NVARCHAR(MAX))", q);
            parts.push(format!(
                "CASE WHEN {q} IS NULL THEN N'~' ELSE CONCAT(LEN({text}), N':', {text}) END"
            ));
        }
        let row_hash = format!(
            "(CONVERT(BIGINT, SUBSTRING(HASHBYTES('MD5', CONCAT(N'', {})), 1, 8)) & {})",
            parts.join(", "),
            (1u64 << 60) - 1
        );
        Ok(Some(format!(
            "COUNT_BIG(*), CAST(COALESCE(SUM(CAST({} AS DECIMAL(38, 0))), 0) % {} AS BIGINT)",
            row_hash, MODULUS
        )))
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
            "MERGE INTO {} AS target USING (SELECT {}) AS source ON ({})",
            self.qualify_table(table)?,
            selected.join(", "),
            on
        );
        if !update.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", update));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            insert_cols, insert_vals
        ));
        Ok(sql)
    }
}
