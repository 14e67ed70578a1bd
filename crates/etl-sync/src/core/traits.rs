//! Core traits for engine-agnostic synchronization.
//!
//! - [`Dialect`]: SQL text generation for one engine family (pure, no I/O)
//! - [`Datasource`]: a live, pooled connection that executes SQL text
//! - [`TableAccess`]: the table-level operations the sync engine needs, bound
//!   to one datasource and one dialect
//!
//! The orchestrator and the bucket engine only ever talk to [`TableAccess`].
//! [`crate::access::SqlTableAccess`] implements it by combining a `Datasource`
//! with the `Dialect` resolved for it.
//!
//! # Design Patterns
//!
//! - **Strategy**: `Dialect` implementations are interchangeable SQL generators
//! - **Template Method**: default methods on `Dialect` build every statement from
//!   `quote_identifier`, `param_placeholder` and `apply_limit`; engines override
//!   only what differs

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dialect::DialectKind;
use crate::error::Result;

use super::schema::{KeyKind, KeyRange, KeyValue, TableRef};
use super::value::{Row, SqlValue};

/// Product identification of a live connection, used for dialect resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Reported product name, e.g. "PostgreSQL 16.2" or "10.11.6-MariaDB".
    pub product_name: String,
    /// Connection URL with credentials removed.
    pub url: String,
}

/// SQL syntax strategy for one engine family.
///
/// Every method is pure string construction. Identifiers are validated and
/// quoted through [`crate::core::identifier`], so generation fails with
/// `SyncError::Config` rather than emitting unsafe SQL.
///
/// Placeholders are numbered from 1 in the order their values must be bound.
pub trait Dialect: Send + Sync {
    /// Dialect name (e.g., "mysql", "postgres").
    fn name(&self) -> &'static str;

    /// Engine family.
    fn kind(&self) -> DialectKind;

    /// Quote an identifier, escaping embedded quote characters.
    fn quote_identifier(&self, name: &str) -> Result<String>;

    /// Parameter placeholder for the 1-based parameter `index`.
    fn param_placeholder(&self, index: usize) -> String;

    /// Build an insert-or-update statement keyed by `primary_key`.
    fn build_upsert_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
    ) -> Result<String>;

    /// Expression yielding the connection's current schema.
    fn default_schema_expr(&self) -> &'static str;

    /// Append a row limit to a SELECT. `columns_sql` is the select list and
    /// `rest_sql` everything after it, starting at `FROM`.
    fn apply_limit(&self, columns_sql: &str, rest_sql: &str, limit: usize) -> String {
        format!("SELECT {} {} LIMIT {}", columns_sql, rest_sql, limit)
    }

    /// `schema.table` when a schema is given, otherwise just the table.
    fn qualify_table(&self, table: &TableRef) -> Result<String> {
        let name = self.quote_identifier(&table.name)?;
        match &table.schema {
            Some(schema) => Ok(format!("{}.{}", self.quote_identifier(schema)?, name)),
            None => Ok(name),
        }
    }

    /// Quote and join a column list.
    fn column_list(&self, columns: &[String]) -> Result<String> {
        let quoted = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(quoted.join(", "))
    }

    /// Placeholders `start..start + count`, comma separated.
    fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.param_placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Plain insert.
    fn build_insert_sql(&self, table: &TableRef, columns: &[String]) -> Result<String> {
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualify_table(table)?,
            self.column_list(columns)?,
            self.placeholders(1, columns.len())
        ))
    }

    /// `SELECT cols FROM t WHERE pk IN (p1, ..., pn)`.
    fn build_select_by_pk_in_sql(
        &self,
        table: &TableRef,
        select_columns: &[String],
        primary_key_column: &str,
        key_count: usize,
    ) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            self.column_list(select_columns)?,
            self.qualify_table(table)?,
            self.quote_identifier(primary_key_column)?,
            self.placeholders(1, key_count.max(1))
        ))
    }

    /// `DELETE FROM t WHERE pk IN (p1, ..., pn)`.
    fn build_delete_by_pk_in_sql(
        &self,
        table: &TableRef,
        primary_key_column: &str,
        key_count: usize,
    ) -> Result<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.qualify_table(table)?,
            self.quote_identifier(primary_key_column)?,
            self.placeholders(1, key_count.max(1))
        ))
    }

    /// `DELETE FROM t WHERE k1 = p1 AND k2 = p2 ...`, one full key per row.
    fn build_delete_by_key_sql(&self, table: &TableRef, key_columns: &[String]) -> Result<String> {
        let mut terms = Vec::with_capacity(key_columns.len());
        for (i, column) in key_columns.iter().enumerate() {
            terms.push(format!(
                "{} = {}",
                self.quote_identifier(column)?,
                self.param_placeholder(i + 1)
            ));
        }
        Ok(format!(
            "DELETE FROM {} WHERE {}",
            self.qualify_table(table)?,
            terms.join(" AND ")
        ))
    }

    fn build_delete_all_sql(&self, table: &TableRef) -> Result<String> {
        Ok(format!("DELETE FROM {}", self.qualify_table(table)?))
    }

    fn build_truncate_sql(&self, table: &TableRef) -> Result<String> {
        Ok(format!("TRUNCATE TABLE {}", self.qualify_table(table)?))
    }

    /// `ALTER TABLE t ADD col type`. `type_def` comes from inspected metadata.
    fn build_add_column_sql(
        &self,
        table: &TableRef,
        column: &str,
        type_def: &str,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD {} {}",
            self.qualify_table(table)?,
            self.quote_identifier(column)?,
            type_def
        ))
    }

    /// Row count, optionally filtered.
    fn build_count_sql(&self, table: &TableRef, filter: Option<&str>) -> Result<String> {
        Ok(format!(
            "SELECT COUNT(*) FROM {}{}",
            self.qualify_table(table)?,
            where_filter(filter)
        ))
    }

    /// Minimum and maximum of the key column.
    fn build_bounds_sql(
        &self,
        table: &TableRef,
        key_column: &str,
        filter: Option<&str>,
    ) -> Result<String> {
        let key = self.quote_identifier(key_column)?;
        Ok(format!(
            "SELECT MIN({key}), MAX({key}) FROM {}{}",
            self.qualify_table(table)?,
            where_filter(filter)
        ))
    }

    /// `key >= p1`, then `key < p2` when `bounded`, then the filter.
    fn range_predicate(
        &self,
        key_column: &str,
        bounded: bool,
        filter: Option<&str>,
    ) -> Result<String> {
        let key = self.quote_identifier(key_column)?;
        let mut sql = format!("{} >= {}", key, self.param_placeholder(1));
        if bounded {
            sql.push_str(&format!(" AND {} < {}", key, self.param_placeholder(2)));
        }
        if let Some(filter) = filter {
            sql.push_str(&format!(" AND ({})", filter));
        }
        Ok(sql)
    }

    /// Rows with `key >= p1` and, when `bounded`, `key < p2`.
    fn build_select_range_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        bounded: bool,
        filter: Option<&str>,
    ) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM {} WHERE {}",
            self.column_list(columns)?,
            self.qualify_table(table)?,
            self.range_predicate(key_column, bounded, filter)?
        ))
    }

    /// Select list computing `COUNT(*)` and the sum of per-row hashes over
    /// `columns`, reduced modulo `2^61 - 1` and returned as a BIGINT.
    ///
    /// `None` when the engine cannot hash rows in SQL. The hash is only
    /// comparable between two tables of the same engine.
    fn range_digest_select(&self, _columns: &[String]) -> Result<Option<String>> {
        Ok(None)
    }

    /// Server-side count and hash sum of one key range, parameters as for
    /// [`Dialect::build_select_range_sql`].
    fn build_range_digest_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        bounded: bool,
        filter: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(select) = self.range_digest_select(columns)? else {
            return Ok(None);
        };
        Ok(Some(format!(
            "SELECT {} FROM {} WHERE {}",
            select,
            self.qualify_table(table)?,
            self.range_predicate(key_column, bounded, filter)?
        )))
    }

    /// One keyset page ordered by `query.order_by`.
    ///
    /// Parameter order: the watermark (when `query.watermark_column` is set and
    /// `query.has_watermark`), then the cursor expanded by [`keyset_params`].
    fn build_keyset_page_sql(&self, query: &PageQuery<'_>) -> Result<String> {
        let mut predicates = Vec::new();
        let mut next = 1;

        if let Some(column) = query.watermark_column {
            let column = self.quote_identifier(column)?;
            predicates.push(format!("{} IS NOT NULL", column));
            if query.has_watermark {
                predicates.push(format!("{} > {}", column, self.param_placeholder(next)));
                next += 1;
            }
        }

        if query.has_cursor {
            let quoted = query
                .order_by
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Result<Vec<_>>>()?;
            let mut alternatives = Vec::with_capacity(quoted.len());
            for i in 0..quoted.len() {
                let mut terms = Vec::with_capacity(i + 1);
                for column in &quoted[..i] {
                    terms.push(format!("{} = {}", column, self.param_placeholder(next)));
                    next += 1;
                }
                terms.push(format!("{} > {}", quoted[i], self.param_placeholder(next)));
                next += 1;
                alternatives.push(format!("({})", terms.join(" AND ")));
            }
            predicates.push(format!("({})", alternatives.join(" OR ")));
        }

        if let Some(filter) = query.filter {
            predicates.push(format!("({})", filter));
        }

        let mut rest = format!("FROM {}", self.qualify_table(query.table)?);
        if !predicates.is_empty() {
            rest.push_str(" WHERE ");
            rest.push_str(&predicates.join(" AND "));
        }
        rest.push_str(" ORDER BY ");
        rest.push_str(&self.column_list(query.order_by)?);

        Ok(self.apply_limit(&self.column_list(query.columns)?, &rest, query.limit))
    }
}

/// Inputs for [`Dialect::build_keyset_page_sql`].
#[derive(Debug, Clone)]
pub struct PageQuery<'a> {
    pub table: &'a TableRef,
    pub columns: &'a [String],
    pub order_by: &'a [String],
    pub watermark_column: Option<&'a str>,
    pub has_watermark: bool,
    pub has_cursor: bool,
    pub filter: Option<&'a str>,
    pub limit: usize,
}

/// Expand a cursor into the parameter sequence the keyset predicate expects:
/// for each position `i`, the values `cursor[0..=i]`.
pub fn keyset_params(cursor: &[SqlValue]) -> Vec<SqlValue> {
    let mut params = Vec::with_capacity(cursor.len() * (cursor.len() + 1) / 2);
    for i in 0..cursor.len() {
        params.extend(cursor[..=i].iter().cloned());
    }
    params
}

fn where_filter(filter: Option<&str>) -> String {
    match filter {
        Some(filter) => format!(" WHERE ({})", filter),
        None => String::new(),
    }
}

/// One statement of a transactional script and its parameter rows.
#[derive(Debug, Clone, Copy)]
pub struct BatchStatement<'a> {
    pub sql: &'a str,
    pub rows: &'a [Row],
}

/// A live datasource that executes SQL text.
///
/// Implementations own their connection pool. `execute_script` runs each
/// statement once per parameter row inside a single transaction, so a batch
/// is applied entirely or not at all.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Datasource code from configuration.
    fn code(&self) -> &str;

    /// Product information used to resolve the dialect.
    fn info(&self) -> &ConnectionInfo;

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Run a query and decode every row.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run a statement, returning the affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run every statement, in order, once per its parameter rows, all in
    /// one transaction. Returns the total affected row count.
    async fn execute_script(&self, statements: &[BatchStatement<'_>]) -> Result<u64>;

    /// Run a statement once per parameter row in one transaction.
    async fn execute_batch(&self, sql: &str, rows: &[Row]) -> Result<u64> {
        self.execute_script(&[BatchStatement { sql, rows }]).await
    }

    /// Bind this datasource to a dialect for table-level access.
    fn table_access(self: Arc<Self>, dialect: Arc<dyn Dialect>) -> Arc<dyn TableAccess>;
}

/// A page request for keyset-paginated extraction.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Columns to return.
    pub columns: Vec<String>,
    /// Ordering columns; each must also appear in `columns`.
    pub order_by: Vec<String>,
    /// Incremental column and the exclusive lower bound, if any.
    pub incremental: Option<IncrementalBound>,
    /// Values of `order_by` for the last row of the previous page.
    pub cursor: Option<Vec<SqlValue>>,
    /// Trusted SQL predicate ANDed into the query.
    pub filter: Option<String>,
    /// Maximum rows per page.
    pub limit: usize,
}

/// Exclusive lower bound on the incremental column.
#[derive(Debug, Clone)]
pub struct IncrementalBound {
    pub column: String,
    /// `None` on the first run: every non-null value qualifies.
    pub after: Option<SqlValue>,
}

/// Table-level operations used by extraction and bucket validation.
#[async_trait]
pub trait TableAccess: Send + Sync {
    /// Name of the dialect generating this access layer's SQL.
    fn dialect_name(&self) -> &str;

    /// Row count, optionally filtered.
    async fn count_rows(&self, table: &TableRef, filter: Option<&str>) -> Result<i64>;

    /// Minimum and maximum key, `None` for an empty table.
    async fn key_bounds(
        &self,
        table: &TableRef,
        key_column: &str,
        kind: KeyKind,
        filter: Option<&str>,
    ) -> Result<Option<(KeyValue, KeyValue)>>;

    /// One page of rows in `order_by` order.
    async fn read_page(&self, table: &TableRef, page: &PageRequest) -> Result<Vec<Row>>;

    /// All rows whose key falls in `range`, in no particular order.
    async fn read_range(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        range: &KeyRange,
        filter: Option<&str>,
    ) -> Result<Vec<Row>>;

    /// Row count and row hash sum of `range`, computed by the engine.
    ///
    /// `None` when the engine cannot hash rows itself; callers then read the
    /// rows and hash them locally.
    async fn range_digest(
        &self,
        _table: &TableRef,
        _columns: &[String],
        _key_column: &str,
        _range: &KeyRange,
        _filter: Option<&str>,
    ) -> Result<Option<(i64, u64)>> {
        Ok(None)
    }

    /// Rows whose key is one of `keys`.
    async fn read_by_keys(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        keys: &[KeyValue],
    ) -> Result<Vec<Row>>;

    /// Insert-or-update `rows` atomically. Returns rows applied.
    async fn upsert_rows(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
        rows: &[Row],
    ) -> Result<u64>;

    /// Delete rows whose key is one of `keys`.
    async fn delete_by_keys(
        &self,
        table: &TableRef,
        key_column: &str,
        keys: &[KeyValue],
    ) -> Result<u64>;

    /// Remove every row (TRUNCATE, falling back to DELETE).
    async fn clear_table(&self, table: &TableRef) -> Result<()>;

    /// Add a column.
    async fn add_column(&self, table: &TableRef, column: &str, type_def: &str) -> Result<()>;
}
