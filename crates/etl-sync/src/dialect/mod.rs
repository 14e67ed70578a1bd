//! Dialect selection: the engine-family tag, the enum-dispatched dialect and
//! the resolver that maps a live connection to one of them.
//!
//! The concrete SQL generators live next to their drivers
//! (`drivers/<engine>/dialect.rs`); this module only ties them together.
//!
//! ```rust,ignore
//! let resolver = DialectResolver::new(Arc::new(DialectRegistry::with_builtins()));
//! let dialect = resolver.resolve(datasource.info())?;
//! let sql = dialect.build_upsert_sql(&table, &columns, &pk)?;
//! ```

mod resolver;

pub use resolver::DialectResolver;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::schema::TableRef;
use crate::core::traits::Dialect;
use crate::drivers::{GenericDialect, MssqlDialect, MysqlDialect, OracleDialect, PostgresDialect};
use crate::error::Result;

/// Engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    Generic,
    Mysql,
    Postgres,
    Oracle,
    SqlServer,
}

impl DialectKind {
    /// Every kind, in declaration order.
    pub const ALL: [DialectKind; 5] = [
        DialectKind::Generic,
        DialectKind::Mysql,
        DialectKind::Postgres,
        DialectKind::Oracle,
        DialectKind::SqlServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DialectKind::Generic => "generic",
            DialectKind::Mysql => "mysql",
            DialectKind::Postgres => "postgres",
            DialectKind::Oracle => "oracle",
            DialectKind::SqlServer => "sqlserver",
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enum-based static dispatch over the built-in dialects.
///
/// Only the primitives each engine overrides are dispatched; the template
/// methods of [`Dialect`] are inherited and call back into them.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Generic(GenericDialect),
    Mysql(MysqlDialect),
    Postgres(PostgresDialect),
    Oracle(OracleDialect),
    SqlServer(MssqlDialect),
}

impl DialectImpl {
    /// Construct the built-in dialect for `kind`.
    pub fn from_kind(kind: DialectKind) -> Self {
        match kind {
            DialectKind::Generic => DialectImpl::Generic(GenericDialect::new()),
            DialectKind::Mysql => DialectImpl::Mysql(MysqlDialect::new()),
            DialectKind::Postgres => DialectImpl::Postgres(PostgresDialect::new()),
            DialectKind::Oracle => DialectImpl::Oracle(OracleDialect::new()),
            DialectKind::SqlServer => DialectImpl::SqlServer(MssqlDialect::new()),
        }
    }

    fn inner(&self) -> &dyn Dialect {
        match self {
            DialectImpl::Generic(d) => d,
            DialectImpl::Mysql(d) => d,
            DialectImpl::Postgres(d) => d,
            DialectImpl::Oracle(d) => d,
            DialectImpl::SqlServer(d) => d,
        }
    }
}

impl Dialect for DialectImpl {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn kind(&self) -> DialectKind {
        self.inner().kind()
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        self.inner().quote_identifier(name)
    }

    fn param_placeholder(&self, index: usize) -> String {
        self.inner().param_placeholder(index)
    }

    fn build_upsert_sql(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
    ) -> Result<String> {
        self.inner().build_upsert_sql(table, columns, primary_key)
    }

    fn default_schema_expr(&self) -> &'static str {
        self.inner().default_schema_expr()
    }

    fn apply_limit(&self, columns_sql: &str, rest_sql: &str, limit: usize) -> String {
        self.inner().apply_limit(columns_sql, rest_sql, limit)
    }

    fn range_digest_select(&self, columns: &[String]) -> Result<Option<String>> {
        self.inner().range_digest_select(columns)
    }
}

/// Case-insensitive membership test for primary key columns.
pub(crate) fn is_key_column(column: &str, primary_key: &[String]) -> bool {
    primary_key.iter().any(|pk| pk.eq_ignore_ascii_case(column))
}

/// ON condition, UPDATE SET list, INSERT column list and INSERT value list of
/// a `target`/`source` MERGE. The UPDATE list is empty when every column is a
/// key column.
pub(crate) fn merge_clauses(
    dialect: &dyn Dialect,
    columns: &[String],
    primary_key: &[String],
) -> Result<(String, String, String, String)> {
    let mut on = Vec::with_capacity(primary_key.len());
    for pk in primary_key {
        let q = dialect.quote_identifier(pk)?;
        on.push(format!("target.{q} = source.{q}"));
    }

    let mut update = Vec::new();
    let mut insert_cols = Vec::with_capacity(columns.len());
    let mut insert_vals = Vec::with_capacity(columns.len());
    for column in columns {
        let q = dialect.quote_identifier(column)?;
        if !is_key_column(column, primary_key) {
            update.push(format!("target.{q} = source.{q}"));
        }
        insert_vals.push(format!("source.{q}"));
        insert_cols.push(q);
    }

    Ok((
        on.join(" AND "),
        update.join(", "),
        insert_cols.join(", "),
        insert_vals.join(", "),
    ))
}
