//! Dialect-driven table access over a live [`Datasource`].
//!
//! [`SqlTableAccess`] turns each [`TableAccess`] operation into SQL text from
//! the resolved [`Dialect`] and runs it on the datasource. Drivers hand one
//! out from [`Datasource::table_access`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::schema::{KeyKind, KeyRange, KeyValue, TableRef};
use crate::core::traits::{
    keyset_params, BatchStatement, Datasource, Dialect, PageQuery, PageRequest, TableAccess,
};
use crate::core::value::{Row, SqlValue};
use crate::dialect::DialectKind;
use crate::error::{Result, SyncError};
use crate::verify::MODULUS;

/// A datasource bound to the dialect that generates its SQL.
pub struct SqlTableAccess {
    datasource: Arc<dyn Datasource>,
    dialect: Arc<dyn Dialect>,
}

impl SqlTableAccess {
    pub fn new(datasource: Arc<dyn Datasource>, dialect: Arc<dyn Dialect>) -> Self {
        Self {
            datasource,
            dialect,
        }
    }
}

fn key_params(keys: &[KeyValue]) -> Vec<SqlValue> {
    keys.iter().map(KeyValue::to_sql_value).collect()
}

fn range_params(range: &KeyRange) -> Vec<SqlValue> {
    let mut params = vec![range.start.to_sql_value()];
    if let Some(end) = &range.end {
        params.push(end.to_sql_value());
    }
    params
}

/// The primary key values of each row, in `primary_key` order.
fn key_rows(columns: &[String], primary_key: &[String], rows: &[Row]) -> Result<Vec<Row>> {
    let positions = primary_key
        .iter()
        .map(|key| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(key))
                .ok_or_else(|| SyncError::Query(format!("key column {} is not written", key)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(rows
        .iter()
        .map(|row| positions.iter().map(|p| row[*p].clone()).collect())
        .collect())
}

#[async_trait]
impl TableAccess for SqlTableAccess {
    fn dialect_name(&self) -> &str {
        self.dialect.name()
    }

    async fn count_rows(&self, table: &TableRef, filter: Option<&str>) -> Result<i64> {
        let sql = self.dialect.build_count_sql(table, filter)?;
        let rows = self.datasource.query(&sql, &[]).await?;
        rows.first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| SyncError::Query(format!("COUNT(*) on {} returned no value", table)))
    }

    async fn key_bounds(
        &self,
        table: &TableRef,
        key_column: &str,
        kind: KeyKind,
        filter: Option<&str>,
    ) -> Result<Option<(KeyValue, KeyValue)>> {
        let sql = self.dialect.build_bounds_sql(table, key_column, filter)?;
        let rows = self.datasource.query(&sql, &[]).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let (Some(min), Some(max)) = (row.first(), row.get(1)) else {
            return Err(SyncError::Query(format!(
                "key bounds query on {} returned {} column(s)",
                table,
                row.len()
            )));
        };
        if min.is_null() || max.is_null() {
            return Ok(None);
        }
        match (KeyValue::from_sql(min, kind), KeyValue::from_sql(max, kind)) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Err(SyncError::unsupported_key(
                table.to_string(),
                format!("cannot use {} / {} as {:?} bucket keys", min, max, kind),
            )),
        }
    }

    async fn read_page(&self, table: &TableRef, page: &PageRequest) -> Result<Vec<Row>> {
        let sql = self.dialect.build_keyset_page_sql(&PageQuery {
            table,
            columns: &page.columns,
            order_by: &page.order_by,
            watermark_column: page.incremental.as_ref().map(|i| i.column.as_str()),
            has_watermark: page
                .incremental
                .as_ref()
                .map_or(false, |i| i.after.is_some()),
            has_cursor: page.cursor.is_some(),
            filter: page.filter.as_deref(),
            limit: page.limit,
        })?;

        let mut params = Vec::new();
        if let Some(after) = page.incremental.as_ref().and_then(|i| i.after.clone()) {
            params.push(after);
        }
        if let Some(cursor) = &page.cursor {
            params.extend(keyset_params(cursor));
        }
        self.datasource.query(&sql, &params).await
    }

    async fn read_range(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        range: &KeyRange,
        filter: Option<&str>,
    ) -> Result<Vec<Row>> {
        let sql = self.dialect.build_select_range_sql(
            table,
            columns,
            key_column,
            range.end.is_some(),
            filter,
        )?;
        self.datasource.query(&sql, &range_params(range)).await
    }

    async fn range_digest(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        range: &KeyRange,
        filter: Option<&str>,
    ) -> Result<Option<(i64, u64)>> {
        let Some(sql) = self.dialect.build_range_digest_sql(
            table,
            columns,
            key_column,
            range.end.is_some(),
            filter,
        )?
        else {
            return Ok(None);
        };
        let rows = self.datasource.query(&sql, &range_params(range)).await?;
        let values = rows.first().map(|row| {
            (
                row.first().and_then(SqlValue::as_i64),
                row.get(1).and_then(SqlValue::as_i64),
            )
        });
        match values {
            Some((Some(count), Some(sum))) if sum >= 0 && (sum as u64) < MODULUS => {
                Ok(Some((count, sum as u64)))
            }
            _ => Err(SyncError::Query(format!(
                "range digest on {} returned {:?}",
                table,
                rows.first()
            ))),
        }
    }

    async fn read_by_keys(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        keys: &[KeyValue],
    ) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = self
            .dialect
            .build_select_by_pk_in_sql(table, columns, key_column, keys.len())?;
        self.datasource.query(&sql, &key_params(keys)).await
    }

    async fn upsert_rows(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = self.dialect.build_upsert_sql(table, columns, primary_key)?;
        if self.dialect.kind() != DialectKind::Generic {
            self.datasource.execute_batch(&sql, rows).await?;
            return Ok(rows.len() as u64);
        }

        // Plain INSERT: remove conflicting rows in the same transaction.
        let delete = self.dialect.build_delete_by_key_sql(table, primary_key)?;
        let keys = key_rows(columns, primary_key, rows)?;
        self.datasource
            .execute_script(&[
                BatchStatement {
                    sql: &delete,
                    rows: &keys,
                },
                BatchStatement { sql: &sql, rows },
            ])
            .await?;
        Ok(rows.len() as u64)
    }

    async fn delete_by_keys(
        &self,
        table: &TableRef,
        key_column: &str,
        keys: &[KeyValue],
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = self
            .dialect
            .build_delete_by_pk_in_sql(table, key_column, keys.len())?;
        self.datasource.execute(&sql, &key_params(keys)).await
    }

    async fn clear_table(&self, table: &TableRef) -> Result<()> {
        let truncate = self.dialect.build_truncate_sql(table)?;
        match self.datasource.execute(&truncate, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_connectivity() => Err(e),
            Err(e) => {
                warn!("TRUNCATE {} failed ({}), falling back to DELETE", table, e);
                let delete = self.dialect.build_delete_all_sql(table)?;
                let removed = self.datasource.execute(&delete, &[]).await?;
                debug!("Deleted {} row(s) from {}", removed, table);
                Ok(())
            }
        }
    }

    async fn add_column(&self, table: &TableRef, column: &str, type_def: &str) -> Result<()> {
        let sql = self.dialect.build_add_column_sql(table, column, type_def)?;
        self.datasource.execute(&sql, &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::{ConnectionInfo, IncrementalBound};
    use crate::core::value::SqlNullType;
    use crate::dialect::{DialectImpl, DialectKind};
    use std::sync::Mutex;

    /// Records every statement and answers queries with canned rows.
    struct Recorder {
        info: ConnectionInfo,
        reply: Vec<Row>,
        fail_truncate: bool,
        log: Mutex<Vec<(String, Vec<SqlValue>)>>,
    }

    impl Recorder {
        fn new(reply: Vec<Row>) -> Arc<Self> {
            Self::build(reply, false)
        }

        fn build(reply: Vec<Row>, fail_truncate: bool) -> Arc<Self> {
            Arc::new(Self {
                info: ConnectionInfo {
                    product_name: "PostgreSQL".into(),
                    url: String::new(),
                },
                reply,
                fail_truncate,
                log: Mutex::new(Vec::new()),
            })
        }

        fn statements(&self) -> Vec<(String, Vec<SqlValue>)> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Datasource for Recorder {
        fn code(&self) -> &str {
            "rec"
        }
        fn info(&self) -> &ConnectionInfo {
            &self.info
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
            self.log.lock().unwrap().push((sql.to_string(), params.to_vec()));
            Ok(self.reply.clone())
        }
        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
            self.log.lock().unwrap().push((sql.to_string(), params.to_vec()));
            if self.fail_truncate && sql.starts_with("TRUNCATE") {
                return Err(SyncError::Query("permission denied".into()));
            }
            Ok(1)
        }
        async fn execute_script(&self, statements: &[BatchStatement<'_>]) -> Result<u64> {
            let mut affected = 0;
            for statement in statements {
                for row in statement.rows {
                    self.log
                        .lock()
                        .unwrap()
                        .push((statement.sql.to_string(), row.clone()));
                    affected += 1;
                }
            }
            Ok(affected)
        }
        fn table_access(self: Arc<Self>, dialect: Arc<dyn Dialect>) -> Arc<dyn TableAccess> {
            Arc::new(SqlTableAccess::new(self, dialect))
        }
    }

    fn pg() -> Arc<dyn Dialect> {
        Arc::new(DialectImpl::from_kind(DialectKind::Postgres))
    }

    fn table() -> TableRef {
        TableRef::new(Some("app"), "orders")
    }

    #[tokio::test]
    async fn test_count_rows() {
        let rec = Recorder::new(vec![vec![SqlValue::I64(42)]]);
        let access = rec.clone().table_access(pg());
        assert_eq!(access.count_rows(&table(), None).await.unwrap(), 42);
        assert_eq!(rec.statements()[0].0, "SELECT COUNT(*) FROM \"app\".\"orders\"");
    }

    #[tokio::test]
    async fn test_key_bounds_empty_table() {
        let rec = Recorder::new(vec![vec![
            SqlValue::Null(SqlNullType::I64),
            SqlValue::Null(SqlNullType::I64),
        ]]);
        let access = rec.table_access(pg());
        let bounds = access.key_bounds(&table(), "id", KeyKind::Int, None).await.unwrap();
        assert!(bounds.is_none());
    }

    #[tokio::test]
    async fn test_key_bounds_text_key() {
        let rec = Recorder::new(vec![vec![
            SqlValue::Text("a".into()),
            SqlValue::Text("m".into()),
        ]]);
        let access = rec.table_access(pg());
        let bounds = access.key_bounds(&table(), "code", KeyKind::Text, None).await.unwrap();
        assert_eq!(
            bounds,
            Some((KeyValue::Text("a".into()), KeyValue::Text("m".into())))
        );
    }

    #[tokio::test]
    async fn test_read_page_binds_watermark_then_cursor() {
        let rec = Recorder::new(vec![]);
        let access = rec.clone().table_access(pg());
        let page = PageRequest {
            columns: vec!["id".into(), "ts".into()],
            order_by: vec!["ts".into(), "id".into()],
            incremental: Some(IncrementalBound {
                column: "ts".into(),
                after: Some(SqlValue::I64(100)),
            }),
            cursor: Some(vec![SqlValue::I64(150), SqlValue::I64(7)]),
            filter: None,
            limit: 10,
        };
        access.read_page(&table(), &page).await.unwrap();
        let (sql, params) = &rec.statements()[0];
        assert!(sql.contains("\"ts\" > $1"));
        assert!(sql.ends_with("LIMIT 10"));
        assert_eq!(
            params,
            &vec![
                SqlValue::I64(100),
                SqlValue::I64(150),
                SqlValue::I64(150),
                SqlValue::I64(7)
            ]
        );
    }

    #[tokio::test]
    async fn test_read_range_unbounded_end() {
        let rec = Recorder::new(vec![]);
        let access = rec.clone().table_access(pg());
        let range = KeyRange {
            start: KeyValue::Text("k".into()),
            end: None,
        };
        access
            .read_range(&table(), &["code".to_string()], "code", &range, None)
            .await
            .unwrap();
        let (sql, params) = &rec.statements()[0];
        assert!(!sql.contains("<"));
        assert_eq!(params, &vec![SqlValue::Text("k".into())]);
    }

    #[tokio::test]
    async fn test_read_by_keys_skips_empty() {
        let rec = Recorder::new(vec![]);
        let access = rec.clone().table_access(pg());
        let rows = access
            .read_by_keys(&table(), &["id".to_string()], "id", &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(rec.statements().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_rows_batches_through_dialect() {
        let rec = Recorder::new(vec![]);
        let access = rec.clone().table_access(pg());
        let columns = vec!["id".to_string(), "v".to_string()];
        let rows = vec![
            vec![SqlValue::I64(1), SqlValue::Text("a".into())],
            vec![SqlValue::I64(2), SqlValue::Text("b".into())],
        ];
        let applied = access
            .upsert_rows(&table(), &columns, &columns[..1], &rows)
            .await
            .unwrap();
        assert_eq!(applied, 2);
        let log = rec.statements();
        assert_eq!(log.len(), 2);
        assert!(log[0].0.contains("ON CONFLICT (\"id\")"));
    }

    #[tokio::test]
    async fn test_generic_upsert_deletes_conflicting_keys_first() {
        let rec = Recorder::new(vec![]);
        let generic: Arc<dyn Dialect> = Arc::new(DialectImpl::from_kind(DialectKind::Generic));
        let access = rec.clone().table_access(generic);
        let columns = vec!["a".to_string(), "b".to_string(), "v".to_string()];
        let rows = vec![
            vec![SqlValue::I64(1), SqlValue::I64(1), SqlValue::Text("x".into())],
            vec![SqlValue::I64(1), SqlValue::I64(2), SqlValue::Text("y".into())],
        ];
        let applied = access
            .upsert_rows(&table(), &columns, &columns[..2], &rows)
            .await
            .unwrap();
        assert_eq!(applied, 2);

        let log = rec.statements();
        assert_eq!(log.len(), 4);
        let delete = "DELETE FROM \"app\".\"orders\" WHERE \"a\" = ? AND \"b\" = ?";
        assert_eq!(log[0], (delete.to_string(), vec![SqlValue::I64(1), SqlValue::I64(1)]));
        assert_eq!(log[1], (delete.to_string(), vec![SqlValue::I64(1), SqlValue::I64(2)]));
        assert!(log[2].0.starts_with("INSERT INTO"));
        assert_eq!(log[3].1, rows[1]);
    }

    #[tokio::test]
    async fn test_repeated_batch_issues_identical_statements() {
        for kind in [DialectKind::Generic, DialectKind::Postgres, DialectKind::Mysql] {
            let rec = Recorder::new(vec![]);
            let access = rec
                .clone()
                .table_access(Arc::new(DialectImpl::from_kind(kind)));
            let columns = vec!["id".to_string(), "v".to_string()];
            let rows = vec![vec![SqlValue::I64(7), SqlValue::Text("a".into())]];
            access.upsert_rows(&table(), &columns, &columns[..1], &rows).await.unwrap();
            let once = rec.statements();
            access.upsert_rows(&table(), &columns, &columns[..1], &rows).await.unwrap();
            let twice = rec.statements();
            assert_eq!(twice[..once.len()], twice[once.len()..], "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_upsert_rejects_unwritten_key_column() {
        let rec = Recorder::new(vec![]);
        let access = rec
            .clone()
            .table_access(Arc::new(DialectImpl::from_kind(DialectKind::Generic)));
        let columns = vec!["v".to_string()];
        let rows = vec![vec![SqlValue::Text("a".into())]];
        let key = vec!["id".to_string()];
        assert!(access.upsert_rows(&table(), &columns, &key, &rows).await.is_err());
        assert!(rec.statements().is_empty());
    }

    #[tokio::test]
    async fn test_range_digest_binds_bounds() {
        let rec = Recorder::new(vec![vec![SqlValue::I64(3), SqlValue::I64(12345)]]);
        let access = rec.clone().table_access(pg());
        let range = KeyRange {
            start: KeyValue::Int(10),
            end: Some(KeyValue::Int(20)),
        };
        let digest = access
            .range_digest(&table(), &["id".to_string()], "id", &range, None)
            .await
            .unwrap();
        assert_eq!(digest, Some((3, 12345)));
        let (sql, params) = &rec.statements()[0];
        assert!(sql.starts_with("SELECT COUNT(*)"));
        assert_eq!(params, &vec![SqlValue::I64(10), SqlValue::I64(20)]);
    }

    #[tokio::test]
    async fn test_range_digest_unsupported_dialect() {
        let rec = Recorder::new(vec![]);
        let access = rec
            .clone()
            .table_access(Arc::new(DialectImpl::from_kind(DialectKind::Oracle)));
        let range = KeyRange {
            start: KeyValue::Int(0),
            end: None,
        };
        let digest = access
            .range_digest(&table(), &["id".to_string()], "id", &range, None)
            .await
            .unwrap();
        assert!(digest.is_none());
        assert!(rec.statements().is_empty());
    }

    #[tokio::test]
    async fn test_clear_table_falls_back_to_delete() {
        let rec = Recorder::build(vec![], true);
        let access = rec.clone().table_access(pg());
        access.clear_table(&table()).await.unwrap();
        let log = rec.statements();
        assert_eq!(log[0].0, "TRUNCATE TABLE \"app\".\"orders\"");
        assert_eq!(log[1].0, "DELETE FROM \"app\".\"orders\"");
    }
}
