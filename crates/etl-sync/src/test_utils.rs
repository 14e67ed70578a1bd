//! In-memory datasource and metadata service for tests.
//!
//! [`MemoryDatasource`] keeps tables as plain row vectors and implements both
//! [`Datasource`] and [`TableAccess`] directly, so engine and orchestrator
//! tests run without a database. Filters support a single
//! `column <op> literal` comparison.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::schema::{ColumnMetadata, KeyKind, KeyRange, KeyValue, TableMetadata, TableRef};
use crate::core::traits::{
    BatchStatement, ConnectionInfo, Datasource, Dialect, PageRequest, TableAccess,
};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::error::{Result, SyncError};
use crate::metadata::DatabaseMetadataService;
use crate::verify::BucketDigest;

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ColumnMetadata>,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| SyncError::Query(format!("unknown column {}", column)))
    }

    fn indexes(&self, columns: &[String]) -> Result<Vec<usize>> {
        columns.iter().map(|c| self.index(c)).collect()
    }
}

fn select(row: &Row, indexes: &[usize]) -> Row {
    indexes.iter().map(|i| row[*i].clone()).collect()
}

fn same_value(a: &SqlValue, b: &SqlValue) -> bool {
    a.canonical_text() == b.canonical_text()
}

/// A table store standing in for one database.
pub struct MemoryDatasource {
    code: String,
    info: ConnectionInfo,
    tables: Mutex<HashMap<String, MemoryTable>>,
    unreachable: AtomicBool,
    fold_text_keys: AtomicBool,
    failing_bounds: AtomicBool,
    failing_upserts: AtomicUsize,
    drop_on_upsert: AtomicBool,
    server_digest: AtomicBool,
    range_reads: AtomicUsize,
    read_delay: Mutex<Option<Duration>>,
    forced_on_upsert: Mutex<Option<ForcedValue>>,
    operations: Mutex<Vec<String>>,
}

/// A value an upsert overwrites, on every row or only the row keyed `key`.
#[derive(Debug, Clone)]
struct ForcedValue {
    key: Option<SqlValue>,
    column: String,
    value: SqlValue,
}

impl MemoryDatasource {
    pub fn new(code: &str, product_name: &str) -> Self {
        Self {
            code: code.to_string(),
            info: ConnectionInfo {
                product_name: product_name.to_string(),
                url: format!("memory://{}", code),
            },
            tables: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            fold_text_keys: AtomicBool::new(false),
            failing_bounds: AtomicBool::new(false),
            failing_upserts: AtomicUsize::new(0),
            drop_on_upsert: AtomicBool::new(false),
            server_digest: AtomicBool::new(false),
            range_reads: AtomicUsize::new(0),
            read_delay: Mutex::new(None),
            forced_on_upsert: Mutex::new(None),
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn create_table(&self, name: &str, columns: Vec<ColumnMetadata>) {
        self.tables.lock().unwrap().insert(
            name.to_lowercase(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, name: &str, rows: Vec<Row>) {
        let mut tables = self.tables.lock().unwrap();
        tables.get_mut(&name.to_lowercase()).unwrap().rows.extend(rows);
    }

    pub fn rows(&self, name: &str) -> Vec<Row> {
        self.tables.lock().unwrap()[&name.to_lowercase()].rows.clone()
    }

    /// Column metadata, empty when the table does not exist.
    pub fn columns(&self, name: &str) -> Vec<ColumnMetadata> {
        self.tables
            .lock()
            .unwrap()
            .get(&name.to_lowercase())
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.lock().unwrap().keys().cloned().collect()
    }

    /// Set `column` of the row whose first column equals `key`.
    pub fn update_value(&self, name: &str, key: &SqlValue, column: &str, value: SqlValue) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(&name.to_lowercase()).unwrap();
        let idx = table.index(column).unwrap();
        for row in table.rows.iter_mut().filter(|r| same_value(&r[0], key)) {
            row[idx] = value.clone();
        }
    }

    /// Overwrite `column` with `value` on every upserted row, like a trigger.
    pub fn force_on_upsert(&self, column: &str, value: SqlValue) {
        *self.forced_on_upsert.lock().unwrap() = Some(ForcedValue {
            key: None,
            column: column.to_string(),
            value,
        });
    }

    /// Like [`Self::force_on_upsert`], only for the row whose first column is `key`.
    pub fn force_on_upsert_of(&self, key: SqlValue, column: &str, value: SqlValue) {
        *self.forced_on_upsert.lock().unwrap() = Some(ForcedValue {
            key: Some(key),
            column: column.to_string(),
            value,
        });
    }

    /// Become unreachable for good on the first upsert.
    pub fn drop_connection_on_upsert(&self) {
        self.drop_on_upsert.store(true, AtomicOrdering::SeqCst);
    }

    /// Answer range digests, as an engine hashing rows in SQL would.
    pub fn enable_server_digest(&self) {
        self.server_digest.store(true, AtomicOrdering::SeqCst);
    }

    /// Number of range reads served so far.
    pub fn range_reads(&self) -> usize {
        self.range_reads.load(AtomicOrdering::SeqCst)
    }

    /// Compare text keys case-insensitively in ranges, bounds and lookups.
    pub fn fold_text_keys(&self, on: bool) {
        self.fold_text_keys.store(on, AtomicOrdering::SeqCst);
    }

    /// Fail every call with a connectivity error.
    pub fn set_unreachable(&self, on: bool) {
        self.unreachable.store(on, AtomicOrdering::SeqCst);
    }

    /// Fail every key bounds query.
    pub fn fail_key_bounds(&self, on: bool) {
        self.failing_bounds.store(on, AtomicOrdering::SeqCst);
    }

    /// Fail the next `n` upsert calls.
    pub fn fail_next_upserts(&self, n: usize) {
        self.failing_upserts.store(n, AtomicOrdering::SeqCst);
    }

    /// Sleep before every page and range read.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Mutating operations seen so far, e.g. `clear items`.
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(SyncError::connectivity(&self.code, "connection refused"));
        }
        Ok(())
    }

    async fn delay(&self) {
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn with_table<T>(&self, table: &TableRef, f: impl FnOnce(&mut MemoryTable) -> Result<T>) -> Result<T> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&table.name.to_lowercase())
            .ok_or_else(|| SyncError::Query(format!("table {} does not exist", table)))?;
        f(table)
    }

    fn key_of(&self, value: &SqlValue, kind: KeyKind) -> Option<KeyValue> {
        KeyValue::from_sql(value, kind).map(|k| self.fold(k))
    }

    fn fold(&self, key: KeyValue) -> KeyValue {
        match key {
            KeyValue::Text(s) if self.fold_text_keys.load(AtomicOrdering::SeqCst) => {
                KeyValue::Text(s.to_lowercase())
            }
            other => other,
        }
    }

    fn rows_in_range(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        range: &KeyRange,
        filter: Option<&str>,
    ) -> Result<Vec<Row>> {
        let kind = kind_of(&range.start);
        let range = KeyRange {
            start: self.fold(range.start.clone()),
            end: range.end.clone().map(|e| self.fold(e)),
        };
        self.with_table(table, |t| {
            let idx = t.index(key_column)?;
            let columns = t.indexes(columns)?;
            let mut rows = Vec::new();
            for row in &t.rows {
                let in_range = self
                    .key_of(&row[idx], kind)
                    .map_or(false, |k| range.contains(&k));
                if in_range && matches_filter(t, row, filter)? {
                    rows.push(select(row, &columns));
                }
            }
            Ok(rows)
        })
    }
}

fn kind_of(key: &KeyValue) -> KeyKind {
    match key {
        KeyValue::Int(_) => KeyKind::Int,
        KeyValue::Text(_) => KeyKind::Text,
    }
}

/// Evaluate `column <op> literal`.
fn matches_filter(table: &MemoryTable, row: &Row, filter: Option<&str>) -> Result<bool> {
    let Some(filter) = filter else {
        return Ok(true);
    };
    let parts: Vec<&str> = filter.split_whitespace().collect();
    let [column, op, literal] = parts.as_slice() else {
        return Err(SyncError::Query(format!("unsupported filter: {}", filter)));
    };
    let value = &row[table.index(column)?];
    let literal = if literal.starts_with('\'') {
        SqlValue::Text(literal.trim_matches('\'').to_string())
    } else {
        literal
            .parse::<i64>()
            .map(SqlValue::I64)
            .unwrap_or_else(|_| SqlValue::Text(literal.to_string()))
    };
    let Some(ord) = value.compare(&literal) else {
        return Ok(false);
    };
    Ok(match *op {
        "=" => ord == Ordering::Equal,
        "<>" | "!=" => ord != Ordering::Equal,
        "<" => ord == Ordering::Less,
        "<=" => ord != Ordering::Greater,
        ">" => ord == Ordering::Greater,
        ">=" => ord != Ordering::Less,
        _ => return Err(SyncError::Query(format!("unsupported operator {}", op))),
    })
}

fn compare_tuples(a: &[SqlValue], b: &[SqlValue]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.compare(y).unwrap_or(Ordering::Equal) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[async_trait]
impl Datasource for MemoryDatasource {
    fn code(&self) -> &str {
        &self.code
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn query(&self, _sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>> {
        self.check()?;
        Err(SyncError::Query("memory datasource does not run SQL".into()))
    }

    async fn execute(&self, _sql: &str, _params: &[SqlValue]) -> Result<u64> {
        self.check()?;
        Err(SyncError::Query("memory datasource does not run SQL".into()))
    }

    async fn execute_script(&self, _statements: &[BatchStatement<'_>]) -> Result<u64> {
        self.check()?;
        Err(SyncError::Query("memory datasource does not run SQL".into()))
    }

    fn table_access(self: Arc<Self>, _dialect: Arc<dyn Dialect>) -> Arc<dyn TableAccess> {
        self
    }
}

#[async_trait]
impl TableAccess for MemoryDatasource {
    fn dialect_name(&self) -> &str {
        "memory"
    }

    async fn count_rows(&self, table: &TableRef, filter: Option<&str>) -> Result<i64> {
        self.with_table(table, |t| {
            let mut count = 0;
            for row in &t.rows {
                if matches_filter(t, row, filter)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    async fn key_bounds(
        &self,
        table: &TableRef,
        key_column: &str,
        kind: KeyKind,
        filter: Option<&str>,
    ) -> Result<Option<(KeyValue, KeyValue)>> {
        if self.failing_bounds.load(AtomicOrdering::SeqCst) {
            return Err(SyncError::Query("injected bounds failure".into()));
        }
        self.with_table(table, |t| {
            let idx = t.index(key_column)?;
            let mut bounds: Option<((KeyValue, KeyValue), (KeyValue, KeyValue))> = None;
            for row in &t.rows {
                if !matches_filter(t, row, filter)? {
                    continue;
                }
                let (Some(raw), Some(folded)) =
                    (KeyValue::from_sql(&row[idx], kind), self.key_of(&row[idx], kind))
                else {
                    continue;
                };
                bounds = Some(match bounds {
                    None => ((folded.clone(), raw.clone()), (folded, raw)),
                    Some((min, max)) => {
                        let min = if folded < min.0 { (folded.clone(), raw.clone()) } else { min };
                        let max = if folded > max.0 { (folded, raw) } else { max };
                        (min, max)
                    }
                });
            }
            Ok(bounds.map(|(min, max)| (min.1, max.1)))
        })
    }

    async fn read_page(&self, table: &TableRef, page: &PageRequest) -> Result<Vec<Row>> {
        self.delay().await;
        self.with_table(table, |t| {
            let order = t.indexes(&page.order_by)?;
            let columns = t.indexes(&page.columns)?;
            let incremental = match &page.incremental {
                Some(bound) => Some((t.index(&bound.column)?, bound.after.clone())),
                None => None,
            };

            let mut rows: Vec<&Row> = Vec::new();
            for row in &t.rows {
                if !matches_filter(t, row, page.filter.as_deref())? {
                    continue;
                }
                if let Some((idx, after)) = &incremental {
                    if row[*idx].is_null() {
                        continue;
                    }
                    if let Some(after) = after {
                        if row[*idx].compare(after) != Some(Ordering::Greater) {
                            continue;
                        }
                    }
                }
                if let Some(cursor) = &page.cursor {
                    if compare_tuples(&select(row, &order), cursor) != Ordering::Greater {
                        continue;
                    }
                }
                rows.push(row);
            }
            rows.sort_by(|a, b| compare_tuples(&select(a, &order), &select(b, &order)));
            Ok(rows
                .into_iter()
                .take(page.limit)
                .map(|r| select(r, &columns))
                .collect())
        })
    }

    async fn range_digest(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        range: &KeyRange,
        filter: Option<&str>,
    ) -> Result<Option<(i64, u64)>> {
        if !self.server_digest.load(AtomicOrdering::SeqCst) {
            return Ok(None);
        }
        let rows = self.rows_in_range(table, columns, key_column, range, filter)?;
        let digest = BucketDigest::of_rows(&rows);
        Ok(Some((digest.count, digest.sum)))
    }

    async fn read_range(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        range: &KeyRange,
        filter: Option<&str>,
    ) -> Result<Vec<Row>> {
        self.delay().await;
        self.range_reads.fetch_add(1, AtomicOrdering::SeqCst);
        self.rows_in_range(table, columns, key_column, range, filter)
    }

    async fn read_by_keys(
        &self,
        table: &TableRef,
        columns: &[String],
        key_column: &str,
        keys: &[KeyValue],
    ) -> Result<Vec<Row>> {
        let Some(first) = keys.first() else {
            return Ok(Vec::new());
        };
        let kind = kind_of(first);
        let wanted: Vec<KeyValue> = keys.iter().cloned().map(|k| self.fold(k)).collect();
        self.with_table(table, |t| {
            let idx = t.index(key_column)?;
            let columns = t.indexes(columns)?;
            Ok(t.rows
                .iter()
                .filter(|row| {
                    self.key_of(&row[idx], kind)
                        .map_or(false, |k| wanted.contains(&k))
                })
                .map(|row| select(row, &columns))
                .collect())
        })
    }

    async fn upsert_rows(
        &self,
        table: &TableRef,
        columns: &[String],
        primary_key: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        self.check()?;
        if self.drop_on_upsert.load(AtomicOrdering::SeqCst) {
            self.set_unreachable(true);
            return Err(SyncError::connectivity(&self.code, "connection reset by peer"));
        }
        let remaining = self.failing_upserts.load(AtomicOrdering::SeqCst);
        if remaining > 0 {
            self.failing_upserts.store(remaining - 1, AtomicOrdering::SeqCst);
            return Err(SyncError::Query("injected upsert failure".into()));
        }
        let forced = self.forced_on_upsert.lock().unwrap().clone();
        self.with_table(table, |t| {
            let targets = t.indexes(columns)?;
            let key_positions: Vec<usize> = primary_key
                .iter()
                .map(|k| {
                    columns
                        .iter()
                        .position(|c| c.eq_ignore_ascii_case(k))
                        .ok_or_else(|| SyncError::Query(format!("key {} not in upsert columns", k)))
                })
                .collect::<Result<_>>()?;
            let forced = match forced {
                Some(f) => Some((f.key, t.index(&f.column)?, f.value)),
                None => None,
            };
            let width = t.columns.len();

            let mut slots: HashMap<Vec<Option<String>>, usize> = HashMap::new();
            for (i, stored) in t.rows.iter().enumerate() {
                let key = key_positions
                    .iter()
                    .map(|p| stored[targets[*p]].canonical_text())
                    .collect();
                slots.insert(key, i);
            }

            for row in rows {
                let key: Vec<Option<String>> =
                    key_positions.iter().map(|p| row[*p].canonical_text()).collect();
                let slot = match slots.get(&key) {
                    Some(i) => *i,
                    None => {
                        t.rows.push(vec![SqlValue::Null(SqlNullType::String); width]);
                        slots.insert(key, t.rows.len() - 1);
                        t.rows.len() - 1
                    }
                };
                for (value, idx) in row.iter().zip(&targets) {
                    t.rows[slot][*idx] = value.clone();
                }
                if let Some((key, idx, value)) = &forced {
                    if key.as_ref().map_or(true, |k| same_value(&t.rows[slot][0], k)) {
                        t.rows[slot][*idx] = value.clone();
                    }
                }
            }
            Ok(rows.len() as u64)
        })
    }

    async fn delete_by_keys(
        &self,
        table: &TableRef,
        key_column: &str,
        keys: &[KeyValue],
    ) -> Result<u64> {
        let Some(first) = keys.first() else {
            return Ok(0);
        };
        let kind = kind_of(first);
        self.with_table(table, |t| {
            let idx = t.index(key_column)?;
            let before = t.rows.len();
            t.rows.retain(|row| {
                KeyValue::from_sql(&row[idx], kind).map_or(true, |k| !keys.contains(&k))
            });
            Ok((before - t.rows.len()) as u64)
        })
    }

    async fn clear_table(&self, table: &TableRef) -> Result<()> {
        self.with_table(table, |t| {
            t.rows.clear();
            Ok(())
        })?;
        self.operations
            .lock()
            .unwrap()
            .push(format!("clear {}", table.name));
        Ok(())
    }

    async fn add_column(&self, table: &TableRef, column: &str, type_def: &str) -> Result<()> {
        self.with_table(table, |t| {
            let ordinal = t.columns.len() as i32 + 1;
            t.columns.push(ColumnMetadata::new(column, type_def, ordinal));
            for row in &mut t.rows {
                row.push(SqlValue::Null(SqlNullType::String));
            }
            Ok(())
        })?;
        self.operations
            .lock()
            .unwrap()
            .push(format!("add {}.{} {}", table.name, column, type_def));
        Ok(())
    }
}

/// Metadata service answering from fixed tables and attached memory datasources.
#[derive(Default)]
pub struct MemoryMetadataService {
    tables: Mutex<HashMap<(String, String), (Vec<ColumnMetadata>, Option<String>)>>,
    datasources: Mutex<Vec<Arc<MemoryDatasource>>>,
}

impl MemoryMetadataService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixed table. `primary_key` is the table-level key list.
    pub fn add_table(
        &self,
        datasource: &str,
        _schema: Option<&str>,
        table: &str,
        columns: Vec<ColumnMetadata>,
        primary_key: Option<&str>,
    ) {
        self.tables.lock().unwrap().insert(
            (datasource.to_string(), table.to_lowercase()),
            (columns, primary_key.map(String::from)),
        );
    }

    /// Answer for every table of `datasource`, reflecting later changes.
    pub fn attach(&self, datasource: Arc<MemoryDatasource>) {
        self.datasources.lock().unwrap().push(datasource);
    }

    fn attached(&self, code: &str) -> Option<Arc<MemoryDatasource>> {
        self.datasources
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.code == code)
            .cloned()
    }
}

#[async_trait]
impl DatabaseMetadataService for MemoryMetadataService {
    async fn get_columns(
        &self,
        datasource: &str,
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>> {
        let fixed = self
            .tables
            .lock()
            .unwrap()
            .get(&(datasource.to_string(), table.to_lowercase()))
            .map(|(columns, _)| columns.clone());
        if let Some(columns) = fixed {
            return Ok(columns);
        }
        match self.attached(datasource) {
            Some(ds) => {
                ds.check()?;
                Ok(ds.columns(table))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn get_tables(
        &self,
        datasource: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableMetadata>> {
        let mut tables: Vec<TableMetadata> = self
            .tables
            .lock()
            .unwrap()
            .iter()
            .filter(|((ds, _), _)| ds == datasource)
            .map(|((_, name), (_, pk))| TableMetadata {
                schema: schema.map(String::from),
                name: name.clone(),
                primary_key: pk.clone(),
            })
            .collect();
        if let Some(ds) = self.attached(datasource) {
            tables.extend(ds.table_names().into_iter().map(|name| TableMetadata {
                schema: schema.map(String::from),
                name,
                primary_key: None,
            }));
        }
        Ok(tables)
    }
}
