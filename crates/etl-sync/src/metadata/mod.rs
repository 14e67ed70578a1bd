//! Table structure inspection.
//!
//! [`DatabaseMetadataService`] is the narrow introspection interface the
//! engine consumes. [`InformationSchemaMetadataService`] implements it for any
//! registered SQL datasource; [`TableMetadataInspector`] turns its raw answer
//! into ordered columns, primary key and a structure digest used for drift
//! detection.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::identifier::normalize_schema;
use crate::core::schema::{ColumnMetadata, TableMetadata, TableRef, TableSchemaMetadata};
use crate::core::traits::Dialect;
use crate::core::value::SqlValue;
use crate::dialect::{DialectKind, DialectResolver};
use crate::drivers::DatasourceRegistry;
use crate::error::{Result, SyncError};

/// Schema introspection for configured datasources.
#[async_trait]
pub trait DatabaseMetadataService: Send + Sync {
    /// Columns of one table. An empty result means the table is not visible.
    async fn get_columns(
        &self,
        datasource: &str,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>>;

    /// Tables in a schema (the connection's current schema when `None`).
    async fn get_tables(&self, datasource: &str, schema: Option<&str>)
        -> Result<Vec<TableMetadata>>;
}

/// `information_schema` based metadata for every registered datasource.
pub struct InformationSchemaMetadataService {
    registry: DatasourceRegistry,
    resolver: DialectResolver,
}

impl InformationSchemaMetadataService {
    pub fn new(registry: DatasourceRegistry, resolver: DialectResolver) -> Self {
        Self { registry, resolver }
    }
}

fn text_cast(dialect: &dyn Dialect, expr: &str) -> String {
    match dialect.kind() {
        DialectKind::Mysql => format!("CAST({} AS CHAR)", expr),
        _ => format!("CAST({} AS VARCHAR(256))", expr),
    }
}

fn int_cast(dialect: &dyn Dialect, expr: &str) -> String {
    match dialect.kind() {
        DialectKind::Mysql => format!("CAST({} AS SIGNED)", expr),
        _ => format!("CAST({} AS BIGINT)", expr),
    }
}

/// Schema predicate for `column`, binding the schema as parameter 1 when given.
fn schema_predicate(dialect: &dyn Dialect, column: &str, schema: Option<&str>) -> String {
    match schema {
        Some(_) => format!("{} = {}", column, dialect.param_placeholder(1)),
        None => format!("{} = {}", column, dialect.default_schema_expr()),
    }
}

fn schema_params(schema: Option<&str>, table: Option<&str>) -> Vec<SqlValue> {
    schema
        .into_iter()
        .chain(table)
        .map(|s| SqlValue::Text(s.to_string()))
        .collect()
}

fn columns_sql(dialect: &dyn Dialect, schema: Option<&str>) -> String {
    let table_param = dialect.param_placeholder(if schema.is_some() { 2 } else { 1 });
    format!(
        "SELECT {}, {}, {}, {}, {}, {}, {} \
         FROM information_schema.columns c \
         WHERE {} AND c.table_name = {} \
         ORDER BY c.ordinal_position",
        text_cast(dialect, "c.column_name"),
        text_cast(dialect, "c.data_type"),
        int_cast(dialect, "c.character_maximum_length"),
        int_cast(dialect, "c.numeric_precision"),
        int_cast(dialect, "c.numeric_scale"),
        text_cast(dialect, "c.is_nullable"),
        int_cast(dialect, "c.ordinal_position"),
        schema_predicate(dialect, "c.table_schema", schema),
        table_param,
    )
}

fn primary_key_sql(dialect: &dyn Dialect, schema: Option<&str>) -> String {
    let table_param = dialect.param_placeholder(if schema.is_some() { 2 } else { 1 });
    format!(
        "SELECT {}, {} \
         FROM information_schema.table_constraints t \
         JOIN information_schema.key_column_usage k \
           ON k.constraint_name = t.constraint_name \
          AND k.table_schema = t.table_schema \
          AND k.table_name = t.table_name \
         WHERE t.constraint_type = 'PRIMARY KEY' AND {} AND t.table_name = {} \
         ORDER BY k.ordinal_position",
        text_cast(dialect, "k.column_name"),
        int_cast(dialect, "k.ordinal_position"),
        schema_predicate(dialect, "t.table_schema", schema),
        table_param,
    )
}

fn tables_sql(dialect: &dyn Dialect, schema: Option<&str>) -> String {
    format!(
        "SELECT {}, {} FROM information_schema.tables t \
         WHERE t.table_type = 'BASE TABLE' AND {} \
         ORDER BY t.table_name",
        text_cast(dialect, "t.table_schema"),
        text_cast(dialect, "t.table_name"),
        schema_predicate(dialect, "t.table_schema", schema),
    )
}

fn text_at(row: &[SqlValue], idx: usize) -> Option<String> {
    row.get(idx).and_then(SqlValue::canonical_text)
}

fn int_at(row: &[SqlValue], idx: usize) -> Option<i64> {
    row.get(idx).and_then(SqlValue::as_i64)
}

#[async_trait]
impl DatabaseMetadataService for InformationSchemaMetadataService {
    async fn get_columns(
        &self,
        datasource: &str,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>> {
        let ds = self.registry.get(datasource)?;
        let dialect = self.resolver.resolve(ds.info())?;
        let params = schema_params(schema, Some(table));

        let rows = ds.query(&columns_sql(dialect.as_ref(), schema), &params).await?;
        let keys = ds
            .query(&primary_key_sql(dialect.as_ref(), schema), &params)
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(name) = text_at(row, 0) else {
                continue;
            };
            let type_name = text_at(row, 1).unwrap_or_default();
            let size = int_at(row, 2).or_else(|| int_at(row, 3));
            let scale = int_at(row, 4);
            let nullable = text_at(row, 5).map(|v| v.eq_ignore_ascii_case("YES"));
            let ordinal = int_at(row, 6).and_then(|v| i32::try_from(v).ok());

            let mut column = ColumnMetadata::new(name, type_name, 0).with_size(size, scale);
            column.ordinal = ordinal;
            column.nullable = nullable;
            if let Some(position) = keys.iter().position(|k| {
                text_at(k, 0).map_or(false, |k| k.eq_ignore_ascii_case(&column.name))
            }) {
                let seq = keys
                    .get(position)
                    .and_then(|k| int_at(k, 1))
                    .and_then(|v| i32::try_from(v).ok())
                    .unwrap_or(position as i32 + 1);
                column = column.with_primary_key(seq);
                column.nullable = nullable;
            }
            columns.push(column);
        }

        debug!(
            "{}: loaded {} column(s) for {}",
            datasource,
            columns.len(),
            TableRef::new(schema, table)
        );
        Ok(columns)
    }

    async fn get_tables(
        &self,
        datasource: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableMetadata>> {
        let ds = self.registry.get(datasource)?;
        let dialect = self.resolver.resolve(ds.info())?;
        let rows = ds
            .query(&tables_sql(dialect.as_ref(), schema), &schema_params(schema, None))
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(TableMetadata {
                    schema: text_at(row, 0),
                    name: text_at(row, 1)?,
                    primary_key: None,
                })
            })
            .collect())
    }
}

/// Builds [`TableSchemaMetadata`] from a metadata service.
#[derive(Clone)]
pub struct TableMetadataInspector {
    service: Arc<dyn DatabaseMetadataService>,
}

impl TableMetadataInspector {
    pub fn new(service: Arc<dyn DatabaseMetadataService>) -> Self {
        Self { service }
    }

    /// Inspect one table: ordered columns, primary key and structure digest.
    pub async fn inspect(
        &self,
        datasource: &str,
        schema: Option<&str>,
        table: &str,
    ) -> Result<TableSchemaMetadata> {
        let schema = normalize_schema(schema);
        let table_ref = TableRef::new(schema.as_deref(), table);

        let mut columns = self
            .service
            .get_columns(datasource, schema.as_deref(), table)
            .await?;
        if columns.is_empty() {
            return Err(SyncError::SchemaNotFound(format!(
                "{} on datasource {}",
                table_ref, datasource
            )));
        }
        sort_columns(&mut columns);

        let mut primary_key_columns = flagged_primary_key(&columns);
        if primary_key_columns.is_empty() {
            let tables = self.service.get_tables(datasource, schema.as_deref()).await?;
            primary_key_columns = tables
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(table))
                .and_then(|t| t.primary_key.as_deref())
                .map(parse_primary_key_list)
                .unwrap_or_default();
        }

        let structure_digest = structure_digest(&columns, &primary_key_columns);
        debug!(
            "Inspected {} on {}: {} column(s), pk {:?}, digest {}",
            table_ref,
            datasource,
            columns.len(),
            primary_key_columns,
            structure_digest
        );

        Ok(TableSchemaMetadata {
            table: table_ref,
            columns,
            primary_key_columns,
            structure_digest,
        })
    }
}

/// Ordinal order, missing ordinals last, name as tie breaker.
fn sort_columns(columns: &mut [ColumnMetadata]) {
    columns.sort_by(|a, b| {
        (a.ordinal.is_none(), a.ordinal, &a.name).cmp(&(b.ordinal.is_none(), b.ordinal, &b.name))
    });
}

/// Columns flagged as primary key, in key order.
fn flagged_primary_key(columns: &[ColumnMetadata]) -> Vec<String> {
    let mut keys: Vec<&ColumnMetadata> = columns.iter().filter(|c| c.primary_key).collect();
    keys.sort_by_key(|c| (c.key_sequence.is_none(), c.key_sequence));
    keys.into_iter().map(|c| c.name.clone()).collect()
}

/// Split a comma-separated key list, trimming and dropping blanks and repeats.
fn parse_primary_key_list(list: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// Lowercase hex SHA-256 of `name|type|size|scale|nullable` entries joined by
/// `||`, then `##` and the key columns joined by `,`.
pub fn structure_digest(columns: &[ColumnMetadata], primary_key: &[String]) -> String {
    let column_part = columns
        .iter()
        .map(|c| {
            format!(
                "{}|{}|{}|{}|{}",
                c.name,
                c.type_name,
                c.size.map(|v| v.to_string()).unwrap_or_default(),
                c.scale.map(|v| v.to_string()).unwrap_or_default(),
                c.is_nullable()
            )
        })
        .collect::<Vec<_>>()
        .join("||");
    let payload = format!("{}##{}", column_part, primary_key.join(","));
    hex::encode(Sha256::digest(payload.as_bytes()))
}
