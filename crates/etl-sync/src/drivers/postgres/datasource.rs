//! PostgreSQL datasource.
//!
//! Uses deadpool-postgres for connection pooling and rustls for TLS. Values
//! are bound through a [`ToSql`] implementation on [`SqlValue`] that coerces
//! to the parameter type the server inferred, so keys and watermarks parsed
//! from text bind against integer, uuid or timestamp columns alike.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info};

use crate::access::SqlTableAccess;
use crate::config::DatasourceConfig;
use crate::core::traits::{BatchStatement, ConnectionInfo, Datasource, Dialect, TableAccess};
use crate::core::value::{Row, SqlNullType, SqlValue, TypeFamily};
use crate::drivers::common::TlsBuilder;
use crate::error::{Result, SyncError};

type BoxError = Box<dyn StdError + Sync + Send>;

/// Pooled PostgreSQL connection.
pub struct PostgresDatasource {
    code: String,
    info: ConnectionInfo,
    pool: Pool,
}

impl PostgresDatasource {
    /// Build the pool and check connectivity.
    pub async fn connect(config: &DatasourceConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port());
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("etl-sync");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let max_size = config.get_max_connections();
        let pool = match TlsBuilder::parse(config.ssl_mode())?.build(&config.code)? {
            None => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr).max_size(max_size).build()
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr).max_size(max_size).build()
            }
        }
        .map_err(|e| SyncError::pool(e, format!("creating PostgreSQL pool for {}", config.code)))?;

        let client = pool
            .get()
            .await
            .map_err(|e| SyncError::connectivity(&config.code, e))?;
        let row = client
            .query_one("SELECT version()", &[])
            .await
            .map_err(|e| SyncError::connectivity(&config.code, e))?;
        let version: String = row.get(0);

        info!(
            "Connected to PostgreSQL datasource {}: {}:{}/{} (pool_size={})",
            config.code,
            config.host,
            config.port(),
            config.database,
            max_size
        );

        Ok(Self {
            code: config.code.clone(),
            info: ConnectionInfo {
                product_name: config.product.clone().unwrap_or(version),
                url: config.url(),
            },
            pool,
        })
    }

    /// Underlying pool, shared with the PostgreSQL state backend.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::connectivity(&self.code, e))
    }
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Datasource for PostgresDatasource {
    fn code(&self) -> &str {
        &self.code
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| SyncError::connectivity(&self.code, e))?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        debug!("{}: {}", self.code, sql);
        let client = self.client().await?;
        let stmt = client.prepare_cached(sql).await?;
        let rows = client.query(&stmt, &bind(params)).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!("{}: {}", self.code, sql);
        let client = self.client().await?;
        let stmt = client.prepare_cached(sql).await?;
        Ok(client.execute(&stmt, &bind(params)).await?)
    }

    async fn execute_script(&self, statements: &[BatchStatement<'_>]) -> Result<u64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let mut affected = 0;
        for statement in statements {
            debug!("{}: {} x{}", self.code, statement.sql, statement.rows.len());
            let stmt = tx.prepare_cached(statement.sql).await?;
            for row in statement.rows {
                affected += tx.execute(&stmt, &bind(row)).await?;
            }
        }
        tx.commit().await?;
        Ok(affected)
    }

    fn table_access(self: Arc<Self>, dialect: Arc<dyn Dialect>) -> Arc<dyn TableAccess> {
        Arc::new(SqlTableAccess::new(self, dialect))
    }
}

/// Decode a row by the server-reported column types.
fn decode_row(row: &tokio_postgres::Row) -> Result<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        values.push(decode_value(row, idx, column.type_())?);
    }
    Ok(values)
}

fn get<'a, T: FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
    null: SqlNullType,
    wrap: impl FnOnce(T) -> SqlValue,
) -> Result<SqlValue> {
    let value = row
        .try_get::<_, Option<T>>(idx)
        .map_err(|e| SyncError::Query(format!("decoding column {}: {}", idx, e)))?;
    Ok(value.map(wrap).unwrap_or(SqlValue::Null(null)))
}

fn decode_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<SqlValue> {
    match ty.name() {
        "bool" => get(row, idx, SqlNullType::Bool, SqlValue::Bool),
        "int2" => get(row, idx, SqlNullType::I64, |v: i16| SqlValue::I64(v.into())),
        "int4" => get(row, idx, SqlNullType::I64, |v: i32| SqlValue::I64(v.into())),
        "int8" => get(row, idx, SqlNullType::I64, SqlValue::I64),
        "oid" => get(row, idx, SqlNullType::I64, |v: u32| SqlValue::I64(v.into())),
        "float4" => get(row, idx, SqlNullType::F64, |v: f32| SqlValue::F64(v.into())),
        "float8" => get(row, idx, SqlNullType::F64, SqlValue::F64),
        "numeric" => get(row, idx, SqlNullType::Decimal, SqlValue::Decimal),
        "uuid" => get(row, idx, SqlNullType::Uuid, SqlValue::Uuid),
        "date" => get(row, idx, SqlNullType::Date, SqlValue::Date),
        "time" => get(row, idx, SqlNullType::Time, SqlValue::Time),
        "timestamp" => get(row, idx, SqlNullType::DateTime, SqlValue::DateTime),
        "timestamptz" => get(row, idx, SqlNullType::DateTimeUtc, SqlValue::DateTimeUtc),
        "bytea" => get(row, idx, SqlNullType::Bytes, SqlValue::Bytes),
        "json" | "jsonb" => get(row, idx, SqlNullType::String, |v: serde_json::Value| {
            SqlValue::Text(v.to_string())
        }),
        _ => get(row, idx, SqlNullType::String, SqlValue::Text),
    }
}

fn is_text_type(ty: &Type) -> bool {
    matches!(
        ty.name(),
        "text" | "varchar" | "bpchar" | "name" | "citext" | "unknown"
    )
}

fn int_to_sql(v: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match ty.name() {
        "int2" => i16::try_from(v)?.to_sql(ty, out),
        "int4" => i32::try_from(v)?.to_sql(ty, out),
        "numeric" => Decimal::from(v).to_sql(ty, out),
        "float4" => (v as f32).to_sql(ty, out),
        "float8" => (v as f64).to_sql(ty, out),
        "bool" => (v != 0).to_sql(ty, out),
        _ => v.to_sql(ty, out),
    }
}

fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    if is_text_type(ty) {
        return s.to_sql(ty, out);
    }
    match ty.name() {
        "json" | "jsonb" => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        name => match SqlValue::parse_as(s, TypeFamily::from_type_name(name))? {
            SqlValue::Text(_) => s.to_sql(ty, out),
            parsed => parsed.to_sql(ty, out),
        },
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            SqlValue::Null(_) => Ok(IsNull::Yes),
            SqlValue::Text(s) => text_to_sql(s, ty, out),
            other if is_text_type(ty) => match other.canonical_text() {
                Some(text) => text.to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            SqlValue::Bool(v) => match ty.name() {
                "bool" => v.to_sql(ty, out),
                _ => int_to_sql(i64::from(*v), ty, out),
            },
            SqlValue::I64(v) => int_to_sql(*v, ty, out),
            SqlValue::F64(v) => match ty.name() {
                "float4" => (*v as f32).to_sql(ty, out),
                "numeric" => Decimal::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Decimal(d) => match ty.name() {
                "int2" | "int4" | "int8" => {
                    let v = d
                        .to_i64()
                        .ok_or_else(|| format!("decimal {} does not fit {}", d, ty.name()))?;
                    int_to_sql(v, ty, out)
                }
                "float4" | "float8" => {
                    let v = d
                        .to_f64()
                        .ok_or_else(|| format!("decimal {} does not fit {}", d, ty.name()))?;
                    SqlValue::F64(v).to_sql(ty, out)
                }
                _ => d.to_sql(ty, out),
            },
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::Time(v) => v.to_sql(ty, out),
            SqlValue::DateTime(v) => match ty.name() {
                "timestamptz" => v.and_utc().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::DateTimeUtc(v) => match ty.name() {
                "timestamp" => v.naive_utc().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &SqlValue, ty: &Type) -> Option<Vec<u8>> {
        let mut out = BytesMut::new();
        match value.to_sql(ty, &mut out).unwrap() {
            IsNull::Yes => None,
            IsNull::No => Some(out.to_vec()),
        }
    }

    #[test]
    fn test_null_binds_as_null() {
        assert_eq!(encode(&SqlValue::Null(SqlNullType::I64), &Type::INT4), None);
    }

    #[test]
    fn test_i64_narrows_to_column_width() {
        assert_eq!(encode(&SqlValue::I64(7), &Type::INT4), Some(7i32.to_be_bytes().to_vec()));
        assert_eq!(encode(&SqlValue::I64(7), &Type::INT2), Some(7i16.to_be_bytes().to_vec()));
        let mut out = BytesMut::new();
        assert!(SqlValue::I64(i64::MAX).to_sql(&Type::INT4, &mut out).is_err());
    }

    #[test]
    fn test_text_key_parses_into_typed_column() {
        assert_eq!(
            encode(&SqlValue::Text("42".into()), &Type::INT8),
            Some(42i64.to_be_bytes().to_vec())
        );
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            encode(&SqlValue::Text(id.to_string()), &Type::UUID),
            Some(id.as_bytes().to_vec())
        );
    }

    #[test]
    fn test_typed_value_into_text_column_uses_canonical_form() {
        assert_eq!(encode(&SqlValue::Bool(true), &Type::TEXT), Some(b"1".to_vec()));
        assert_eq!(
            encode(&SqlValue::Decimal(Decimal::new(1500, 2)), &Type::VARCHAR),
            Some(b"15".to_vec())
        );
    }

    #[test]
    fn test_decimal_into_integer_column() {
        assert_eq!(
            encode(&SqlValue::Decimal(Decimal::from(9)), &Type::INT4),
            Some(9i32.to_be_bytes().to_vec())
        );
    }
}
