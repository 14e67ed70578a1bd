//! MySQL/MariaDB datasource.
//!
//! Uses SQLx for connection pooling and async query execution. Rows are
//! decoded by the type name SQLx reports for each result column.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode,
};
use sqlx::query::Query;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use crate::access::SqlTableAccess;
use crate::config::DatasourceConfig;
use crate::core::traits::{BatchStatement, ConnectionInfo, Datasource, Dialect, TableAccess};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::drivers::common::SslMode;
use crate::error::{Result, SyncError};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLx TLS mode for a datasource `ssl_mode`.
fn mysql_ssl_mode(datasource: &str, mode: SslMode) -> MySqlSslMode {
    match mode {
        SslMode::Disable => {
            warn!(
                "Datasource {}: MySQL TLS is disabled. Credentials will be transmitted in plaintext.",
                datasource
            );
            MySqlSslMode::Disabled
        }
        SslMode::Require => MySqlSslMode::Required,
        SslMode::VerifyCa => MySqlSslMode::VerifyCa,
        SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
    }
}

/// Pooled MySQL/MariaDB connection.
pub struct MysqlDatasource {
    code: String,
    info: ConnectionInfo,
    pool: MySqlPool,
}

impl MysqlDatasource {
    /// Build the pool and check connectivity.
    pub async fn connect(config: &DatasourceConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port())
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(mysql_ssl_mode(&config.code, SslMode::parse(config.ssl_mode())?));

        let max_conns = config.get_max_connections();
        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| SyncError::connectivity(&config.code, e))?;

        let version: String = sqlx::query_scalar("SELECT VERSION()")
            .fetch_one(&pool)
            .await
            .map_err(|e| SyncError::connectivity(&config.code, e))?;

        info!(
            "Connected to MySQL datasource {}: {}:{}/{} (version {}, pool_size={})",
            config.code,
            config.host,
            config.port(),
            config.database,
            version,
            max_conns
        );

        Ok(Self {
            code: config.code.clone(),
            info: ConnectionInfo {
                product_name: config
                    .product
                    .clone()
                    .unwrap_or_else(|| format!("MySQL {}", version)),
                url: config.url(),
            },
            pool,
        })
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null(t) => match t {
            SqlNullType::Bool => query.bind(None::<bool>),
            SqlNullType::I64 => query.bind(None::<i64>),
            SqlNullType::F64 => query.bind(None::<f64>),
            SqlNullType::Decimal => query.bind(None::<Decimal>),
            SqlNullType::Bytes => query.bind(None::<Vec<u8>>),
            SqlNullType::Date => query.bind(None::<chrono::NaiveDate>),
            SqlNullType::Time => query.bind(None::<chrono::NaiveTime>),
            SqlNullType::DateTime | SqlNullType::DateTimeUtc => {
                query.bind(None::<chrono::NaiveDateTime>)
            }
            SqlNullType::String | SqlNullType::Uuid => query.bind(None::<String>),
        },
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Decimal(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::Uuid(v) => query.bind(v.hyphenated().to_string()),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::DateTimeUtc(v) => query.bind(v.naive_utc()),
    }
}

fn build_query<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

#[async_trait]
impl Datasource for MysqlDatasource {
    fn code(&self) -> &str {
        &self.code
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::connectivity(&self.code, e))?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        debug!("{}: {}", self.code, sql);
        let rows = build_query(sql, params).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!("{}: {}", self.code, sql);
        let result = build_query(sql, params).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute_script(&self, statements: &[BatchStatement<'_>]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for statement in statements {
            debug!("{}: {} x{}", self.code, statement.sql, statement.rows.len());
            for row in statement.rows {
                affected += build_query(statement.sql, row)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }
        tx.commit().await?;
        Ok(affected)
    }

    fn table_access(self: Arc<Self>, dialect: Arc<dyn Dialect>) -> Arc<dyn TableAccess> {
        Arc::new(SqlTableAccess::new(self, dialect))
    }
}

fn decode_row(row: &MySqlRow) -> Result<Row> {
    (0..row.columns().len())
        .map(|i| decode_value(row, i))
        .collect()
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<SqlValue> {
    let type_name = row.columns()[idx].type_info().name().to_uppercase();
    let null_type = null_type_for(&type_name);

    let is_null = row.try_get_raw(idx).map(|r| r.is_null()).unwrap_or(true);
    if is_null {
        return Ok(SqlValue::Null(null_type));
    }

    let value = match type_name.as_str() {
        "BOOLEAN" => SqlValue::Bool(row.try_get::<bool, _>(idx)?),
        "TINYINT" => SqlValue::I64(row.try_get::<i8, _>(idx)?.into()),
        "SMALLINT" => SqlValue::I64(row.try_get::<i16, _>(idx)?.into()),
        "MEDIUMINT" | "INT" => SqlValue::I64(row.try_get::<i32, _>(idx)?.into()),
        "BIGINT" => SqlValue::I64(row.try_get::<i64, _>(idx)?),
        "YEAR" => SqlValue::I64(row.try_get::<u16, _>(idx)?.into()),
        "TINYINT UNSIGNED" => SqlValue::I64(row.try_get::<u8, _>(idx)?.into()),
        "SMALLINT UNSIGNED" => SqlValue::I64(row.try_get::<u16, _>(idx)?.into()),
        "MEDIUMINT UNSIGNED" | "INT UNSIGNED" => {
            SqlValue::I64(row.try_get::<u32, _>(idx)?.into())
        }
        "BIGINT UNSIGNED" => {
            let v = row.try_get::<u64, _>(idx)?;
            match i64::try_from(v) {
                Ok(v) => SqlValue::I64(v),
                Err(_) => SqlValue::Decimal(Decimal::from(v)),
            }
        }
        "FLOAT" => SqlValue::F64(row.try_get::<f32, _>(idx)?.into()),
        "DOUBLE" => SqlValue::F64(row.try_get::<f64, _>(idx)?),
        "DECIMAL" => SqlValue::Decimal(row.try_get::<Decimal, _>(idx)?),
        "DATE" => SqlValue::Date(row.try_get::<chrono::NaiveDate, _>(idx)?),
        "TIME" => SqlValue::Time(row.try_get::<chrono::NaiveTime, _>(idx)?),
        "DATETIME" => SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(idx)?),
        "TIMESTAMP" => SqlValue::DateTimeUtc(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)?,
        ),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            SqlValue::Bytes(row.try_get::<Vec<u8>, _>(idx)?)
        }
        _ => SqlValue::Text(row.try_get::<String, _>(idx)?),
    };
    Ok(value)
}

/// Null type for a SQLx MySQL type name.
fn null_type_for(type_name: &str) -> SqlNullType {
    match type_name {
        "BOOLEAN" => SqlNullType::Bool,
        "FLOAT" | "DOUBLE" => SqlNullType::F64,
        "DECIMAL" => SqlNullType::Decimal,
        "DATE" => SqlNullType::Date,
        "TIME" => SqlNullType::Time,
        "DATETIME" => SqlNullType::DateTime,
        "TIMESTAMP" => SqlNullType::DateTimeUtc,
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            SqlNullType::Bytes
        }
        t if t.contains("INT") || t == "YEAR" => SqlNullType::I64,
        _ => SqlNullType::String,
    }
}
