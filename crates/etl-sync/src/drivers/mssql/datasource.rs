//! SQL Server datasource.
//!
//! Uses Tiberius with bb8 connection pooling. Batches run inside an explicit
//! `BEGIN TRAN` / `COMMIT TRAN` on one pooled connection.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::access::SqlTableAccess;
use crate::config::DatasourceConfig;
use crate::core::traits::{BatchStatement, ConnectionInfo, Datasource, Dialect, TableAccess};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::drivers::common::SslMode;
use crate::error::{Result, SyncError};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection pool timeouts.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: DatasourceConfig,
    ssl_mode: SslMode,
}

impl TiberiusConnectionManager {
    pub fn new(config: DatasourceConfig) -> Result<Self> {
        let ssl_mode = SslMode::parse(config.ssl_mode())?;
        Ok(Self { config, ssl_mode })
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.application_name("etl-sync");
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.ssl_mode.requires_tls() {
            if !self.ssl_mode.verifies_certificate() {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on SQL Server connection: {}", e);
        }
        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pooled SQL Server connection.
pub struct MssqlDatasource {
    code: String,
    info: ConnectionInfo,
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlDatasource {
    /// Build the pool and check connectivity.
    pub async fn connect(config: &DatasourceConfig) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone())?;
        let max_size = config.get_max_connections() as u32;
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| SyncError::connectivity(&config.code, e))?;

        let version = {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| SyncError::connectivity(&config.code, e))?;
            let row = conn
                .simple_query("SELECT @@VERSION")
                .await?
                .into_row()
                .await?;
            row.and_then(|r| r.get::<&str, _>(0).map(str::to_string))
                .unwrap_or_else(|| "Microsoft SQL Server".to_string())
        };

        info!(
            "Connected to SQL Server datasource {}: {}:{}/{} (pool_size={})",
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

    async fn client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::connectivity(&self.code, e))
    }
}

fn bind(params: &[SqlValue]) -> Vec<&dyn ToSql> {
    params.iter().map(|v| v as &dyn ToSql).collect()
}

#[async_trait]
impl Datasource for MssqlDatasource {
    fn code(&self) -> &str {
        &self.code
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.client().await?;
        conn.simple_query("SELECT 1")
            .await
            .map_err(|e| SyncError::connectivity(&self.code, e))?
            .into_row()
            .await?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        debug!("{}: {}", self.code, sql);
        let mut conn = self.client().await?;
        let stream = conn.query(sql, &bind(params)).await?;
        let rows = stream.into_first_result().await?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!("{}: {}", self.code, sql);
        let mut conn = self.client().await?;
        let result = conn.execute(sql, &bind(params)).await?;
        Ok(result.total())
    }

    async fn execute_script(&self, statements: &[BatchStatement<'_>]) -> Result<u64> {
        let mut conn = self.client().await?;
        conn.simple_query("BEGIN TRAN").await?.into_results().await?;

        let mut affected = 0;
        for statement in statements {
            debug!("{}: {} x{}", self.code, statement.sql, statement.rows.len());
            for row in statement.rows {
                match conn.execute(statement.sql, &bind(row)).await {
                    Ok(result) => affected += result.total(),
                    Err(e) => {
                        if let Ok(stream) = conn.simple_query("ROLLBACK TRAN").await {
                            let _ = stream.into_results().await;
                        }
                        return Err(e.into());
                    }
                }
            }
        }

        conn.simple_query("COMMIT TRAN").await?.into_results().await?;
        Ok(affected)
    }

    fn table_access(self: Arc<Self>, dialect: Arc<dyn Dialect>) -> Arc<dyn TableAccess> {
        Arc::new(SqlTableAccess::new(self, dialect))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlValue::Null(null_type) => match null_type {
                SqlNullType::Bool => ColumnData::Bit(None),
                SqlNullType::I64 => ColumnData::I64(None),
                SqlNullType::F64 => ColumnData::F64(None),
                SqlNullType::Decimal => ColumnData::Numeric(None),
                SqlNullType::String => ColumnData::String(None),
                SqlNullType::Bytes => ColumnData::Binary(None),
                SqlNullType::Uuid => ColumnData::Guid(None),
                SqlNullType::Date => ColumnData::Date(None),
                SqlNullType::Time => ColumnData::Time(None),
                SqlNullType::DateTime => ColumnData::DateTime2(None),
                SqlNullType::DateTimeUtc => ColumnData::DateTimeOffset(None),
            },
            SqlValue::Bool(v) => ColumnData::Bit(Some(*v)),
            SqlValue::I64(v) => ColumnData::I64(Some(*v)),
            SqlValue::F64(v) => ColumnData::F64(Some(*v)),
            SqlValue::Decimal(v) => v.to_sql(),
            SqlValue::Text(v) => ColumnData::String(Some(Cow::Borrowed(v.as_str()))),
            SqlValue::Bytes(v) => ColumnData::Binary(Some(Cow::Borrowed(v.as_slice()))),
            SqlValue::Uuid(v) => ColumnData::Guid(Some(*v)),
            SqlValue::Date(v) => v.to_sql(),
            SqlValue::Time(v) => v.to_sql(),
            SqlValue::DateTime(v) => v.to_sql(),
            SqlValue::DateTimeUtc(v) => v.to_sql(),
        }
    }
}

fn decode_row(row: tiberius::Row) -> Result<Row> {
    row.into_iter().map(|data| decode_value(&data)).collect()
}

fn decode_value(data: &ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnData::U8(v) => v
            .map(|v| SqlValue::I64(v.into()))
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::I16(v) => v
            .map(|v| SqlValue::I64(v.into()))
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::I32(v) => v
            .map(|v| SqlValue::I64(v.into()))
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::F32(v) => v
            .map(|v| SqlValue::F64(v.into()))
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| {
                SqlValue::Decimal(Decimal::from_i128_with_scale(n.value(), n.scale() as u32))
            })
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| SqlValue::Text(s.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| SqlValue::Bytes(b.to_vec()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        ColumnData::Date(_) => chrono::NaiveDate::from_sql(data)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(data)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(data)?
                .map(SqlValue::DateTime)
                .unwrap_or(SqlValue::Null(SqlNullType::DateTime))
        }
        ColumnData::DateTimeOffset(_) => chrono::DateTime::<chrono::Utc>::from_sql(data)?
            .map(SqlValue::DateTimeUtc)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeUtc)),
        other => {
            return Err(SyncError::Query(format!(
                "unsupported SQL Server column value: {:?}",
                other
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_sql_typed_nulls() {
        assert!(matches!(
            SqlValue::Null(SqlNullType::I64).to_sql(),
            ColumnData::I64(None)
        ));
        assert!(matches!(
            SqlValue::Null(SqlNullType::Uuid).to_sql(),
            ColumnData::Guid(None)
        ));
    }

    #[test]
    fn test_decode_round_trips_basic_values() {
        assert_eq!(
            decode_value(&ColumnData::I32(Some(7))).unwrap(),
            SqlValue::I64(7)
        );
        assert_eq!(
            decode_value(&ColumnData::String(Some(Cow::Owned("x".into())))).unwrap(),
            SqlValue::Text("x".into())
        );
        assert_eq!(
            decode_value(&ColumnData::Bit(None)).unwrap(),
            SqlValue::Null(SqlNullType::Bool)
        );
    }

    #[test]
    fn test_decode_numeric_keeps_scale() {
        let n = tiberius::numeric::Numeric::new_with_scale(12345, 2);
        assert_eq!(
            decode_value(&ColumnData::Numeric(Some(n))).unwrap(),
            SqlValue::Decimal(Decimal::new(12345, 2))
        );
    }

    #[test]
    fn test_manager_rejects_bad_ssl_mode() {
        let config: DatasourceConfig = serde_yaml::from_str(
            "code: ms\ntype: mssql\nhost: h\ndatabase: d\nuser: sa\nssl_mode: sometimes\n",
        )
        .unwrap();
        assert!(TiberiusConnectionManager::new(config).is_err());
    }
}
