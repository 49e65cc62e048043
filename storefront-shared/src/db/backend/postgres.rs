/// PostgreSQL backend using sqlx
///
/// Each pooled connection owns one `sqlx::PgConnection`. Pooling itself is done
/// by [`crate::db::pool::ConnectionPool`], not by sqlx, so lease accounting,
/// use counting and retirement stay under this crate's control.
///
/// # Type mapping
///
/// | Postgres | [`Value`] |
/// |---|---|
/// | BOOL | `Bool` |
/// | INT2 / INT4 / INT8 | `Int` |
/// | FLOAT4 / FLOAT8 | `Float` |
/// | TEXT / VARCHAR / BPCHAR / NAME | `Text` |
/// | BYTEA | `Bytes` |
/// | UUID | `Uuid` |
/// | TIMESTAMPTZ / TIMESTAMP / DATE | `Timestamp` (UTC) |
/// | JSON / JSONB | `Json` |
///
/// Other column types fail with [`BackendError::Decode`]; store money as
/// integer cents rather than NUMERIC.
///
/// `Value::Null` is bound as a text-typed NULL. Cast it in SQL (`$3::int8`)
/// when the target column has another type.

use crate::db::backend::{Connection, ConnectionFactory, StatementOutput};
use crate::db::config::{PoolConfig, SslMode};
use crate::db::error::BackendError;
use crate::db::value::{Row, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Either, Postgres, Row as _, TypeInfo};
use uuid::Uuid;

/// Application name reported to the server (visible in `pg_stat_activity`)
const APPLICATION_NAME: &str = "storefront";

/// Opens sqlx `PgConnection`s from a validated [`PoolConfig`]
pub struct PgConnectionFactory {
    options: PgConnectOptions,
}

impl PgConnectionFactory {
    pub fn new(config: &PoolConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .application_name(APPLICATION_NAME)
            .ssl_mode(ssl_mode(config.ssl_mode));

        if let Some(ca) = &config.ssl_root_cert {
            options = options.ssl_root_cert(ca);
        }

        if let Some(timeout) = config.statement_timeout {
            options = options.options([("statement_timeout", timeout.as_millis().to_string())]);
        }

        Self { options }
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, BackendError> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| match BackendError::from(e) {
                // Authentication and startup failures are not retryable statements
                BackendError::Database { message, .. } => BackendError::Connection(message),
                other => other,
            })?;

        Ok(Box::new(PgBackendConnection { conn }))
    }
}

struct PgBackendConnection {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PgBackendConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput, BackendError> {
        let query = params
            .iter()
            .fold(sqlx::query::<Postgres>(sql), bind_value);

        let mut output = StatementOutput::default();
        // Only `fetch_many` yields both the rows and the command result in one
        // round trip; deprecated in sqlx 0.7.4 without a replacement
        #[allow(deprecated)]
        let mut stream = query.fetch_many(&mut self.conn);

        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(result) => output.rows_affected += result.rows_affected(),
                Either::Right(row) => output.rows.push(decode_row(&row)?),
            }
        }

        Ok(output)
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.conn.ping().await.map_err(BackendError::from)
    }

    async fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.conn.close().await.map_err(BackendError::from)
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Uuid(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::Json(v) => query.bind(v.clone()),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, BackendError> {
    let mut out = Row::with_capacity(row.len());

    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = match type_name {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
            "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(|v| Value::Int(v.into())),
            "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(|v| Value::Int(v.into())),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
            "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(|v| Value::Float(v.into())),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx)?.map(Value::Text)
            }
            "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(idx)?.map(Value::Bytes),
            "UUID" => row.try_get::<Option<Uuid>, _>(idx)?.map(Value::Uuid),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(Value::Timestamp),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)?
                .map(|v| Value::Timestamp(v.and_utc())),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(idx)?
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|v| Value::Timestamp(v.and_utc())),
            "JSON" | "JSONB" => row
                .try_get::<Option<serde_json::Value>, _>(idx)?
                .map(Value::Json),
            other => {
                return Err(BackendError::Decode(format!(
                    "unsupported type {} for column `{}`",
                    other,
                    column.name()
                )))
            }
        };

        out.push(column.name(), value.unwrap_or(Value::Null));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(SslMode::Disable), PgSslMode::Disable));
        assert!(matches!(ssl_mode(SslMode::Require), PgSslMode::Require));
        assert!(matches!(ssl_mode(SslMode::VerifyFull), PgSslMode::VerifyFull));
    }

    #[test]
    fn test_factory_builds_from_config() {
        let config = PoolConfig::new("localhost", 5432, "shop", "secret", "shop")
            .with_connect_timeout(Duration::from_millis(500));
        let factory = PgConnectionFactory::new(&config);
        assert_eq!(factory.name(), "postgres");
    }
}
