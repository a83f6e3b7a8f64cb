//! PostgreSQL driver for multi-node deployments.

use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Config as PoolSettings, Pool, PoolConfig, Runtime};
use postgres_types::{IsNull, ToSql, Type, to_sql_checked};
use secrecy::ExposeSecret;
use tokio_postgres::{NoTls, Row, error::SqlState};

use super::{Dialect, SqlDriver, SqlRow, SqlValue, Statement};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

/// Pooled PostgreSQL connections.
pub struct PgDriver {
    pool: Pool,
}

impl PgDriver {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut settings = PoolSettings::new();
        settings.host = Some(config.postgres_host.clone());
        settings.port = Some(config.postgres_port);
        settings.user = Some(config.postgres_user.clone());
        settings.password = Some(config.postgres_password.expose_secret().to_string());
        settings.dbname = Some(config.postgres_db.clone());
        settings.pool = Some(PoolConfig::new(config.pool_size));

        let pool = settings
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Connection {
                operation: "pg_connect".to_string(),
                reason: e.to_string(),
            })?;

        // Fail fast on bad credentials instead of on the first query.
        let driver = Self { pool };
        driver.client("pg_connect").await?;
        tracing::info!(
            host = %config.postgres_host,
            port = config.postgres_port,
            db = %config.postgres_db,
            pool_size = config.pool_size,
            "Connected to PostgreSQL"
        );
        Ok(driver)
    }

    async fn client(&self, operation: &str) -> Result<deadpool_postgres::Object, DatabaseError> {
        self.pool.get().await.map_err(|e| DatabaseError::Connection {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }
}

fn pg_error(operation: &str, err: tokio_postgres::Error) -> DatabaseError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return DatabaseError::Duplicate {
            operation: operation.to_string(),
            entity: "row".to_string(),
            id: err.to_string(),
        };
    }
    DatabaseError::Query {
        operation: operation.to_string(),
        reason: err.to_string(),
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::BOOL => (*v != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Real(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Blob(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn params(values: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn decode_row(operation: &str, row: &Row) -> Result<SqlRow, DatabaseError> {
    let corrupt = |e: tokio_postgres::Error| DatabaseError::Serialization {
        operation: operation.to_string(),
        reason: e.to_string(),
    };
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::INT8 => row.try_get::<_, Option<i64>>(i).map_err(corrupt)?.map(SqlValue::Int),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)
                .map_err(corrupt)?
                .map(|v| SqlValue::Int(i64::from(v))),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(i)
                .map_err(corrupt)?
                .map(|v| SqlValue::Int(i64::from(v))),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(i).map_err(corrupt)?.map(SqlValue::Real),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(i)
                .map_err(corrupt)?
                .map(|v| SqlValue::Real(f64::from(v))),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
                .try_get::<_, Option<String>>(i)
                .map_err(corrupt)?
                .map(SqlValue::Text),
            Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(i).map_err(corrupt)?.map(SqlValue::Blob),
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)
                .map_err(corrupt)?
                .map(SqlValue::from),
            ref other => {
                return Err(DatabaseError::Serialization {
                    operation: operation.to_string(),
                    reason: format!("unsupported column type {} for {}", other, column.name()),
                });
            }
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow { values })
}

#[async_trait]
impl SqlDriver for PgDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute_script(&self, statements: &[String]) -> Result<(), DatabaseError> {
        let client = self.client("pg_migrate").await?;
        for sql in statements {
            client
                .batch_execute(sql)
                .await
                .map_err(|e| pg_error("pg_migrate", e))?;
        }
        Ok(())
    }

    async fn query(&self, sql: &str, values: &[SqlValue]) -> Result<Vec<SqlRow>, DatabaseError> {
        let client = self.client("pg_query").await?;
        let rows = client
            .query(sql, &params(values))
            .await
            .map_err(|e| pg_error("pg_query", e))?;
        rows.iter().map(|row| decode_row("pg_query", row)).collect()
    }

    async fn execute(&self, sql: &str, values: &[SqlValue]) -> Result<u64, DatabaseError> {
        let client = self.client("pg_execute").await?;
        client
            .execute(sql, &params(values))
            .await
            .map_err(|e| pg_error("pg_execute", e))
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<(), DatabaseError> {
        let mut client = self.client("pg_transaction").await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| pg_error("pg_begin", e))?;
        for stmt in statements {
            // Dropping the transaction on error rolls it back.
            tx.execute(stmt.sql.as_str(), &params(&stmt.params))
                .await
                .map_err(|e| pg_error("pg_transaction", e))?;
        }
        tx.commit().await.map_err(|e| pg_error("pg_commit", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_encodes_for_narrow_columns() {
        let mut buf = BytesMut::new();
        let res = SqlValue::Int(7).to_sql(&Type::INT4, &mut buf);
        assert!(matches!(res, Ok(IsNull::No)));
        assert_eq!(buf.as_ref(), &7i32.to_be_bytes());

        let mut buf = BytesMut::new();
        assert!(SqlValue::Int(i64::MAX).to_sql(&Type::INT2, &mut buf).is_err());
    }

    #[test]
    fn test_null_encodes_as_null() {
        let mut buf = BytesMut::new();
        let res = SqlValue::Null.to_sql(&Type::TEXT, &mut buf);
        assert!(matches!(res, Ok(IsNull::Yes)));
        assert!(buf.is_empty());
    }
}
