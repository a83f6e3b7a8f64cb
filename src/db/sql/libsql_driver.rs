//! Embedded libSQL driver for single-node deployments.

use std::path::Path;

use async_trait::async_trait;
use libsql::{Builder, Connection, Value, params::Params};
use tokio::sync::Mutex;

use super::{Dialect, SqlDriver, SqlRow, SqlValue, Statement, classify_error};
use crate::error::DatabaseError;

/// A single libSQL connection.
///
/// Statements are serialized through one connection so a transaction never
/// interleaves with another caller's writes.
pub struct LibSqlDriver {
    // Keeps the database handle alive for the connection's lifetime.
    _db: libsql::Database,
    conn: Mutex<Connection>,
}

impl LibSqlDriver {
    /// Open (or create) a local database file. `:memory:` gives a private
    /// in-memory database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && path.as_os_str() != ":memory:"
        {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Connection {
                operation: "libsql_open".to_string(),
                reason: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection {
                operation: "libsql_open".to_string(),
                reason: e.to_string(),
            })?;
        let conn = db.connect().map_err(|e| DatabaseError::Connection {
            operation: "libsql_connect".to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "Opened libSQL database");
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }
}

fn to_params(params: &[SqlValue]) -> Params {
    Params::Positional(
        params
            .iter()
            .map(|v| match v {
                SqlValue::Null => Value::Null,
                SqlValue::Int(i) => Value::Integer(*i),
                SqlValue::Real(f) => Value::Real(*f),
                SqlValue::Text(s) => Value::Text(s.clone()),
                SqlValue::Blob(b) => Value::Blob(b.clone()),
            })
            .collect(),
    )
}

fn from_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Int(i),
        Value::Real(f) => SqlValue::Real(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Blob(b),
    }
}

#[async_trait]
impl SqlDriver for LibSqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute_script(&self, statements: &[String]) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        for sql in statements {
            conn.execute(sql, ())
                .await
                .map_err(|e| classify_error("libsql_migrate", e.to_string()))?;
        }
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(sql, to_params(params))
            .await
            .map_err(|e| classify_error("libsql_query", e.to_string()))?;
        let width = rows.column_count();
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| classify_error("libsql_query", e.to_string()))?
        {
            let mut values = Vec::with_capacity(width.max(0) as usize);
            for i in 0..width {
                let value = row
                    .get_value(i)
                    .map_err(|e| classify_error("libsql_query", e.to_string()))?;
                values.push(from_value(value));
            }
            out.push(SqlRow { values });
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(sql, to_params(params))
            .await
            .map_err(|e| classify_error("libsql_execute", e.to_string()))
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| classify_error("libsql_begin", e.to_string()))?;
        for stmt in statements {
            if let Err(e) = tx.execute(&stmt.sql, to_params(&stmt.params)).await {
                let err = classify_error("libsql_transaction", e.to_string());
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "libSQL rollback failed");
                }
                return Err(err);
            }
        }
        tx.commit()
            .await
            .map_err(|e| classify_error("libsql_commit", e.to_string()))
    }
}
