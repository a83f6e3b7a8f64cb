//! Relational backends.
//!
//! Query templates are written once with `?` placeholders. [`SqlStore`]
//! rebinds them to `$1, $2, ...` when the driver speaks PostgreSQL, so the
//! libSQL and PostgreSQL drivers only have to move [`SqlValue`]s across the
//! wire.

mod schema;
mod store;

#[cfg(feature = "libsql")]
pub mod libsql_driver;
#[cfg(feature = "postgres")]
pub mod pg_driver;

pub use store::SqlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DatabaseError;

/// Placeholder and type dialect of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `?` placeholders, `BLOB`, `AUTOINCREMENT`.
    Sqlite,
    /// `$n` placeholders, `BYTEA`, `BIGSERIAL`.
    Postgres,
}

impl Dialect {
    pub(crate) fn blob_type(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "BLOB",
            Dialect::Postgres => "BYTEA",
        }
    }

    pub(crate) fn serial_key(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }
}

/// A driver-neutral column value.
///
/// Booleans are stored as `0`/`1` and timestamps as Unix seconds so every
/// integer column is a `BIGINT` on both engines.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Int(v.timestamp())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Serialize a structured field to a JSON text column.
pub(crate) fn json<T: Serialize>(operation: &str, value: &T) -> Result<SqlValue, DatabaseError> {
    serde_json::to_string(value)
        .map(SqlValue::Text)
        .map_err(|e| DatabaseError::Serialization {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
}

/// A parameterized statement, already rebound for its driver.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// One result row.
#[derive(Debug, Clone, Default)]
pub struct SqlRow {
    pub values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn reader<'a>(&'a self, operation: &'a str) -> RowReader<'a> {
        RowReader {
            row: self,
            pos: 0,
            operation,
        }
    }
}

/// Sequential typed access to the columns of a [`SqlRow`].
pub struct RowReader<'a> {
    row: &'a SqlRow,
    pos: usize,
    operation: &'a str,
}

impl<'a> RowReader<'a> {
    fn corrupt(&self, expected: &str, got: &SqlValue) -> DatabaseError {
        DatabaseError::Serialization {
            operation: self.operation.to_string(),
            reason: format!("column {}: expected {}, got {:?}", self.pos, expected, got),
        }
    }

    fn next(&mut self) -> Result<&'a SqlValue, DatabaseError> {
        let value = self
            .row
            .values
            .get(self.pos)
            .ok_or_else(|| DatabaseError::Serialization {
                operation: self.operation.to_string(),
                reason: format!("missing column {}", self.pos),
            })?;
        self.pos += 1;
        Ok(value)
    }

    pub fn text(&mut self) -> Result<String, DatabaseError> {
        match self.next()? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Null => Ok(String::new()),
            other => Err(self.corrupt("text", other)),
        }
    }

    pub fn opt_text(&mut self) -> Result<Option<String>, DatabaseError> {
        match self.next()? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            other => Err(self.corrupt("text", other)),
        }
    }

    pub fn int(&mut self) -> Result<i64, DatabaseError> {
        match self.next()? {
            SqlValue::Int(v) => Ok(*v),
            other => Err(self.corrupt("integer", other)),
        }
    }

    pub fn opt_int(&mut self) -> Result<Option<i64>, DatabaseError> {
        match self.next()? {
            SqlValue::Null => Ok(None),
            SqlValue::Int(v) => Ok(Some(*v)),
            other => Err(self.corrupt("integer", other)),
        }
    }

    pub fn uint(&mut self) -> Result<u32, DatabaseError> {
        let v = self.int()?;
        u32::try_from(v).map_err(|_| DatabaseError::Serialization {
            operation: self.operation.to_string(),
            reason: format!("column {}: {} out of range", self.pos - 1, v),
        })
    }

    pub fn real(&mut self) -> Result<f64, DatabaseError> {
        match self.next()? {
            SqlValue::Real(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v as f64),
            other => Err(self.corrupt("real", other)),
        }
    }

    pub fn boolean(&mut self) -> Result<bool, DatabaseError> {
        Ok(self.int()? != 0)
    }

    pub fn blob(&mut self) -> Result<Vec<u8>, DatabaseError> {
        Ok(self.opt_blob()?.unwrap_or_default())
    }

    pub fn opt_blob(&mut self) -> Result<Option<Vec<u8>>, DatabaseError> {
        match self.next()? {
            SqlValue::Null => Ok(None),
            SqlValue::Blob(b) => Ok(Some(b.clone())),
            other => Err(self.corrupt("blob", other)),
        }
    }

    pub fn time(&mut self) -> Result<DateTime<Utc>, DatabaseError> {
        let secs = self.int()?;
        self.to_time(secs)
    }

    pub fn opt_time(&mut self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        match self.opt_int()? {
            Some(secs) => self.to_time(secs).map(Some),
            None => Ok(None),
        }
    }

    fn to_time(&self, secs: i64) -> Result<DateTime<Utc>, DatabaseError> {
        DateTime::from_timestamp(secs, 0).ok_or_else(|| DatabaseError::Serialization {
            operation: self.operation.to_string(),
            reason: format!("timestamp {} out of range", secs),
        })
    }

    /// Decode a JSON text column; `NULL` and empty text decode as `Default`.
    pub fn json<T: DeserializeOwned + Default>(&mut self) -> Result<T, DatabaseError> {
        let raw = self.text()?;
        if raw.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&raw).map_err(|e| DatabaseError::Serialization {
            operation: self.operation.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode a text column through `FromStr`.
    pub fn parse<T>(&mut self) -> Result<T, DatabaseError>
    where
        T: std::str::FromStr<Err = String>,
    {
        let raw = self.text()?;
        raw.parse().map_err(|e: String| DatabaseError::Serialization {
            operation: self.operation.to_string(),
            reason: e,
        })
    }
}

/// Minimal engine surface the shared store needs.
///
/// SQL handed to a driver is already rebound for its [`Dialect`].
#[async_trait]
pub trait SqlDriver: Send + Sync + 'static {
    fn dialect(&self) -> Dialect;

    /// Run DDL statements one by one, outside a transaction.
    async fn execute_script(&self, statements: &[String]) -> Result<(), DatabaseError>;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DatabaseError>;

    /// Returns the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError>;

    /// Run every statement in one transaction; roll back on the first error.
    async fn transaction(&self, statements: &[Statement]) -> Result<(), DatabaseError>;
}

/// Rewrite `?` placeholders to `$1, $2, ...`, skipping quoted literals.
pub fn rebind(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut in_quote = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                out.push(c);
            }
            '?' if !in_quote => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

/// Map an engine error message to a store error.
#[cfg(any(feature = "libsql", test))]
pub(crate) fn classify_error(operation: &str, message: String) -> DatabaseError {
    let lower = message.to_lowercase();
    if lower.contains("unique constraint") || lower.contains("duplicate key") {
        DatabaseError::Duplicate {
            operation: operation.to_string(),
            entity: "row".to_string(),
            id: message,
        }
    } else {
        DatabaseError::Query {
            operation: operation.to_string(),
            reason: message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebind_numbers_placeholders() {
        assert_eq!(
            rebind("SELECT * FROM beads WHERE id = ? AND status = ?"),
            "SELECT * FROM beads WHERE id = $1 AND status = $2"
        );
    }

    #[test]
    fn test_rebind_skips_quoted_literals() {
        assert_eq!(
            rebind("SELECT '?' FROM t WHERE a = ? AND b = 'x?y'"),
            "SELECT '?' FROM t WHERE a = $1 AND b = 'x?y'"
        );
    }

    #[test]
    fn test_reader_decodes_columns_in_order() {
        let row = SqlRow {
            values: vec![
                SqlValue::Text("b1".into()),
                SqlValue::Int(1),
                SqlValue::Null,
                SqlValue::Int(1_700_000_000),
                SqlValue::Text("{\"k\":\"v\"}".into()),
            ],
        };
        let mut r = row.reader("test");
        assert_eq!(r.text().unwrap(), "b1");
        assert!(r.boolean().unwrap());
        assert_eq!(r.opt_time().unwrap(), None);
        assert_eq!(r.time().unwrap().timestamp(), 1_700_000_000);
        let map: std::collections::BTreeMap<String, String> = r.json().unwrap();
        assert_eq!(map.get("k").map(String::as_str), Some("v"));
        assert!(r.text().is_err());
    }

    #[test]
    fn test_classify_unique_violation() {
        let err = classify_error("op", "UNIQUE constraint failed: workflow_executions.bead_id".into());
        assert!(matches!(err, DatabaseError::Duplicate { .. }));
        let err = classify_error("op", "syntax error".into());
        assert!(matches!(err, DatabaseError::Query { .. }));
    }
}
