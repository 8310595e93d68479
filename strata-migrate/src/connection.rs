//! Generic database connection and unit-of-work interface.
//!
//! Concrete drivers live outside this crate. A driver implements
//! [`Connection`]; the executor wraps it in a [`Transaction`] whenever DDL
//! and ledger writes must commit together.
//!
//! Parameters are bound positionally with `@P1`, `@P2`, ... placeholders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};

/// A parameter or column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Integer value.
    Int(i64),
    /// Text value.
    Text(String),
    /// Timestamp value (UTC).
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Borrow the text, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the timestamp, if this is a timestamp value.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Check for NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A result row, values in select-list order.
pub type Row = Vec<SqlValue>;

fn column<'r>(row: &'r Row, index: usize) -> MigrateResult<&'r SqlValue> {
    row.get(index).ok_or_else(|| {
        MigrationError::database(format!(
            "Row has {} columns, expected at least {}",
            row.len(),
            index + 1
        ))
    })
}

/// Read a required text column.
pub(crate) fn text_at(row: &Row, index: usize) -> MigrateResult<String> {
    match column(row, index)? {
        SqlValue::Text(s) => Ok(s.clone()),
        other => Err(MigrationError::database(format!(
            "Expected text in column {}, got {:?}",
            index, other
        ))),
    }
}

/// Read a nullable text column.
pub(crate) fn opt_text_at(row: &Row, index: usize) -> MigrateResult<Option<String>> {
    match column(row, index)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s.clone())),
        other => Err(MigrationError::database(format!(
            "Expected text in column {}, got {:?}",
            index, other
        ))),
    }
}

/// Read a nullable integer column.
pub(crate) fn opt_int_at(row: &Row, index: usize) -> MigrateResult<Option<i64>> {
    match column(row, index)? {
        SqlValue::Null => Ok(None),
        SqlValue::Int(v) => Ok(Some(*v)),
        other => Err(MigrationError::database(format!(
            "Expected integer in column {}, got {:?}",
            index, other
        ))),
    }
}

/// Read a required timestamp column.
pub(crate) fn timestamp_at(row: &Row, index: usize) -> MigrateResult<DateTime<Utc>> {
    match column(row, index)? {
        SqlValue::Timestamp(ts) => Ok(*ts),
        other => Err(MigrationError::database(format!(
            "Expected timestamp in column {}, got {:?}",
            index, other
        ))),
    }
}

/// A connection to the target database.
#[async_trait]
pub trait Connection: Send {
    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Open the connection.
    async fn open(&mut self) -> MigrateResult<()>;

    /// Close the connection.
    async fn close(&mut self) -> MigrateResult<()>;

    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64>;

    /// Run a query and return all rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>>;

    /// Begin a transaction.
    async fn begin(&mut self) -> MigrateResult<()>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> MigrateResult<()>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> MigrateResult<()>;
}

/// A single unit of work over a connection.
///
/// Must be finished with [`Transaction::commit`] or [`Transaction::rollback`].
pub struct Transaction<'c> {
    conn: &'c mut dyn Connection,
    finished: bool,
}

impl<'c> Transaction<'c> {
    /// Begin a transaction on the connection.
    pub async fn begin(conn: &'c mut dyn Connection) -> MigrateResult<Self> {
        debug!("Beginning transaction");
        conn.begin().await?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        self.conn.execute(sql, params).await
    }

    /// Run a query inside the transaction.
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>> {
        self.conn.query(sql, params).await
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> MigrateResult<()> {
        debug!("Committing transaction");
        self.finished = true;
        self.conn.commit().await
    }

    /// Roll back the transaction.
    pub async fn rollback(mut self) -> MigrateResult<()> {
        debug!("Rolling back transaction");
        self.finished = true;
        self.conn.rollback().await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Transaction dropped without commit or rollback");
        }
    }
}

/// Open the connection unless the caller already did.
///
/// Returns `true` when this call opened it, in which case the same scope must
/// hand that flag to [`release`].
pub async fn acquire(conn: &mut dyn Connection) -> MigrateResult<bool> {
    if conn.is_open() {
        return Ok(false);
    }
    debug!("Opening connection");
    conn.open().await?;
    Ok(true)
}

/// Close the connection if [`acquire`] opened it.
pub async fn release(conn: &mut dyn Connection, opened: bool) {
    if !opened {
        return;
    }
    debug!("Closing connection");
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close connection");
    }
}
