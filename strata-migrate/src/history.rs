//! Migration history ledger.
//!
//! The ledger is a table inside the target database holding one row per
//! applied migration. Reads go straight over the connection; writes only
//! happen inside the [`Transaction`] that runs the migration's statements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{
    Connection, Row, SqlValue, Transaction, opt_int_at, opt_text_at, text_at, timestamp_at,
};
use crate::error::MigrateResult;
use crate::sql::quote_ident;

/// Default ledger table name.
pub const DEFAULT_HISTORY_TABLE: &str = "__migration_history";

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHistory {
    /// Migration ID.
    pub migration_id: String,
    /// Migration name at the time it was applied.
    pub migration_name: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// Who applied it.
    pub applied_by: String,
    /// Duration of the up script in milliseconds.
    pub execution_time_ms: i64,
    /// Checksum of the up script. `None` for rows written before checksums.
    pub checksum: Option<String>,
}

impl MigrationHistory {
    fn from_row(row: &Row) -> MigrateResult<Self> {
        Ok(Self {
            migration_id: text_at(row, 0)?,
            migration_name: text_at(row, 1)?,
            applied_at: timestamp_at(row, 2)?,
            applied_by: opt_text_at(row, 3)?.unwrap_or_default(),
            execution_time_ms: opt_int_at(row, 4)?.unwrap_or(0),
            checksum: opt_text_at(row, 5)?,
        })
    }
}

/// SQL access to the ledger table.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_TABLE)
    }
}

impl Ledger {
    /// Ledger stored in the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Ledger table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotent `CREATE TABLE` guarded by `OBJECT_ID`.
    pub fn create_sql(&self) -> String {
        format!(
            "IF OBJECT_ID(N'{object}', N'U') IS NULL\n\
             CREATE TABLE {table} (\n    \
             [migration_id] NVARCHAR(255) NOT NULL PRIMARY KEY,\n    \
             [migration_name] NVARCHAR(255) NOT NULL,\n    \
             [applied_at] DATETIME2 NOT NULL,\n    \
             [applied_by] NVARCHAR(255) NOT NULL,\n    \
             [execution_time_ms] BIGINT NOT NULL,\n    \
             [checksum] NVARCHAR(64) NULL\n\
             );",
            object = self.table.replace('\'', "''"),
            table = quote_ident(&self.table),
        )
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT [migration_id], [migration_name], [applied_at], [applied_by], \
             [execution_time_ms], [checksum] FROM {} ORDER BY [applied_at], [migration_id]",
            quote_ident(&self.table)
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} ([migration_id], [migration_name], [applied_at], [applied_by], \
             [execution_time_ms], [checksum]) VALUES (@P1, @P2, @P3, @P4, @P5, @P6)",
            quote_ident(&self.table)
        )
    }

    fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE [migration_id] = @P1",
            quote_ident(&self.table)
        )
    }

    /// Create the ledger table if it does not exist.
    pub async fn ensure_table(&self, conn: &mut dyn Connection) -> MigrateResult<()> {
        debug!(table = %self.table, "Ensuring migration history table");
        conn.execute(&self.create_sql(), &[]).await?;
        Ok(())
    }

    /// All ledger rows, ordered by `applied_at` ascending (ties by id).
    pub async fn applied(&self, conn: &mut dyn Connection) -> MigrateResult<Vec<MigrationHistory>> {
        let rows = conn.query(&self.select_sql(), &[]).await?;
        let mut records = rows
            .iter()
            .map(MigrationHistory::from_row)
            .collect::<MigrateResult<Vec<_>>>()?;

        records.sort_by(|a, b| {
            a.applied_at
                .cmp(&b.applied_at)
                .then_with(|| a.migration_id.cmp(&b.migration_id))
        });
        Ok(records)
    }

    /// Record an applied migration inside the migration's transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_>,
        record: &MigrationHistory,
    ) -> MigrateResult<()> {
        let params = [
            SqlValue::from(record.migration_id.as_str()),
            SqlValue::from(record.migration_name.as_str()),
            SqlValue::from(record.applied_at),
            SqlValue::from(record.applied_by.as_str()),
            SqlValue::from(record.execution_time_ms),
            SqlValue::from(record.checksum.clone()),
        ];
        tx.execute(&self.insert_sql(), &params).await?;
        Ok(())
    }

    /// Remove a rolled back migration inside the rollback's transaction.
    pub async fn remove(&self, tx: &mut Transaction<'_>, migration_id: &str) -> MigrateResult<()> {
        let affected = tx
            .execute(&self.delete_sql(), &[SqlValue::from(migration_id)])
            .await?;
        if affected == 0 {
            warn!(migration_id = %migration_id, "No ledger row removed");
        }
        Ok(())
    }
}

/// The latest applied row: greatest `applied_at`, ties broken by greatest id.
pub(crate) fn latest(records: &[MigrationHistory]) -> Option<&MigrationHistory> {
    records.iter().max_by(|a, b| {
        a.applied_at
            .cmp(&b.applied_at)
            .then_with(|| a.migration_id.cmp(&b.migration_id))
    })
}
