//! Migration executor.
//!
//! Orchestrates the artifact store, the ledger and the target connection.
//! Every migration runs in its own transaction together with its ledger
//! write, so a migration is either fully applied and recorded or not at all.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::InformationSchemaCatalog;
use crate::config::MigrationConfig;
use crate::connection::{Connection, Transaction, acquire, release};
use crate::diff::{SchemaDiffer, summarize};
use crate::error::{MigrateResult, MigrationError};
use crate::history::{Ledger, MigrationHistory, latest};
use crate::migration::{
    Migration, MigrationDirection, MigrationExecutionResult, compute_checksum, generate_id,
};
use crate::model::ModelSource;
use crate::script::split_batches;
use crate::sql::{MANUAL_INTERVENTION_MARKER, SqlGenerator};
use crate::store::MigrationStore;

/// Migration status information.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied migrations, oldest first.
    pub applied: Vec<MigrationHistory>,
    /// Pending migration IDs, ascending.
    pub pending: Vec<String>,
    /// Total number of applied migrations.
    pub total_applied: usize,
    /// Total number of pending migrations.
    pub total_pending: usize,
}

impl MigrationStatus {
    /// Whether the database is up to date with the store.
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A ledger checksum that no longer matches the stored up script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    /// Migration ID.
    pub migration_id: String,
    /// Checksum recorded in the ledger.
    pub expected: String,
    /// Checksum of the stored up script.
    pub actual: String,
}

/// Result of [`MigrationExecutor::validate_migration_integrity`].
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Number of ledger rows compared.
    pub checked: usize,
    /// Rows whose stored up script changed since it was applied.
    pub mismatches: Vec<ChecksumMismatch>,
    /// Rows whose migration is no longer in the store.
    pub missing: Vec<String>,
    /// Legacy rows without a checksum.
    pub skipped: Vec<String>,
}

impl IntegrityReport {
    /// IDs of every mismatched migration, in ledger order.
    pub fn mismatched_ids(&self) -> Vec<&str> {
        self.mismatches
            .iter()
            .map(|m| m.migration_id.as_str())
            .collect()
    }

    /// Whether every applied migration still matches its artifact.
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty() && self.missing.is_empty()
    }

    /// Turn any mismatch or missing artifact into an integrity error.
    pub fn ensure_valid(&self) -> MigrateResult<()> {
        if self.is_valid() {
            return Ok(());
        }
        let ids = self
            .mismatches
            .iter()
            .map(|m| m.migration_id.clone())
            .chain(self.missing.iter().cloned())
            .collect();
        Err(MigrationError::Integrity { ids })
    }
}

/// Applies and rolls back migrations against one database.
///
/// Operations take `&mut self`; run a single executor per database.
pub struct MigrationExecutor<C: Connection, S: MigrationStore> {
    conn: C,
    store: S,
    config: MigrationConfig,
    ledger: Ledger,
    generator: SqlGenerator,
}

impl<C: Connection, S: MigrationStore> MigrationExecutor<C, S> {
    /// Create a new executor.
    pub fn new(conn: C, store: S, config: MigrationConfig) -> Self {
        let ledger = Ledger::new(&config.history_table);
        let generator = SqlGenerator::new(&config.batch_separator);
        Self {
            conn,
            store,
            config,
            ledger,
            generator,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// The artifact store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The target connection.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Mutable access to the target connection.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Stored migrations without a ledger row, ascending by id.
    pub async fn get_pending_migrations(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<Migration>> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.pending().await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Ledger rows, ascending by `applied_at`.
    pub async fn get_applied_migrations(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<MigrationHistory>> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.applied().await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Applied rows and pending ids in one pass.
    pub async fn status(&mut self, cancel: &CancellationToken) -> MigrateResult<MigrationStatus> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.status_inner().await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Apply one migration.
    ///
    /// Statement failures produce a failed result and leave the ledger
    /// untouched. An already-applied id or an unapplied dependency is an
    /// error and nothing is executed.
    pub async fn apply_migration(
        &mut self,
        migration: &Migration,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationExecutionResult> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.apply(migration, cancel).await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Apply every pending migration in id order, stopping at the first
    /// failure. Returns the results so far.
    pub async fn apply_all_pending(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<MigrationExecutionResult>> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.apply_all(cancel).await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Roll back the most recently applied migration.
    ///
    /// Returns `None` when nothing is applied.
    pub async fn rollback_last_migration(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<Option<MigrationExecutionResult>> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.rollback_last(cancel).await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Roll back every applied migration with an id greater than `target_id`,
    /// most recent first, stopping at the first failure.
    pub async fn rollback_to(
        &mut self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<MigrationExecutionResult>> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let result = self.rollback_until(target_id, cancel).await;
        release(&mut self.conn, opened).await;
        result
    }

    /// Diff `model` against the live schema, generate scripts and save the
    /// result as a new migration.
    pub async fn generate_migration<M>(
        &mut self,
        model: &M,
        name: &str,
        description: Option<&str>,
        cancel: &CancellationToken,
    ) -> MigrateResult<Migration>
    where
        M: ModelSource + ?Sized,
    {
        ensure_not_cancelled(cancel)?;

        let differ = SchemaDiffer::new().ignore_table(self.ledger.table());
        let opened = acquire(&mut self.conn).await?;
        let diffs = {
            let mut catalog = InformationSchemaCatalog::new(&mut self.conn);
            differ.diff(model, &mut catalog).await
        };
        release(&mut self.conn, opened).await;
        let diffs = diffs?;

        if diffs.is_empty() {
            return Err(MigrationError::NoChanges);
        }
        ensure_not_cancelled(cancel)?;

        let id = generate_id(name, Utc::now());
        if self.store.get_by_id(&id).await?.is_some() {
            return Err(MigrationError::conflict(format!(
                "migration id '{}' already exists",
                id
            )));
        }

        let mut migration = Migration::from_sql(&id, name, self.generator.generate(&diffs));
        if let Some(description) = description {
            migration = migration.with_description(description);
        }
        self.store.save(&migration).await?;

        info!(migration_id = %id, changes = %summarize(&diffs), "Generated migration");
        Ok(migration)
    }

    /// Compare ledger checksums with the stored up scripts. Mutates nothing.
    pub async fn validate_migration_integrity(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<IntegrityReport> {
        ensure_not_cancelled(cancel)?;
        let opened = acquire(&mut self.conn).await?;
        let applied = self.applied().await;
        release(&mut self.conn, opened).await;

        let mut report = IntegrityReport::default();
        for record in applied? {
            let Some(expected) = record.checksum else {
                debug!(migration_id = %record.migration_id, "Skipping legacy ledger row");
                report.skipped.push(record.migration_id);
                continue;
            };
            report.checked += 1;

            let Some(migration) = self.store.get_by_id(&record.migration_id).await? else {
                warn!(migration_id = %record.migration_id, "Applied migration missing from store");
                report.missing.push(record.migration_id);
                continue;
            };

            let actual = compute_checksum(&migration.up_script);
            if !actual.eq_ignore_ascii_case(&expected) {
                warn!(
                    migration_id = %record.migration_id,
                    expected = %expected,
                    actual = %actual,
                    "Checksum mismatch"
                );
                report.mismatches.push(ChecksumMismatch {
                    migration_id: record.migration_id,
                    expected,
                    actual,
                });
            }
        }

        Ok(report)
    }

    async fn applied(&mut self) -> MigrateResult<Vec<MigrationHistory>> {
        self.ledger.ensure_table(&mut self.conn).await?;
        self.ledger.applied(&mut self.conn).await
    }

    async fn pending(&mut self) -> MigrateResult<Vec<Migration>> {
        let applied = self.applied().await?;
        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.migration_id.as_str()).collect();

        let mut pending: Vec<Migration> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|m| !applied_ids.contains(m.id.as_str()))
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pending)
    }

    async fn status_inner(&mut self) -> MigrateResult<MigrationStatus> {
        let applied = self.applied().await?;
        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.migration_id.as_str()).collect();

        let pending: Vec<String> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|m| !applied_ids.contains(m.id.as_str()))
            .map(|m| m.id)
            .collect();

        Ok(MigrationStatus {
            total_applied: applied.len(),
            total_pending: pending.len(),
            applied,
            pending,
        })
    }

    async fn apply(
        &mut self,
        migration: &Migration,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationExecutionResult> {
        let applied = self.applied().await?;

        if applied.iter().any(|r| r.migration_id == migration.id) {
            return Err(MigrationError::already_applied(&migration.id));
        }

        let missing: Vec<&str> = migration
            .dependencies
            .iter()
            .filter(|dep| !applied.iter().any(|r| &r.migration_id == *dep))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(MigrationError::validation(format!(
                "migration '{}' depends on unapplied migrations: {}",
                migration.id,
                missing.join(", ")
            )));
        }

        self.execute(migration, MigrationDirection::Up, cancel).await
    }

    async fn apply_all(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<MigrationExecutionResult>> {
        let pending = self.pending().await?;
        info!(count = pending.len(), "Applying pending migrations");

        let mut results = Vec::with_capacity(pending.len());
        for migration in &pending {
            let result = match self.apply(migration, cancel).await {
                Ok(result) => result,
                Err(e) => failed_before_start(migration, MigrationDirection::Up, &e),
            };
            let success = result.success;
            results.push(result);
            if !success {
                break;
            }
        }

        Ok(results)
    }

    async fn rollback_last(
        &mut self,
        cancel: &CancellationToken,
    ) -> MigrateResult<Option<MigrationExecutionResult>> {
        let applied = self.applied().await?;
        let Some(last) = latest(&applied) else {
            info!("No applied migrations to roll back");
            return Ok(None);
        };

        let migration = self.stored(&last.migration_id).await?;
        self.rollback(&migration, cancel).await.map(Some)
    }

    async fn rollback_until(
        &mut self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<MigrationExecutionResult>> {
        let mut applied = self.applied().await?;

        let target_known = applied.iter().any(|r| r.migration_id == target_id)
            || self.store.get_by_id(target_id).await?.is_some();
        if !target_known {
            return Err(MigrationError::not_found(format!(
                "migration '{}'",
                target_id
            )));
        }

        applied.retain(|r| r.migration_id.as_str() > target_id);
        applied.sort_by(|a, b| {
            b.applied_at
                .cmp(&a.applied_at)
                .then_with(|| b.migration_id.cmp(&a.migration_id))
        });
        info!(target = %target_id, count = applied.len(), "Rolling back migrations");

        let mut results = Vec::with_capacity(applied.len());
        for record in &applied {
            let result = match self.stored(&record.migration_id).await {
                Ok(migration) => match self.rollback(&migration, cancel).await {
                    Ok(result) => result,
                    Err(e) => failed_before_start(&migration, MigrationDirection::Down, &e),
                },
                Err(e) => MigrationExecutionResult::failed(
                    &record.migration_id,
                    &record.migration_name,
                    MigrationDirection::Down,
                    Utc::now(),
                    0,
                    e.to_string(),
                ),
            };
            let success = result.success;
            results.push(result);
            if !success {
                break;
            }
        }

        Ok(results)
    }

    async fn stored(&self, id: &str) -> MigrateResult<Migration> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| MigrationError::not_found(format!("migration '{}' in store", id)))
    }

    async fn rollback(
        &mut self,
        migration: &Migration,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationExecutionResult> {
        if migration.down_script.contains(MANUAL_INTERVENTION_MARKER) {
            warn!(
                migration_id = %migration.id,
                "Down script contains manual intervention steps that will not be executed"
            );
        }
        self.execute(migration, MigrationDirection::Down, cancel).await
    }

    /// Run one script and its ledger write in a single transaction.
    async fn execute(
        &mut self,
        migration: &Migration,
        direction: MigrationDirection,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationExecutionResult> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let script = match direction {
            MigrationDirection::Up => &migration.up_script,
            MigrationDirection::Down => &migration.down_script,
        };
        let statements = split_batches(script, &self.config.batch_separator);
        debug!(
            migration_id = %migration.id,
            direction = ?direction,
            statements = statements.len(),
            "Starting migration"
        );

        let Self {
            conn,
            ledger,
            config,
            ..
        } = self;
        let mut tx = Transaction::begin(conn).await?;

        let outcome = async {
            let executed = run_statements(&mut tx, &statements, cancel).await?;
            match direction {
                MigrationDirection::Up => {
                    let record = MigrationHistory {
                        migration_id: migration.id.clone(),
                        migration_name: migration.name.clone(),
                        applied_at: Utc::now(),
                        applied_by: config.applied_by.clone(),
                        execution_time_ms: elapsed_ms(clock),
                        checksum: Some(migration.checksum()),
                    };
                    ledger.insert(&mut tx, &record).await?;
                }
                MigrationDirection::Down => ledger.remove(&mut tx, &migration.id).await?,
            }
            ensure_not_cancelled(cancel)?;
            Ok::<_, MigrationError>(executed)
        }
        .await;

        let error = match outcome {
            Ok(executed) => match tx.commit().await {
                Ok(()) => {
                    let duration_ms = elapsed_ms(clock);
                    match direction {
                        MigrationDirection::Up => {
                            info!(migration_id = %migration.id, duration_ms, "Applied migration")
                        }
                        MigrationDirection::Down => {
                            info!(
                                migration_id = %migration.id,
                                duration_ms,
                                "Rolled back migration"
                            )
                        }
                    }
                    return Ok(MigrationExecutionResult::succeeded(
                        migration,
                        direction,
                        started_at,
                        duration_ms,
                        executed,
                    ));
                }
                Err(e) => e,
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        migration_id = %migration.id,
                        error = %rollback_err,
                        "Failed to roll back transaction"
                    );
                }
                e
            }
        };

        warn!(
            migration_id = %migration.id,
            direction = ?direction,
            error = %error,
            "Migration failed"
        );
        Ok(MigrationExecutionResult::failed(
            &migration.id,
            &migration.name,
            direction,
            started_at,
            elapsed_ms(clock),
            error.to_string(),
        ))
    }
}

async fn run_statements(
    tx: &mut Transaction<'_>,
    statements: &[String],
    cancel: &CancellationToken,
) -> MigrateResult<Vec<String>> {
    let mut executed = Vec::with_capacity(statements.len());
    for statement in statements {
        ensure_not_cancelled(cancel)?;
        debug!(statement = %statement, "Executing statement");
        tx.execute(statement, &[]).await?;
        executed.push(statement.clone());
    }
    Ok(executed)
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> MigrateResult<()> {
    if cancel.is_cancelled() {
        return Err(MigrationError::Cancelled);
    }
    Ok(())
}

fn failed_before_start(
    migration: &Migration,
    direction: MigrationDirection,
    error: &MigrationError,
) -> MigrationExecutionResult {
    warn!(migration_id = %migration.id, error = %error, "Migration could not start");
    MigrationExecutionResult::failed(
        &migration.id,
        &migration.name,
        direction,
        Utc::now(),
        0,
        error.to_string(),
    )
}

fn elapsed_ms(clock: Instant) -> i64 {
    i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch(id: &str) -> ChecksumMismatch {
        ChecksumMismatch {
            migration_id: id.to_string(),
            expected: "A".to_string(),
            actual: "B".to_string(),
        }
    }

    #[test]
    fn test_empty_report_is_valid() {
        let report = IntegrityReport::default();
        assert!(report.is_valid());
        assert!(report.ensure_valid().is_ok());
    }

    #[test]
    fn test_report_names_every_offender() {
        let report = IntegrityReport {
            checked: 3,
            mismatches: vec![mismatch("20240101_init"), mismatch("20240102_orders")],
            missing: vec!["20240103_gone".to_string()],
            skipped: Vec::new(),
        };

        assert_eq!(report.mismatched_ids(), vec!["20240101_init", "20240102_orders"]);
        match report.ensure_valid() {
            Err(MigrationError::Integrity { ids }) => {
                assert_eq!(ids, vec!["20240101_init", "20240102_orders", "20240103_gone"]);
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_skipped_rows_do_not_invalidate() {
        let report = IntegrityReport {
            skipped: vec!["legacy".to_string()],
            ..Default::default()
        };
        assert!(report.is_valid());
    }

    #[test]
    fn test_status_up_to_date() {
        let status = MigrationStatus {
            applied: Vec::new(),
            pending: vec!["1_a".to_string()],
            total_applied: 0,
            total_pending: 1,
        };
        assert!(!status.is_up_to_date());
    }

    #[test]
    fn test_cancelled_token_is_rejected() {
        let token = CancellationToken::new();
        assert!(ensure_not_cancelled(&token).is_ok());
        token.cancel();
        assert!(matches!(
            ensure_not_cancelled(&token),
            Err(MigrationError::Cancelled)
        ));
    }
}
