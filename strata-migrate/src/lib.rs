//! # strata-migrate
//!
//! Database migration engine.
//!
//! This crate provides functionality for:
//! - Schema diffing between a declared data model and the live catalog
//! - Reversible SQL script generation for SQL Server
//! - Migration artifact storage on the filesystem
//! - A migration history ledger inside the target database
//! - Transactional migration application and rollback
//! - Checksum based integrity validation of applied migrations
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌───────────────┐
//! │ Model Source │────▶│ Schema Differ  │────▶│ SQL Generator │
//! └──────────────┘     └────────────────┘     └───────────────┘
//!                              ▲                      │
//!                              │                      ▼
//!                      ┌────────────────┐     ┌───────────────┐
//!                      │ Catalog Reader │     │ Artifact Store│
//!                      └────────────────┘     └───────────────┘
//!                                                     │
//!                                                     ▼
//!                      ┌────────────────┐     ┌───────────────┐
//!                      │ History Ledger │◀───▶│   Executor    │
//!                      └────────────────┘     └───────────────┘
//! ```
//!
//! The executor runs each migration's statements and its ledger write in one
//! transaction, so the ledger never disagrees with the schema.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_migrate::{DeclaredModel, MigrationConfig, MigrationExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run_migrations(conn: impl strata_migrate::Connection) -> strata_migrate::MigrateResult<()> {
//!     let config = MigrationConfig::load("strata.toml").await?;
//!     let store = config.file_store();
//!     let mut executor = MigrationExecutor::new(conn, store, config);
//!     let cancel = CancellationToken::new();
//!
//!     // Capture model changes as a new migration
//!     let model = DeclaredModel::load("model.toml").await?;
//!     let migration = executor
//!         .generate_migration(&model, "add orders", Some("Orders table"), &cancel)
//!         .await?;
//!     println!("Generated {}", migration.id);
//!
//!     // Apply everything pending
//!     for result in executor.apply_all_pending(&cancel).await? {
//!         println!("{}: {}", result.migration_id, result.success);
//!     }
//!
//!     executor.validate_migration_integrity(&cancel).await?.ensure_valid()
//! }
//! ```
//!
//! ## Migration Files
//!
//! Each migration is three files in the migrations directory:
//!
//! ```text
//! migrations/
//! ├── 20240101120000_create_orders_up.sql
//! ├── 20240101120000_create_orders_down.sql
//! └── 20240101120000_create_orders_meta.txt
//! ```
//!
//! Scripts are split into batches on lines holding only `GO`; lines starting
//! with `--` are never sent to the database.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod diff;
pub mod error;
pub mod executor;
pub mod history;
pub mod migration;
pub mod model;
pub mod script;
pub mod sql;
pub mod store;

// Re-exports
pub use catalog::{CatalogReader, ColumnInfo, IndexInfo, InformationSchemaCatalog};
pub use config::MigrationConfig;
pub use connection::{Connection, Row, SqlValue, Transaction};
pub use diff::{DifferenceKind, SchemaDiffer, SchemaDifference, summarize};
pub use error::{MigrateResult, MigrationError};
pub use executor::{ChecksumMismatch, IntegrityReport, MigrationExecutor, MigrationStatus};
pub use history::{DEFAULT_HISTORY_TABLE, Ledger, MigrationHistory};
pub use migration::{
    Migration, MigrationDirection, MigrationExecutionResult, MigrationState, compute_checksum,
    generate_id,
};
pub use model::{
    DeclaredModel, EntityDefinition, IndexDefinition, ModelSource, PropertyDefinition,
};
pub use script::{DEFAULT_BATCH_SEPARATOR, split_batches};
pub use sql::{MANUAL_INTERVENTION_MARKER, MigrationSql, SqlGenerator};
pub use store::{FileMigrationStore, MigrationStore};
