//! Migration engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};
use crate::history::DEFAULT_HISTORY_TABLE;
use crate::script::DEFAULT_BATCH_SEPARATOR;
use crate::store::FileMigrationStore;

/// Configuration for the migration executor.
///
/// Can be built in code or loaded from a TOML file:
///
/// ```toml
/// migrations_dir = "db/migrations"
/// history_table = "__migration_history"
/// applied_by = "deploy"
/// batch_separator = "GO"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory holding migration artifacts.
    pub migrations_dir: PathBuf,
    /// Name of the ledger table.
    pub history_table: String,
    /// Recorded as `applied_by` in the ledger.
    pub applied_by: String,
    /// Line token separating statement batches.
    pub batch_separator: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./migrations"),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            applied_by: "strata".to_string(),
            batch_separator: DEFAULT_BATCH_SEPARATOR.to_string(),
        }
    }
}

impl MigrationConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the migrations directory.
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Set the ledger table name.
    pub fn history_table(mut self, table: impl Into<String>) -> Self {
        self.history_table = table.into();
        self
    }

    /// Set the name recorded as `applied_by`.
    pub fn applied_by(mut self, who: impl Into<String>) -> Self {
        self.applied_by = who.into();
        self
    }

    /// Set the batch separator.
    pub fn batch_separator(mut self, separator: impl Into<String>) -> Self {
        self.batch_separator = separator.into();
        self
    }

    /// Filesystem store over the configured migrations directory.
    pub fn file_store(&self) -> FileMigrationStore {
        FileMigrationStore::new(&self.migrations_dir)
    }

    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> MigrateResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MigrationError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(MigrationError::config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        Self::from_toml_str(&content)
    }

    fn validate(&self) -> MigrateResult<()> {
        if self.history_table.trim().is_empty() {
            return Err(MigrationError::config("history_table must not be empty"));
        }
        if self.batch_separator.trim().is_empty() {
            return Err(MigrationError::config("batch_separator must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MigrationConfig::default();
        assert_eq!(config.migrations_dir, PathBuf::from("./migrations"));
        assert_eq!(config.history_table, "__migration_history");
        assert_eq!(config.batch_separator, "GO");
    }

    #[test]
    fn test_config_builder() {
        let config = MigrationConfig::new()
            .migrations_dir("./custom_migrations")
            .history_table("schema_log")
            .applied_by("ci")
            .batch_separator("END");

        assert_eq!(config.migrations_dir, PathBuf::from("./custom_migrations"));
        assert_eq!(config.history_table, "schema_log");
        assert_eq!(config.applied_by, "ci");
        assert_eq!(config.batch_separator, "END");
        assert_eq!(config.file_store().dir(), Path::new("./custom_migrations"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MigrationConfig::from_toml_str("applied_by = \"deploy\"\n").unwrap();
        assert_eq!(config.applied_by, "deploy");
        assert_eq!(config.history_table, "__migration_history");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            MigrationConfig::from_toml_str("history_table = ["),
            Err(MigrationError::Config(_))
        ));
        assert!(matches!(
            MigrationConfig::from_toml_str("batch_separator = \"  \""),
            Err(MigrationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_gives_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = MigrationConfig::load(temp.path().join("strata.toml"))
            .await
            .unwrap();
        assert_eq!(config, MigrationConfig::default());
    }

    #[tokio::test]
    async fn test_load_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("strata.toml");
        tokio::fs::write(&path, "migrations_dir = \"db/migrations\"\nhistory_table = \"log\"\n")
            .await
            .unwrap();

        let config = MigrationConfig::load(&path).await.unwrap();
        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(config.history_table, "log");
    }
}
