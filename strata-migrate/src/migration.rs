//! Migration types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::sql::MigrationSql;

/// A database migration. Never mutated once saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Sortable unique id (timestamp prefixed).
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Forward script.
    pub up_script: String,
    /// Reverse script.
    pub down_script: String,
    /// Description of what this migration does.
    pub description: Option<String>,
    /// When the migration was created.
    pub created_at: DateTime<Utc>,
    /// Migrations that must be applied first.
    pub dependencies: Vec<String>,
}

impl Migration {
    /// Create a new migration.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        up_script: impl Into<String>,
        down_script: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            up_script: up_script.into(),
            down_script: down_script.into(),
            description: None,
            created_at: Utc::now(),
            dependencies: Vec::new(),
        }
    }

    /// Create a migration from generated SQL.
    pub fn from_sql(id: impl Into<String>, name: impl Into<String>, sql: MigrationSql) -> Self {
        Self::new(id, name, sql.up, sql.down)
    }

    /// Set the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Add a dependency. Duplicates are ignored.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Set the creation time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Checksum of the forward script.
    pub fn checksum(&self) -> String {
        compute_checksum(&self.up_script)
    }
}

/// SHA-256 of the UTF-8 bytes, as uppercase hex.
pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode_upper(hasher.finalize())
}

/// Generate a new migration id: `YYYYMMDDHHMMSS_<slug>`.
pub fn generate_id(name: &str, at: DateTime<Utc>) -> String {
    let slug = slugify(name);
    let timestamp = at.format("%Y%m%d%H%M%S");
    if slug.is_empty() {
        timestamp.to_string()
    } else {
        format!("{}_{}", timestamp, slug)
    }
}

/// Lower-case a name and collapse every run of non-alphanumerics into `_`.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// Direction of migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationDirection {
    /// Apply the migration (up).
    Up,
    /// Reverse the migration (down).
    Down,
}

/// Where a migration stands within one executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Not applied.
    Pending,
    /// Up script running.
    Applying,
    /// Up script committed with its ledger row.
    Applied,
    /// Down script running.
    RollingBack,
    /// Down script committed and ledger row removed.
    RolledBack,
    /// The transaction was rolled back.
    Failed,
}

/// Report of one apply or rollback attempt.
#[derive(Debug, Clone)]
pub struct MigrationExecutionResult {
    /// Migration id.
    pub migration_id: String,
    /// Migration name.
    pub migration_name: String,
    /// Which script ran.
    pub direction: MigrationDirection,
    /// Final state.
    pub state: MigrationState,
    /// Whether the attempt committed.
    pub success: bool,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Elapsed time in milliseconds, also on failure.
    pub duration_ms: i64,
    /// Statements executed, on success.
    pub executed_statements: Vec<String>,
    /// Error text, on failure.
    pub error: Option<String>,
}

impl MigrationExecutionResult {
    pub(crate) fn succeeded(
        migration: &Migration,
        direction: MigrationDirection,
        started_at: DateTime<Utc>,
        duration_ms: i64,
        executed_statements: Vec<String>,
    ) -> Self {
        let state = match direction {
            MigrationDirection::Up => MigrationState::Applied,
            MigrationDirection::Down => MigrationState::RolledBack,
        };
        Self {
            migration_id: migration.id.clone(),
            migration_name: migration.name.clone(),
            direction,
            state,
            success: true,
            started_at,
            duration_ms,
            executed_statements,
            error: None,
        }
    }

    pub(crate) fn failed(
        id: &str,
        name: &str,
        direction: MigrationDirection,
        started_at: DateTime<Utc>,
        duration_ms: i64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            migration_id: id.to_string(),
            migration_name: name.to_string(),
            direction,
            state: MigrationState::Failed,
            success: false,
            started_at,
            duration_ms,
            executed_statements: Vec::new(),
            error: Some(error.into()),
        }
    }
}
