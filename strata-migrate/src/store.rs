//! Migration artifact storage.
//!
//! [`FileMigrationStore`] keeps three files per migration in one directory:
//!
//! ```text
//! migrations/
//!   20240101120000_create_orders_up.sql
//!   20240101120000_create_orders_down.sql
//!   20240101120000_create_orders_meta.txt
//! ```
//!
//! The meta file holds `Key: value` lines (`Name`, `Description`,
//! `CreatedAt`, `Dependencies`).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::migration::Migration;

const UP_SUFFIX: &str = "_up.sql";
const DOWN_SUFFIX: &str = "_down.sql";
const META_SUFFIX: &str = "_meta.txt";

/// Persistent storage for migrations.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// All complete migrations, ascending by id.
    async fn get_all(&self) -> MigrateResult<Vec<Migration>>;

    /// A single migration, if stored.
    async fn get_by_id(&self, id: &str) -> MigrateResult<Option<Migration>>;

    /// Store a migration, overwriting any previous artifacts with the same id.
    async fn save(&self, migration: &Migration) -> MigrateResult<()>;

    /// Remove every artifact of a migration.
    async fn delete(&self, id: &str) -> MigrateResult<()>;
}

/// Filesystem-backed migration store.
#[derive(Debug, Clone)]
pub struct FileMigrationStore {
    dir: PathBuf,
}

impl FileMigrationStore {
    /// Create a store over the given directory. The directory is created on
    /// first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The migrations directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn up_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, UP_SUFFIX))
    }

    fn down_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, DOWN_SUFFIX))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, META_SUFFIX))
    }

    async fn ensure_dir(&self) -> MigrateResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Read one migration. `None` when the up or down artifact is missing.
    async fn read(&self, id: &str) -> MigrateResult<Option<Migration>> {
        let Some(up_script) = read_optional(&self.up_path(id)).await? else {
            return Ok(None);
        };
        let Some(down_script) = read_optional(&self.down_path(id)).await? else {
            return Ok(None);
        };

        let meta = match read_optional(&self.meta_path(id)).await? {
            Some(text) => parse_meta(&text)?,
            None => Meta::default(),
        };

        Ok(Some(Migration {
            id: id.to_string(),
            name: meta.name.unwrap_or_else(|| id.to_string()),
            up_script,
            down_script,
            description: meta.description,
            created_at: meta.created_at.unwrap_or_else(Utc::now),
            dependencies: meta.dependencies,
        }))
    }
}

#[async_trait]
impl MigrationStore for FileMigrationStore {
    async fn get_all(&self) -> MigrateResult<Vec<Migration>> {
        self.ensure_dir().await?;

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(id) = file_name.to_str().and_then(|n| n.strip_suffix(UP_SUFFIX))
                && !id.is_empty()
            {
                ids.push(id.to_string());
            }
        }

        // Ids are timestamp prefixed.
        ids.sort();

        let mut migrations = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read(&id).await {
                Ok(Some(migration)) => migrations.push(migration),
                Ok(None) => debug!(migration_id = %id, "Skipping incomplete migration"),
                Err(e) => warn!(migration_id = %id, error = %e, "Skipping unreadable migration"),
            }
        }

        Ok(migrations)
    }

    async fn get_by_id(&self, id: &str) -> MigrateResult<Option<Migration>> {
        check_id(id)?;
        self.ensure_dir().await?;
        self.read(id).await
    }

    async fn save(&self, migration: &Migration) -> MigrateResult<()> {
        check_id(&migration.id)?;
        self.ensure_dir().await?;

        tokio::fs::write(self.up_path(&migration.id), &migration.up_script).await?;
        tokio::fs::write(self.down_path(&migration.id), &migration.down_script).await?;
        tokio::fs::write(self.meta_path(&migration.id), render_meta(migration)).await?;

        debug!(migration_id = %migration.id, dir = %self.dir.display(), "Saved migration");
        Ok(())
    }

    async fn delete(&self, id: &str) -> MigrateResult<()> {
        check_id(id)?;
        self.ensure_dir().await?;

        let mut removed = false;
        for path in [self.up_path(id), self.down_path(id), self.meta_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !removed {
            return Err(MigrationError::not_found(format!("migration '{}'", id)));
        }
        debug!(migration_id = %id, "Deleted migration");
        Ok(())
    }
}

/// Ids become file name prefixes, so they must stay inside the directory.
fn check_id(id: &str) -> MigrateResult<()> {
    if id.is_empty() || id.contains(['/', '\\', '\0']) || id.contains("..") {
        return Err(MigrationError::validation(format!(
            "Invalid migration id '{}'",
            id.escape_debug()
        )));
    }
    Ok(())
}

async fn read_optional(path: &Path) -> MigrateResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Default)]
struct Meta {
    name: Option<String>,
    description: Option<String>,
    created_at: Option<DateTime<Utc>>,
    dependencies: Vec<String>,
}

fn parse_meta(text: &str) -> MigrateResult<Meta> {
    let mut meta = Meta::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(MigrationError::validation(format!(
                "Malformed metadata line: {}",
                line
            )));
        };
        let value = value.trim();

        match key.trim() {
            "Name" if !value.is_empty() => meta.name = Some(value.to_string()),
            "Description" if !value.is_empty() => meta.description = Some(value.to_string()),
            "CreatedAt" => {
                let at = DateTime::parse_from_rfc3339(value).map_err(|e| {
                    MigrationError::validation(format!("Invalid CreatedAt '{}': {}", value, e))
                })?;
                meta.created_at = Some(at.with_timezone(&Utc));
            }
            "Dependencies" => {
                meta.dependencies = value
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from)
                    .collect();
            }
            _ => {}
        }
    }

    Ok(meta)
}

fn render_meta(migration: &Migration) -> String {
    let mut out = format!("Name: {}\n", single_line(&migration.name));
    if let Some(description) = &migration.description {
        out.push_str(&format!("Description: {}\n", single_line(description)));
    }
    out.push_str(&format!(
        "CreatedAt: {}\n",
        migration.created_at.to_rfc3339()
    ));
    if !migration.dependencies.is_empty() {
        out.push_str(&format!(
            "Dependencies: {}\n",
            migration.dependencies.join(", ")
        ));
    }
    out
}

fn single_line(value: &str) -> String {
    value.lines().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_meta() {
        let meta = parse_meta(
            "Name: create orders\nDescription: Orders: first cut\n\
             CreatedAt: 2024-01-01T12:00:00+00:00\nDependencies: a, b,\nOwner: ops\n",
        )
        .unwrap();

        assert_eq!(meta.name.as_deref(), Some("create orders"));
        assert_eq!(meta.description.as_deref(), Some("Orders: first cut"));
        assert_eq!(
            meta.created_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(meta.dependencies, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_meta_rejects_garbage() {
        assert!(parse_meta("not a key value line").is_err());
        assert!(parse_meta("CreatedAt: yesterday").is_err());
    }

    #[test]
    fn test_render_meta() {
        let migration = Migration::new("1_x", "x", "", "")
            .with_description("two\nlines")
            .depends_on("0_init")
            .created_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        assert_eq!(
            render_meta(&migration),
            "Name: x\nDescription: two lines\nCreatedAt: 2024-01-01T00:00:00+00:00\n\
             Dependencies: 0_init\n"
        );
    }

    #[test]
    fn test_check_id() {
        assert!(check_id("20240101120000_create_orders").is_ok());
        assert!(check_id("").is_err());
        assert!(check_id("../outside").is_err());
        assert!(check_id("nested/id").is_err());
        assert!(check_id("nested\\id").is_err());
    }

    #[tokio::test]
    async fn test_missing_directory_is_created() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("nested").join("migrations");
        let store = FileMigrationStore::new(&dir);

        assert!(store.get_all().await.unwrap().is_empty());
        assert!(dir.is_dir());
    }
}
