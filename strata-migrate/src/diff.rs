//! Schema diffing between the declared model and the live catalog.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::catalog::{CatalogReader, ColumnInfo, IndexInfo, index_definition};
use crate::error::MigrateResult;
use crate::model::{EntityDefinition, ModelSource, PropertyDefinition, validate_entities};

/// Kind of a detected schema difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DifferenceKind {
    /// A declared table is missing from the database.
    TableAdded,
    /// A database table is no longer declared.
    TableRemoved,
    /// A table was renamed (`old_value` -> `new_value`).
    TableRenamed,
    /// A declared column is missing from its table.
    ColumnAdded,
    /// A database column is no longer declared.
    ColumnRemoved,
    /// A column was renamed (`old_value` -> `new_value`).
    ColumnRenamed,
    /// A column's type differs.
    ColumnTypeChanged,
    /// A column's nullability differs.
    ColumnNullabilityChanged,
    /// A declared index is missing.
    IndexAdded,
    /// A database index is no longer declared.
    IndexRemoved,
    /// A foreign key constraint is added.
    ForeignKeyAdded,
    /// A foreign key constraint is removed.
    ForeignKeyRemoved,
    /// A unique constraint is added.
    UniqueConstraintAdded,
    /// A unique constraint is removed.
    UniqueConstraintRemoved,
}

impl DifferenceKind {
    /// Stable kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableAdded => "table-added",
            Self::TableRemoved => "table-removed",
            Self::TableRenamed => "table-renamed",
            Self::ColumnAdded => "column-added",
            Self::ColumnRemoved => "column-removed",
            Self::ColumnRenamed => "column-renamed",
            Self::ColumnTypeChanged => "column-type-changed",
            Self::ColumnNullabilityChanged => "column-nullability-changed",
            Self::IndexAdded => "index-added",
            Self::IndexRemoved => "index-removed",
            Self::ForeignKeyAdded => "foreign-key-added",
            Self::ForeignKeyRemoved => "foreign-key-removed",
            Self::UniqueConstraintAdded => "unique-constraint-added",
            Self::UniqueConstraintRemoved => "unique-constraint-removed",
        }
    }

    /// Whether this kind applies to a whole table.
    pub fn is_table_level(&self) -> bool {
        matches!(
            self,
            Self::TableAdded | Self::TableRemoved | Self::TableRenamed
        )
    }
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected delta between the declared model and the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDifference {
    /// What changed.
    pub kind: DifferenceKind,
    /// Table the change applies to.
    pub entity_name: String,
    /// Column, index or constraint name.
    pub property_name: Option<String>,
    /// Previous type or definition.
    pub old_value: Option<String>,
    /// New type or definition.
    pub new_value: Option<String>,
    /// Human readable description.
    pub description: String,
    /// Declared column definition, for column-level changes.
    pub column: Option<PropertyDefinition>,
}

impl SchemaDifference {
    fn new(kind: DifferenceKind, table: impl Into<String>, description: String) -> Self {
        Self {
            kind,
            entity_name: table.into(),
            property_name: None,
            old_value: None,
            new_value: None,
            description,
            column: None,
        }
    }

    fn property(mut self, name: impl Into<String>) -> Self {
        self.property_name = Some(name.into());
        self
    }

    fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    /// A table to create.
    pub fn table_added(table: &str) -> Self {
        Self::new(
            DifferenceKind::TableAdded,
            table,
            format!("Table '{}' added", table),
        )
    }

    /// A table to drop.
    pub fn table_removed(table: &str) -> Self {
        Self::new(
            DifferenceKind::TableRemoved,
            table,
            format!("Table '{}' removed", table),
        )
    }

    /// A table rename. The entity is the new name.
    pub fn table_renamed(old: &str, new: &str) -> Self {
        Self::new(
            DifferenceKind::TableRenamed,
            new,
            format!("Table '{}' renamed to '{}'", old, new),
        )
        .values(Some(old.to_string()), Some(new.to_string()))
    }

    /// A column to add.
    pub fn column_added(table: &str, column: &PropertyDefinition) -> Self {
        let mut diff = Self::new(
            DifferenceKind::ColumnAdded,
            table,
            format!("Column '{}.{}' added", table, column.column_name),
        )
        .property(&column.column_name)
        .values(None, Some(column.column_type.clone()));
        diff.column = Some(column.clone());
        diff
    }

    /// A column to drop. `old_type` is informational only.
    pub fn column_removed(table: &str, column: &str, old_type: Option<String>) -> Self {
        Self::new(
            DifferenceKind::ColumnRemoved,
            table,
            format!("Column '{}.{}' removed", table, column),
        )
        .property(column)
        .values(old_type, None)
    }

    /// A column rename. The property is the new name.
    pub fn column_renamed(table: &str, old: &str, new: &str) -> Self {
        Self::new(
            DifferenceKind::ColumnRenamed,
            table,
            format!("Column '{}.{}' renamed to '{}'", table, old, new),
        )
        .property(new)
        .values(Some(old.to_string()), Some(new.to_string()))
    }

    /// A column whose type changed. `old_definition` is the live type,
    /// followed by `NULL` / `NOT NULL` when known.
    pub fn column_type_changed(
        table: &str,
        column: &PropertyDefinition,
        old_definition: Option<String>,
    ) -> Self {
        let new_definition = format!("{} {}", column.column_type, null_keyword(column.nullable));
        let mut diff = Self::new(
            DifferenceKind::ColumnTypeChanged,
            table,
            format!(
                "Column '{}.{}' type changed to {}",
                table, column.column_name, column.column_type
            ),
        )
        .property(&column.column_name)
        .values(old_definition, Some(new_definition));
        diff.column = Some(column.clone());
        diff
    }

    /// A column whose nullability changed.
    pub fn column_nullability_changed(
        table: &str,
        column: &PropertyDefinition,
        was_nullable: bool,
    ) -> Self {
        let mut diff = Self::new(
            DifferenceKind::ColumnNullabilityChanged,
            table,
            format!(
                "Column '{}.{}' is now {}",
                table,
                column.column_name,
                null_keyword(column.nullable)
            ),
        )
        .property(&column.column_name)
        .values(
            Some(null_keyword(was_nullable).to_string()),
            Some(null_keyword(column.nullable).to_string()),
        );
        diff.column = Some(column.clone());
        diff
    }

    /// An index to create. `definition` is a comma separated column list,
    /// prefixed with `U:` for unique indexes.
    pub fn index_added(table: &str, name: &str, definition: impl Into<String>) -> Self {
        Self::new(
            DifferenceKind::IndexAdded,
            table,
            format!("Index '{}' on '{}' added", name, table),
        )
        .property(name)
        .values(None, Some(definition.into()))
    }

    /// An index to drop. `old_definition` allows the down script to recreate it.
    pub fn index_removed(table: &str, name: &str, old_definition: Option<String>) -> Self {
        Self::new(
            DifferenceKind::IndexRemoved,
            table,
            format!("Index '{}' on '{}' removed", name, table),
        )
        .property(name)
        .values(old_definition, None)
    }

    /// A foreign key to add, e.g. `FOREIGN KEY ([customer_id]) REFERENCES [customers] ([id])`.
    pub fn foreign_key_added(table: &str, name: &str, body: impl Into<String>) -> Self {
        Self::new(
            DifferenceKind::ForeignKeyAdded,
            table,
            format!("Foreign key '{}' on '{}' added", name, table),
        )
        .property(name)
        .values(None, Some(body.into()))
    }

    /// A foreign key to drop.
    pub fn foreign_key_removed(table: &str, name: &str, old_body: Option<String>) -> Self {
        Self::new(
            DifferenceKind::ForeignKeyRemoved,
            table,
            format!("Foreign key '{}' on '{}' removed", name, table),
        )
        .property(name)
        .values(old_body, None)
    }

    /// A unique constraint to add, e.g. `UNIQUE ([email])`.
    pub fn unique_constraint_added(table: &str, name: &str, body: impl Into<String>) -> Self {
        Self::new(
            DifferenceKind::UniqueConstraintAdded,
            table,
            format!("Unique constraint '{}' on '{}' added", name, table),
        )
        .property(name)
        .values(None, Some(body.into()))
    }

    /// A unique constraint to drop.
    pub fn unique_constraint_removed(table: &str, name: &str, old_body: Option<String>) -> Self {
        Self::new(
            DifferenceKind::UniqueConstraintRemoved,
            table,
            format!("Unique constraint '{}' on '{}' removed", name, table),
        )
        .property(name)
        .values(old_body, None)
    }
}

pub(crate) fn null_keyword(nullable: bool) -> &'static str {
    if nullable { "NULL" } else { "NOT NULL" }
}

/// Get a human-readable summary of a difference set.
pub fn summarize(diffs: &[SchemaDifference]) -> String {
    if diffs.is_empty() {
        return "No changes".to_string();
    }

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for diff in diffs {
        *counts.entry(diff.kind.as_str()).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(kind, n)| format!("{} {}", n, kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compares a declared model with the live catalog.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiffer {
    ignored_tables: Vec<String>,
}

impl SchemaDiffer {
    /// Create a differ.
    pub fn new() -> Self {
        Self::default()
    }

    /// Never report this live table as removed (e.g. the ledger table).
    pub fn ignore_table(mut self, table: impl Into<String>) -> Self {
        self.ignored_tables.push(table.into());
        self
    }

    /// Compute the differences.
    ///
    /// Any catalog error aborts the whole diff; no partial result is returned.
    pub async fn diff<M, R>(
        &self,
        model: &M,
        catalog: &mut R,
    ) -> MigrateResult<Vec<SchemaDifference>>
    where
        M: ModelSource + ?Sized,
        R: CatalogReader + ?Sized,
    {
        let entities = model.entities();
        validate_entities(entities)?;

        let live_tables: HashMap<String, String> = catalog
            .table_names()
            .await?
            .into_iter()
            .filter(|t| !self.is_ignored(t))
            .map(|t| (t.to_ascii_lowercase(), t))
            .collect();

        let declared: HashSet<String> = entities
            .iter()
            .map(|e| e.table_name.to_ascii_lowercase())
            .collect();

        let mut diffs = Vec::new();

        for entity in entities {
            if !live_tables.contains_key(&entity.table_name.to_ascii_lowercase()) {
                diffs.extend(create_table_diffs(entity));
            }
        }

        let mut removed: Vec<&String> = live_tables
            .iter()
            .filter(|(key, _)| !declared.contains(*key))
            .map(|(_, name)| name)
            .collect();
        removed.sort_by_key(|name| name.to_ascii_lowercase());
        for table in removed {
            diffs.push(SchemaDifference::table_removed(table));
        }

        for entity in entities {
            let Some(live_name) = live_tables.get(&entity.table_name.to_ascii_lowercase()) else {
                continue;
            };

            let columns = catalog.columns(live_name).await?;
            diffs.extend(diff_columns(entity, &columns));

            let indexes = catalog.indexes(live_name).await?;
            let live_indexes: Vec<_> = indexes
                .into_iter()
                .filter(|i| !i.is_constraint_backed())
                .collect();
            diffs.extend(diff_indexes(entity, &live_indexes));
        }

        debug!(changes = diffs.len(), "Schema diff computed");
        Ok(diffs)
    }

    fn is_ignored(&self, table: &str) -> bool {
        self.ignored_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }
}

fn create_table_diffs(entity: &EntityDefinition) -> Vec<SchemaDifference> {
    let table = entity.table_name.as_str();
    let mut diffs = vec![SchemaDifference::table_added(table)];

    for property in &entity.properties {
        diffs.push(SchemaDifference::column_added(table, property));
    }
    for index in &entity.indexes {
        diffs.push(SchemaDifference::index_added(
            table,
            &index.name,
            index_definition(&index.columns, index.unique),
        ));
    }

    diffs
}

fn diff_columns(entity: &EntityDefinition, live: &[ColumnInfo]) -> Vec<SchemaDifference> {
    let table = entity.table_name.as_str();
    let live_by_name: HashMap<String, &ColumnInfo> = live
        .iter()
        .map(|c| (c.name.to_ascii_lowercase(), c))
        .collect();

    let mut diffs = Vec::new();

    for property in &entity.properties {
        if !live_by_name.contains_key(&property.column_name.to_ascii_lowercase()) {
            diffs.push(SchemaDifference::column_added(table, property));
        }
    }

    let mut removed: Vec<&ColumnInfo> = live
        .iter()
        .filter(|c| entity.find_property(&c.name).is_none())
        .collect();
    removed.sort_by_key(|c| c.name.to_ascii_lowercase());
    for column in removed {
        diffs.push(SchemaDifference::column_removed(
            table,
            &column.name,
            column.data_type.clone(),
        ));
    }

    for property in &entity.properties {
        let Some(column) = live_by_name.get(&property.column_name.to_ascii_lowercase()) else {
            continue;
        };

        let type_changed = column
            .data_type
            .as_deref()
            .is_some_and(|live| normalize_type(live) != normalize_type(&property.column_type));

        if type_changed {
            let old = column.data_type.as_deref().map(|t| match column.is_nullable {
                Some(nullable) => format!("{} {}", t, null_keyword(nullable)),
                None => t.to_string(),
            });
            diffs.push(SchemaDifference::column_type_changed(table, property, old));
        } else if let Some(was_nullable) = column.is_nullable
            && was_nullable != property.nullable
        {
            diffs.push(SchemaDifference::column_nullability_changed(
                table,
                property,
                was_nullable,
            ));
        }
    }

    diffs
}

fn diff_indexes(entity: &EntityDefinition, live: &[IndexInfo]) -> Vec<SchemaDifference> {
    let table = entity.table_name.as_str();
    let mut diffs = Vec::new();

    let declared: HashMap<String, String> = entity
        .indexes
        .iter()
        .map(|i| {
            (
                i.name.to_ascii_lowercase(),
                index_definition(&i.columns, i.unique),
            )
        })
        .collect();

    let mut stale: Vec<_> = live
        .iter()
        .filter(|l| match declared.get(&l.name.to_ascii_lowercase()) {
            Some(definition) => !definition.eq_ignore_ascii_case(&l.definition()),
            None => true,
        })
        .collect();
    stale.sort_by_key(|l| l.name.to_ascii_lowercase());
    for index in stale {
        diffs.push(SchemaDifference::index_removed(
            table,
            &index.name,
            Some(index.definition()),
        ));
    }

    for index in &entity.indexes {
        let definition = index_definition(&index.columns, index.unique);
        let current = live
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(&index.name));
        if current.is_none_or(|l| !l.definition().eq_ignore_ascii_case(&definition)) {
            diffs.push(SchemaDifference::index_added(table, &index.name, definition));
        }
    }

    diffs
}

/// Normalise a type string for comparison.
///
/// Aliases map to one spelling and a bare type gets the arguments the server
/// fills in for it, so `DECIMAL` equals `DECIMAL(18,0)` and `DATETIME2`
/// equals `DATETIME2(7)`.
fn normalize_type(sql_type: &str) -> String {
    let compact: String = sql_type
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();

    let (base, args) = match compact.split_once('(') {
        Some((base, rest)) => (base.to_string(), Some(rest.trim_end_matches(')').to_string())),
        None => (compact, None),
    };

    let base = match base.as_str() {
        "INTEGER" => "INT".to_string(),
        "DEC" => "DECIMAL".to_string(),
        _ => base,
    };

    let args = match (base.as_str(), args) {
        ("DECIMAL" | "NUMERIC", None) => Some("18,0".to_string()),
        ("DECIMAL" | "NUMERIC", Some(p)) if !p.contains(',') => Some(format!("{},0", p)),
        ("CHAR" | "NCHAR" | "VARCHAR" | "NVARCHAR" | "BINARY" | "VARBINARY", None) => {
            Some("1".to_string())
        }
        ("DATETIME2" | "TIME" | "DATETIMEOFFSET", None) => Some("7".to_string()),
        ("FLOAT", None) => Some("53".to_string()),
        (_, args) => args,
    };

    match args {
        Some(args) => format!("{}({})", base, args),
        None => base,
    }
}
