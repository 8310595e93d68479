//! The declared data model consumed from the ORM layer.
//!
//! The differ only needs a read-only list of tables with their columns (and
//! optionally named indexes). Anything able to produce that list implements
//! [`ModelSource`]; [`DeclaredModel`] is the concrete carrier and can also be
//! loaded from a TOML snapshot:
//!
//! ```toml
//! [[entity]]
//! table_name = "orders"
//!
//! [[entity.columns]]
//! column_name = "id"
//! column_type = "INT"
//! is_primary_key = true
//! is_auto_increment = true
//!
//! [[entity.columns]]
//! column_name = "total"
//! column_type = "DECIMAL(18,2)"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// A declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Column name.
    pub column_name: String,
    /// Column type as SQL text (e.g. `NVARCHAR(100)`).
    pub column_type: String,
    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,
    /// Default value expression.
    #[serde(default)]
    pub default_value: Option<String>,
    /// Whether the column is (part of) the primary key.
    #[serde(default)]
    pub is_primary_key: bool,
    /// Whether the column value is generated by the database.
    #[serde(default)]
    pub is_auto_increment: bool,
}

impl PropertyDefinition {
    /// Create a non-nullable column.
    pub fn new(column_name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            column_type: column_type.into(),
            nullable: false,
            default_value: None,
            is_primary_key: false,
            is_auto_increment: false,
        }
    }

    /// Mark the column as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the default value expression.
    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default_value = Some(expr.into());
        self
    }

    /// Mark the column as primary key.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    /// Mark the column as database generated.
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }

    /// Whether the column type is one of the integer types.
    pub fn is_integer_type(&self) -> bool {
        let base = self
            .column_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();
        matches!(
            base.as_str(),
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT"
        )
    }
}

/// A declared index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    /// Create a non-unique index.
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
        }
    }

    /// Make the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A declared table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Table name.
    pub table_name: String,
    /// Columns, in declaration order.
    #[serde(default, rename = "columns")]
    pub properties: Vec<PropertyDefinition>,
    /// Named indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl EntityDefinition {
    /// Create an entity with no columns.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            properties: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column.
    pub fn property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    /// Add an index.
    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Find a column by name, ignoring case.
    pub fn find_property(&self, column_name: &str) -> Option<&PropertyDefinition> {
        self.properties
            .iter()
            .find(|p| p.column_name.eq_ignore_ascii_case(column_name))
    }
}

/// Anything that can describe the declared schema.
pub trait ModelSource: Send + Sync {
    /// The declared tables, in declaration order.
    fn entities(&self) -> &[EntityDefinition];
}

/// A declared model snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredModel {
    #[serde(default, rename = "entity")]
    entities: Vec<EntityDefinition>,
}

impl DeclaredModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity.
    pub fn entity(mut self, entity: EntityDefinition) -> Self {
        self.entities.push(entity);
        self
    }

    /// Parse a TOML snapshot. The snapshot is validated before it is returned.
    pub fn from_toml_str(content: &str) -> MigrateResult<Self> {
        let model: Self = toml::from_str(content).map_err(|e| {
            MigrationError::config(format!("Malformed model snapshot: {}", e))
        })?;
        validate_entities(&model.entities)?;
        Ok(model)
    }

    /// Load a TOML snapshot from disk.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }
}

impl ModelSource for DeclaredModel {
    fn entities(&self) -> &[EntityDefinition] {
        &self.entities
    }
}

/// Check a declared entity list for structural problems.
pub fn validate_entities(entities: &[EntityDefinition]) -> MigrateResult<()> {
    let mut tables = HashSet::new();

    for entity in entities {
        let table = entity.table_name.trim();
        if table.is_empty() {
            return Err(MigrationError::validation("Entity with empty table name"));
        }
        if !tables.insert(table.to_ascii_lowercase()) {
            return Err(MigrationError::validation(format!(
                "Table '{}' is declared more than once",
                table
            )));
        }

        let mut columns = HashSet::new();
        for property in &entity.properties {
            let column = property.column_name.trim();
            if column.is_empty() {
                return Err(MigrationError::validation(format!(
                    "Table '{}' has a column with an empty name",
                    table
                )));
            }
            if property.column_type.trim().is_empty() {
                return Err(MigrationError::validation(format!(
                    "Column '{}.{}' has no type",
                    table, column
                )));
            }
            if !columns.insert(column.to_ascii_lowercase()) {
                return Err(MigrationError::validation(format!(
                    "Column '{}.{}' is declared more than once",
                    table, column
                )));
            }
        }

        for index in &entity.indexes {
            if index.columns.is_empty() {
                return Err(MigrationError::validation(format!(
                    "Index '{}' on '{}' has no columns",
                    index.name, table
                )));
            }
            if let Some(missing) = index
                .columns
                .iter()
                .find(|c| !columns.contains(&c.trim().to_ascii_lowercase()))
            {
                return Err(MigrationError::validation(format!(
                    "Index '{}' references unknown column '{}.{}'",
                    index.name, table, missing
                )));
            }
        }
    }

    Ok(())
}
