//! SQL generation for migrations.
//!
//! Differences are grouped per table (in order of first appearance) and
//! rendered as one labelled section per table. Within a section, table-level
//! operations come first, then column changes, then indexes and constraints.
//! The down script walks the same groups and entries in reverse and inverts
//! each one. Steps that cannot be inverted from the difference alone are
//! emitted as [`MANUAL_INTERVENTION_MARKER`] comments, which execute nothing.

use crate::diff::{DifferenceKind, SchemaDifference};
use crate::model::PropertyDefinition;
use crate::script::DEFAULT_BATCH_SEPARATOR;

/// Prefix of every comment emitted for a step that needs a human.
pub const MANUAL_INTERVENTION_MARKER: &str = "-- MANUAL INTERVENTION REQUIRED";

/// Generated migration scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSql {
    /// Forward script.
    pub up: String,
    /// Reverse script.
    pub down: String,
}

impl MigrationSql {
    /// Check if there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.up.trim().is_empty() && self.down.trim().is_empty()
    }
}

/// Quote an identifier with brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// A rendered step: either an executable statement or a manual marker.
enum Step {
    Statement(String),
    Manual(String),
}

/// SQL generator for the target dialect.
#[derive(Debug, Clone)]
pub struct SqlGenerator {
    separator: String,
}

impl Default for SqlGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SEPARATOR)
    }
}

impl SqlGenerator {
    /// Create a generator that ends every statement with `separator`.
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    /// Generate up and down scripts for a difference set.
    pub fn generate(&self, diffs: &[SchemaDifference]) -> MigrationSql {
        let groups = group_by_table(diffs);

        let up: Vec<String> = groups
            .iter()
            .map(|(table, entries)| self.section(table, self.up_steps(entries)))
            .collect();

        let down: Vec<String> = groups
            .iter()
            .rev()
            .map(|(table, entries)| self.section(table, self.down_steps(entries)))
            .collect();

        MigrationSql {
            up: up.join("\n"),
            down: down.join("\n"),
        }
    }

    fn section(&self, table: &str, steps: Vec<Step>) -> String {
        let mut out = format!("-- Table: {}\n", table);
        for step in steps {
            match step {
                Step::Statement(sql) => {
                    out.push_str(&sql);
                    out.push('\n');
                    out.push_str(&self.separator);
                    out.push('\n');
                }
                Step::Manual(note) => {
                    out.push_str(MANUAL_INTERVENTION_MARKER);
                    out.push_str(": ");
                    out.push_str(&note);
                    out.push('\n');
                }
            }
        }
        out
    }

    fn up_steps(&self, entries: &[&SchemaDifference]) -> Vec<Step> {
        let creates = entries.iter().any(|d| d.kind == DifferenceKind::TableAdded);
        let drops = entries.iter().any(|d| d.kind == DifferenceKind::TableRemoved);

        let mut steps = Vec::new();
        for diff in entries {
            let table = diff.entity_name.as_str();
            match diff.kind {
                DifferenceKind::TableAdded => {
                    let columns: Vec<&SchemaDifference> = entries
                        .iter()
                        .copied()
                        .filter(|d| d.kind == DifferenceKind::ColumnAdded)
                        .collect();
                    steps.push(self.create_table(table, &columns));
                }
                DifferenceKind::TableRemoved => {
                    steps.push(Step::Statement(drop_table(table)));
                }
                // Dropped tables take their columns and indexes with them.
                _ if drops => {}
                DifferenceKind::ColumnAdded if creates => {}
                DifferenceKind::TableRenamed => {
                    steps.push(rename_table(diff.old_value.as_deref(), table));
                }
                DifferenceKind::ColumnAdded => {
                    steps.push(match column_definition_of(diff) {
                        Some(def) => Step::Statement(format!(
                            "ALTER TABLE {} ADD {};",
                            quote_ident(table),
                            def
                        )),
                        None => Step::Manual(format!(
                            "column {}.{} has no definition to add",
                            quote_ident(table),
                            quote_ident(property(diff))
                        )),
                    });
                }
                DifferenceKind::ColumnRemoved => {
                    steps.push(Step::Statement(format!(
                        "ALTER TABLE {} DROP COLUMN {};",
                        quote_ident(table),
                        quote_ident(property(diff))
                    )));
                }
                DifferenceKind::ColumnRenamed => {
                    steps.push(rename_column(
                        table,
                        diff.old_value.as_deref(),
                        diff.new_value.as_deref().unwrap_or(property(diff)),
                    ));
                }
                DifferenceKind::ColumnTypeChanged => {
                    steps.push(alter_column(table, property(diff), diff.new_value.as_deref()));
                }
                DifferenceKind::ColumnNullabilityChanged => {
                    let definition = nullability_definition(diff, diff.new_value.as_deref());
                    steps.push(alter_column(table, property(diff), definition.as_deref()));
                }
                DifferenceKind::IndexAdded => {
                    steps.push(create_index(table, property(diff), diff.new_value.as_deref()));
                }
                DifferenceKind::IndexRemoved => {
                    steps.push(Step::Statement(drop_index(table, property(diff))));
                }
                DifferenceKind::ForeignKeyAdded | DifferenceKind::UniqueConstraintAdded => {
                    steps.push(add_constraint(table, property(diff), diff.new_value.as_deref()));
                }
                DifferenceKind::ForeignKeyRemoved | DifferenceKind::UniqueConstraintRemoved => {
                    steps.push(Step::Statement(drop_constraint(table, property(diff))));
                }
            }
        }
        steps
    }

    fn down_steps(&self, entries: &[&SchemaDifference]) -> Vec<Step> {
        if let Some(created) = entries.iter().find(|d| d.kind == DifferenceKind::TableAdded) {
            return vec![Step::Statement(drop_table(&created.entity_name))];
        }
        if let Some(dropped) = entries.iter().find(|d| d.kind == DifferenceKind::TableRemoved) {
            return vec![Step::Manual(format!(
                "table {} was dropped and cannot be recreated automatically",
                quote_ident(&dropped.entity_name)
            ))];
        }

        let mut steps = Vec::new();
        for diff in entries.iter().rev() {
            let table = diff.entity_name.as_str();
            match diff.kind {
                DifferenceKind::TableAdded | DifferenceKind::TableRemoved => {}
                DifferenceKind::TableRenamed => match diff.old_value.as_deref() {
                    Some(old) => steps.push(rename_table(Some(table), old)),
                    None => steps.push(Step::Manual(format!(
                        "table {} was renamed from an unknown name",
                        quote_ident(table)
                    ))),
                },
                DifferenceKind::ColumnAdded => {
                    steps.push(Step::Statement(format!(
                        "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
                        quote_ident(table),
                        quote_ident(property(diff))
                    )));
                }
                DifferenceKind::ColumnRemoved => {
                    let was = diff
                        .old_value
                        .as_deref()
                        .map(|t| format!(" (was {})", t))
                        .unwrap_or_default();
                    steps.push(Step::Manual(format!(
                        "column {}.{}{} was dropped and cannot be recreated automatically",
                        quote_ident(table),
                        quote_ident(property(diff)),
                        was
                    )));
                }
                DifferenceKind::ColumnRenamed => {
                    let new = diff.new_value.as_deref().unwrap_or(property(diff));
                    match diff.old_value.as_deref() {
                        Some(old) => steps.push(rename_column(table, Some(new), old)),
                        None => steps.push(Step::Manual(format!(
                            "column {}.{} was renamed from an unknown name",
                            quote_ident(table),
                            quote_ident(new)
                        ))),
                    }
                }
                DifferenceKind::ColumnTypeChanged => {
                    steps.push(alter_column(table, property(diff), diff.old_value.as_deref()));
                }
                DifferenceKind::ColumnNullabilityChanged => {
                    let definition = nullability_definition(diff, diff.old_value.as_deref());
                    steps.push(alter_column(table, property(diff), definition.as_deref()));
                }
                DifferenceKind::IndexAdded => {
                    steps.push(Step::Statement(drop_index(table, property(diff))));
                }
                DifferenceKind::IndexRemoved => {
                    steps.push(create_index(table, property(diff), diff.old_value.as_deref()));
                }
                DifferenceKind::ForeignKeyAdded | DifferenceKind::UniqueConstraintAdded => {
                    steps.push(Step::Statement(drop_constraint(table, property(diff))));
                }
                DifferenceKind::ForeignKeyRemoved | DifferenceKind::UniqueConstraintRemoved => {
                    steps.push(add_constraint(table, property(diff), diff.old_value.as_deref()));
                }
            }
        }
        steps
    }

    fn create_table(&self, table: &str, columns: &[&SchemaDifference]) -> Step {
        let definitions: Vec<String> = columns
            .iter()
            .copied()
            .filter_map(column_definition_of)
            .collect();

        if definitions.is_empty() {
            return Step::Manual(format!(
                "table {} has no column definitions",
                quote_ident(table)
            ));
        }

        Step::Statement(format!(
            "CREATE TABLE {} (\n    {}\n);",
            quote_ident(table),
            definitions.join(",\n    ")
        ))
    }
}

/// Group differences by table, ignoring case, in order of first appearance.
/// Entries are stably ordered table-level first, then columns, then the rest.
fn group_by_table(diffs: &[SchemaDifference]) -> Vec<(String, Vec<&SchemaDifference>)> {
    let mut groups: Vec<(String, Vec<&SchemaDifference>)> = Vec::new();

    for diff in diffs {
        match groups
            .iter_mut()
            .find(|(table, _)| table.eq_ignore_ascii_case(&diff.entity_name))
        {
            Some((_, entries)) => entries.push(diff),
            None => groups.push((diff.entity_name.clone(), vec![diff])),
        }
    }

    for (_, entries) in &mut groups {
        entries.sort_by_key(|d| rank(d.kind));
    }

    groups
}

fn rank(kind: DifferenceKind) -> u8 {
    match kind {
        DifferenceKind::TableAdded
        | DifferenceKind::TableRemoved
        | DifferenceKind::TableRenamed => 0,
        DifferenceKind::ColumnAdded
        | DifferenceKind::ColumnRemoved
        | DifferenceKind::ColumnRenamed
        | DifferenceKind::ColumnTypeChanged
        | DifferenceKind::ColumnNullabilityChanged => 1,
        DifferenceKind::IndexAdded
        | DifferenceKind::IndexRemoved
        | DifferenceKind::ForeignKeyAdded
        | DifferenceKind::ForeignKeyRemoved
        | DifferenceKind::UniqueConstraintAdded
        | DifferenceKind::UniqueConstraintRemoved => 2,
    }
}

fn property(diff: &SchemaDifference) -> &str {
    diff.property_name.as_deref().unwrap_or_default()
}

/// Render the column definition carried by a difference.
fn column_definition_of(diff: &SchemaDifference) -> Option<String> {
    match &diff.column {
        Some(column) => Some(column_definition(column)),
        None => diff
            .new_value
            .as_deref()
            .map(|sql_type| format!("{} {}", quote_ident(property(diff)), sql_type)),
    }
}

/// Generate a column definition.
pub fn column_definition(column: &PropertyDefinition) -> String {
    let mut parts = vec![quote_ident(&column.column_name), column.column_type.clone()];

    if !column.nullable {
        parts.push("NOT NULL".to_string());
    }

    if let Some(default) = &column.default_value {
        parts.push(format!("DEFAULT {}", default));
    }

    if column.is_primary_key {
        parts.push("PRIMARY KEY".to_string());
    }

    if column.is_auto_increment && column.is_integer_type() {
        parts.push("IDENTITY(1,1)".to_string());
    }

    parts.join(" ")
}

/// `TYPE NULL|NOT NULL` for a nullability change, using the declared type.
fn nullability_definition(diff: &SchemaDifference, keyword: Option<&str>) -> Option<String> {
    let column = diff.column.as_ref()?;
    keyword.map(|k| format!("{} {}", column.column_type, k))
}

fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {};", quote_ident(table))
}

fn rename_table(old: Option<&str>, new: &str) -> Step {
    match old {
        Some(old) => Step::Statement(format!(
            "EXEC sp_rename {}, {};",
            quote_literal(old),
            quote_literal(new)
        )),
        None => Step::Manual(format!(
            "table {} was renamed from an unknown name",
            quote_ident(new)
        )),
    }
}

fn rename_column(table: &str, old: Option<&str>, new: &str) -> Step {
    match old {
        Some(old) => Step::Statement(format!(
            "EXEC sp_rename {}, {}, N'COLUMN';",
            quote_literal(&format!("{}.{}", table, old)),
            quote_literal(new)
        )),
        None => Step::Manual(format!(
            "column {}.{} was renamed from an unknown name",
            quote_ident(table),
            quote_ident(new)
        )),
    }
}

fn alter_column(table: &str, column: &str, definition: Option<&str>) -> Step {
    match definition {
        Some(def) => Step::Statement(format!(
            "ALTER TABLE {} ALTER COLUMN {} {};",
            quote_ident(table),
            quote_ident(column),
            def
        )),
        None => Step::Manual(format!(
            "previous definition of column {}.{} is unknown",
            quote_ident(table),
            quote_ident(column)
        )),
    }
}

fn create_index(table: &str, name: &str, definition: Option<&str>) -> Step {
    let Some(definition) = definition else {
        return Step::Manual(format!(
            "definition of index {} on {} is unknown",
            quote_ident(name),
            quote_ident(table)
        ));
    };

    let (unique, columns) = match definition.strip_prefix("U:") {
        Some(rest) => ("UNIQUE ", rest),
        None => ("", definition),
    };
    let cols: Vec<String> = columns
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(quote_ident)
        .collect();

    Step::Statement(format!(
        "CREATE {}INDEX {} ON {} ({});",
        unique,
        quote_ident(name),
        quote_ident(table),
        cols.join(", ")
    ))
}

fn drop_index(table: &str, name: &str) -> String {
    format!(
        "DROP INDEX IF EXISTS {} ON {};",
        quote_ident(name),
        quote_ident(table)
    )
}

fn add_constraint(table: &str, name: &str, body: Option<&str>) -> Step {
    match body {
        Some(body) => Step::Statement(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {};",
            quote_ident(table),
            quote_ident(name),
            body
        )),
        None => Step::Manual(format!(
            "definition of constraint {} on {} is unknown",
            quote_ident(name),
            quote_ident(table)
        )),
    }
}

fn drop_constraint(table: &str, name: &str) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
        quote_ident(table),
        quote_ident(name)
    )
}
