//! In-memory stand-in for a SQL Server database.
//!
//! Understands the DDL the generator emits, the ledger statements and the
//! catalog queries, and keeps transactional snapshots so rollbacks restore
//! state. Clones share the same database.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use strata_migrate::{
    Connection, DeclaredModel, EntityDefinition, MigrateResult, MigrationError, PropertyDefinition,
    Row, SqlValue,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Created by `ADD CONSTRAINT ... UNIQUE` rather than `CREATE INDEX`.
    pub constraint: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: BTreeMap<String, Table>,
    ledger_table: Option<String>,
    ledger: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    data: Snapshot,
    saved: Option<Snapshot>,
    open: bool,
    opens: usize,
    closes: usize,
    statements: Vec<String>,
    commits: usize,
    rollbacks: usize,
    fail_on: Option<String>,
    cancel_on: Option<(String, CancellationToken)>,
    fail_open: bool,
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Fail any statement containing `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.state().fail_on = Some(fragment.to_string());
    }

    /// Cancel `token` while executing any statement containing `fragment`.
    pub fn cancel_on(&self, fragment: &str, token: &CancellationToken) {
        self.state().cancel_on = Some((fragment.to_string(), token.clone()));
    }

    pub fn clear_failure(&self) {
        self.state().fail_on = None;
    }

    /// Refuse to open.
    pub fn fail_open(&self) {
        self.state().fail_open = true;
    }

    /// Mark the connection open without going through [`Connection::open`].
    pub fn force_open(&self) {
        self.state().open = true;
    }

    pub fn opened(&self) -> bool {
        self.state().open
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.state().rollbacks
    }

    /// Every schema statement attempted, including rolled back ones.
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    /// Names of user tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.state()
            .data
            .tables
            .values()
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.state().data.tables.get(&key(name)).cloned()
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.table(table)
            .map(|t| t.columns.into_iter().map(|c| c.name).collect())
            .unwrap_or_default()
    }

    /// Create a table directly, bypassing transactions.
    pub fn create_table(&self, table: Table) {
        self.state().data.tables.insert(key(&table.name), table);
    }

    pub fn has_ledger(&self) -> bool {
        self.state().data.ledger_table.is_some()
    }

    /// Ledger ids in insertion order.
    pub fn ledger_ids(&self) -> Vec<String> {
        self.state()
            .data
            .ledger
            .iter()
            .filter_map(|row| row[0].as_str().map(String::from))
            .collect()
    }

    /// Insert a ledger row directly, creating the ledger if needed.
    pub fn insert_ledger_row(
        &self,
        id: &str,
        applied_at: DateTime<Utc>,
        checksum: Option<&str>,
    ) {
        let mut state = self.state();
        if state.data.ledger_table.is_none() {
            state.data.ledger_table = Some("__migration_history".to_string());
        }
        state.data.ledger.push(vec![
            SqlValue::from(id),
            SqlValue::from(id),
            SqlValue::from(applied_at),
            SqlValue::from("seed"),
            SqlValue::Int(0),
            SqlValue::from(checksum.map(String::from)),
        ]);
    }
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn db_error(msg: impl Into<String>) -> MigrationError {
    MigrationError::database(msg)
}

/// Split `[name]rest` at the first bracketed identifier.
fn next_ident(sql: &str) -> Option<(String, &str)> {
    let start = sql.find('[')?;
    let mut name = String::new();
    let mut chars = sql[start + 1..].char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == ']' {
            if matches!(chars.peek(), Some((_, ']'))) {
                chars.next();
                name.push(']');
            } else {
                return Some((name, &sql[start + 1 + i + 1..]));
            }
        } else {
            name.push(c);
        }
    }
    None
}

fn idents(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = sql;
    while let Some((name, tail)) = next_ident(rest) {
        out.push(name);
        rest = tail;
    }
    out
}

/// `[name] TYPE [NOT NULL] ...` into a column.
fn parse_column(def: &str) -> MigrateResult<Column> {
    let (name, rest) = next_ident(def).ok_or_else(|| db_error(format!("bad column: {}", def)))?;
    let data_type = rest
        .split_whitespace()
        .next()
        .map(|t| t.trim_end_matches([',', ';']).to_string())
        .ok_or_else(|| db_error(format!("missing type: {}", def)))?;
    Ok(Column {
        name,
        data_type,
        nullable: !rest.contains("NOT NULL"),
    })
}

impl State {
    fn table_mut(&mut self, name: &str) -> MigrateResult<&mut Table> {
        self.data
            .tables
            .get_mut(&key(name))
            .ok_or_else(|| db_error(format!("Invalid object name '{}'", name)))
    }

    fn run_ddl(&mut self, sql: &str) -> MigrateResult<u64> {
        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();
        let names = idents(trimmed);
        let name = |i: usize| {
            names
                .get(i)
                .cloned()
                .ok_or_else(|| db_error(format!("Incorrect syntax: {}", trimmed)))
        };

        if upper.starts_with("CREATE TABLE") {
            let table = name(0)?;
            if self.data.tables.contains_key(&key(&table)) {
                return Err(db_error(format!(
                    "There is already an object named '{}' in the database",
                    table
                )));
            }
            let open = trimmed.find('(').ok_or_else(|| db_error("missing column list"))?;
            let close = trimmed.rfind(')').ok_or_else(|| db_error("missing column list"))?;
            let columns = trimmed[open + 1..close]
                .split(",\n")
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(parse_column)
                .collect::<MigrateResult<Vec<_>>>()?;
            self.data.tables.insert(
                key(&table),
                Table {
                    name: table,
                    columns,
                    indexes: Vec::new(),
                },
            );
        } else if upper.starts_with("DROP TABLE") {
            let table = name(0)?;
            let existed = self.data.tables.remove(&key(&table)).is_some();
            if !existed && !upper.starts_with("DROP TABLE IF EXISTS") {
                return Err(db_error(format!("Cannot drop the table '{}'", table)));
            }
        } else if upper.starts_with("ALTER TABLE") && upper.contains("] DROP COLUMN") {
            let (table, column) = (name(0)?, name(1)?);
            let t = self.table_mut(&table)?;
            let before = t.columns.len();
            t.columns.retain(|c| !c.name.eq_ignore_ascii_case(&column));
            if t.columns.len() == before && !upper.contains("DROP COLUMN IF EXISTS") {
                return Err(db_error(format!("Invalid column name '{}'", column)));
            }
        } else if upper.starts_with("ALTER TABLE") && upper.contains("] ADD CONSTRAINT") {
            let (table, constraint) = (name(0)?, name(1)?);
            let is_unique = upper.contains("] UNIQUE");
            let t = self.table_mut(&table)?;
            if is_unique {
                t.indexes.push(Index {
                    name: constraint,
                    columns: names[2..].to_vec(),
                    unique: true,
                    constraint: true,
                });
            }
        } else if upper.starts_with("ALTER TABLE") && upper.contains("] ADD ") {
            let table = name(0)?;
            let (_, rest) = next_ident(trimmed).ok_or_else(|| db_error("bad ALTER"))?;
            let def = rest.trim_start().trim_start_matches("ADD").trim();
            let column = parse_column(def)?;
            let t = self.table_mut(&table)?;
            if t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(&column.name)) {
                return Err(db_error(format!("Column '{}' already exists", column.name)));
            }
            t.columns.push(column);
        } else if upper.starts_with("ALTER TABLE") && upper.contains("] ALTER COLUMN") {
            let table = name(0)?;
            let (_, rest) = next_ident(trimmed).ok_or_else(|| db_error("bad ALTER"))?;
            let def = rest.trim_start().trim_start_matches("ALTER COLUMN").trim();
            let altered = parse_column(def)?;
            let t = self.table_mut(&table)?;
            let column = t
                .columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(&altered.name))
                .ok_or_else(|| db_error(format!("Invalid column name '{}'", altered.name)))?;
            *column = altered;
        } else if upper.starts_with("ALTER TABLE") && upper.contains("] DROP CONSTRAINT") {
            let (table, constraint) = (name(0)?, name(1)?);
            let t = self.table_mut(&table)?;
            t.indexes
                .retain(|i| !(i.constraint && i.name.eq_ignore_ascii_case(&constraint)));
        } else if upper.starts_with("CREATE UNIQUE INDEX") || upper.starts_with("CREATE INDEX") {
            let (index, table) = (name(0)?, name(1)?);
            let columns = names[2..].to_vec();
            let t = self.table_mut(&table)?;
            t.indexes.push(Index {
                name: index,
                columns,
                unique: upper.starts_with("CREATE UNIQUE"),
                constraint: false,
            });
        } else if upper.starts_with("DROP INDEX") {
            let (index, table) = (name(0)?, name(1)?);
            let t = self.table_mut(&table)?;
            if t
                .indexes
                .iter()
                .any(|i| i.constraint && i.name.eq_ignore_ascii_case(&index))
            {
                return Err(db_error(format!(
                    "An explicit DROP INDEX is not allowed on index '{}.{}'",
                    table, index
                )));
            }
            t.indexes.retain(|i| !i.name.eq_ignore_ascii_case(&index));
        }
        Ok(0)
    }

    fn ledger_name(&self) -> MigrateResult<&str> {
        self.data
            .ledger_table
            .as_deref()
            .ok_or_else(|| db_error("Invalid object name: migration history"))
    }

    fn run_ledger(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        if sql.starts_with("IF OBJECT_ID(N'") {
            let name = sql["IF OBJECT_ID(N'".len()..]
                .split('\'')
                .next()
                .unwrap_or_default()
                .to_string();
            if self.data.ledger_table.is_none() {
                self.data.ledger_table = Some(name);
            }
            return Ok(0);
        }

        self.ledger_name()?;
        if sql.starts_with("INSERT INTO") {
            if params.len() != 6 {
                return Err(db_error("ledger insert expects 6 parameters"));
            }
            if self.data.ledger.iter().any(|row| row[0] == params[0]) {
                return Err(db_error("Violation of PRIMARY KEY constraint"));
            }
            self.data.ledger.push(params.to_vec());
            return Ok(1);
        }

        let id = params.first().ok_or_else(|| db_error("missing @P1"))?;
        let before = self.data.ledger.len();
        self.data.ledger.retain(|row| &row[0] != id);
        Ok((before - self.data.ledger.len()) as u64)
    }

    fn is_ledger_statement(&self, sql: &str) -> bool {
        if sql.starts_with("IF OBJECT_ID(") {
            return true;
        }
        match &self.data.ledger_table {
            Some(table) => {
                let quoted = format!("[{}]", table);
                (sql.starts_with("INSERT INTO ") || sql.starts_with("DELETE FROM "))
                    && sql.contains(&quoted)
            }
            None => false,
        }
    }

    fn catalog_tables(&self) -> Vec<Row> {
        let mut names: Vec<String> = self.data.tables.values().map(|t| t.name.clone()).collect();
        if let Some(ledger) = &self.data.ledger_table {
            names.push(ledger.clone());
        }
        names.sort();
        names.into_iter().map(|n| vec![SqlValue::from(n)]).collect()
    }

    fn catalog_columns(&self, table: &str) -> Vec<Row> {
        let Some(t) = self.data.tables.get(&key(table)) else {
            return Vec::new();
        };
        t.columns
            .iter()
            .map(|c| {
                let (base, args) = match c.data_type.split_once('(') {
                    Some((base, args)) => {
                        (base.to_string(), args.trim_end_matches(')').to_string())
                    }
                    None => (c.data_type.clone(), String::new()),
                };
                let upper = base.to_ascii_uppercase();
                let (mut length, mut precision, mut scale, mut fraction) =
                    (SqlValue::Null, SqlValue::Null, SqlValue::Null, SqlValue::Null);
                // The server reports its default arguments for bare types.
                match upper.as_str() {
                    "DECIMAL" | "NUMERIC" => {
                        let mut parts = args.split(',').map(|p| p.trim().parse::<i64>().ok());
                        precision = SqlValue::Int(parts.next().flatten().unwrap_or(18));
                        scale = SqlValue::Int(parts.next().flatten().unwrap_or(0));
                    }
                    "CHAR" | "NCHAR" | "VARCHAR" | "NVARCHAR" | "BINARY" | "VARBINARY" => {
                        length = if args.eq_ignore_ascii_case("MAX") {
                            SqlValue::Int(-1)
                        } else {
                            SqlValue::Int(args.trim().parse().unwrap_or(1))
                        };
                    }
                    "DATETIME2" | "TIME" | "DATETIMEOFFSET" => {
                        fraction = SqlValue::Int(args.trim().parse().unwrap_or(7));
                    }
                    "DATETIME" => fraction = SqlValue::Int(3),
                    "INT" => precision = SqlValue::Int(10),
                    _ => {}
                }
                vec![
                    SqlValue::from(c.name.clone()),
                    SqlValue::from(base.to_ascii_lowercase()),
                    length,
                    precision,
                    scale,
                    fraction,
                    SqlValue::from(if c.nullable { "YES" } else { "NO" }),
                ]
            })
            .collect()
    }

    fn catalog_indexes(&self, object: &str) -> Vec<Row> {
        let Some(table) = idents(object).pop() else {
            return Vec::new();
        };
        let Some(t) = self.data.tables.get(&key(&table)) else {
            return Vec::new();
        };
        let mut indexes = t.indexes.clone();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        indexes
            .iter()
            .flat_map(|i| {
                i.columns.iter().map(move |c| {
                    vec![
                        SqlValue::from(i.name.clone()),
                        SqlValue::from(c.clone()),
                        SqlValue::Int(i64::from(i.unique)),
                        SqlValue::Int(0),
                        SqlValue::Int(i64::from(i.constraint)),
                    ]
                })
            })
            .collect()
    }
}

#[async_trait]
impl Connection for MemoryDatabase {
    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn open(&mut self) -> MigrateResult<()> {
        let mut state = self.state();
        if state.fail_open {
            return Err(db_error("Login failed"));
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    async fn close(&mut self) -> MigrateResult<()> {
        let mut state = self.state();
        state.open = false;
        state.closes += 1;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        let mut state = self.state();
        if !state.open {
            return Err(db_error("Connection is closed"));
        }
        let sql = sql.trim();
        if state.is_ledger_statement(sql) {
            return state.run_ledger(sql, params);
        }

        state.statements.push(sql.to_string());
        if let Some((fragment, token)) = &state.cancel_on
            && sql.contains(fragment.as_str())
        {
            token.cancel();
        }
        if let Some(fragment) = &state.fail_on
            && sql.contains(fragment.as_str())
        {
            return Err(db_error(format!("Statement failed: {}", sql)));
        }
        state.run_ddl(sql)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>> {
        let state = self.state();
        if !state.open {
            return Err(db_error("Connection is closed"));
        }
        let text = |i: usize| params.get(i).and_then(SqlValue::as_str).unwrap_or_default();

        if sql.contains("INFORMATION_SCHEMA.TABLES") {
            Ok(state.catalog_tables())
        } else if sql.contains("INFORMATION_SCHEMA.COLUMNS") {
            Ok(state.catalog_columns(text(1)))
        } else if sql.contains("sys.indexes") {
            Ok(state.catalog_indexes(text(0)))
        } else if sql.starts_with("SELECT [migration_id]") {
            state.ledger_name()?;
            Ok(state.data.ledger.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn begin(&mut self) -> MigrateResult<()> {
        let mut state = self.state();
        if state.saved.is_some() {
            return Err(db_error("Transaction already in progress"));
        }
        state.saved = Some(state.data.clone());
        Ok(())
    }

    async fn commit(&mut self) -> MigrateResult<()> {
        let mut state = self.state();
        state
            .saved
            .take()
            .ok_or_else(|| db_error("No transaction in progress"))?;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> MigrateResult<()> {
        let mut state = self.state();
        let saved = state
            .saved
            .take()
            .ok_or_else(|| db_error("No transaction in progress"))?;
        state.data = saved;
        state.rollbacks += 1;
        Ok(())
    }
}

/// `orders(id INT PK, total DECIMAL(18,2))`.
pub fn orders_model() -> DeclaredModel {
    DeclaredModel::new().entity(
        EntityDefinition::new("orders")
            .property(PropertyDefinition::new("id", "INT").primary_key().auto_increment())
            .property(PropertyDefinition::new("total", "DECIMAL(18,2)")),
    )
}

/// Install a test subscriber once so `tracing` output shows up on failure.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
