//! Live catalog introspection.
//!
//! The differ reads the live schema only through [`CatalogReader`], so it can
//! be driven by an in-memory fake in tests. [`InformationSchemaCatalog`] is
//! the implementation used against a real database connection.

use async_trait::async_trait;

use crate::connection::{Connection, SqlValue, opt_int_at, opt_text_at, text_at};
use crate::error::MigrateResult;

/// A live column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Full type (e.g. `NVARCHAR(100)`), when the reader knows it.
    pub data_type: Option<String>,
    /// Whether the column is nullable, when the reader knows it.
    pub is_nullable: Option<bool>,
}

impl ColumnInfo {
    /// A column known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
            is_nullable: None,
        }
    }

    /// A column with full type information.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type.into()),
            is_nullable: Some(is_nullable),
        }
    }
}

/// A live index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns, in key order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub is_unique: bool,
    /// Whether the index backs the primary key.
    pub is_primary: bool,
    /// Whether the index enforces a `UNIQUE` constraint.
    pub is_unique_constraint: bool,
}

impl IndexInfo {
    /// Whether the index is owned by a constraint rather than declared on its own.
    pub fn is_constraint_backed(&self) -> bool {
        self.is_primary || self.is_unique_constraint
    }

    /// Render the index as a difference value: comma separated columns,
    /// prefixed with `U:` when unique.
    pub fn definition(&self) -> String {
        index_definition(&self.columns, self.is_unique)
    }
}

/// Render an index column list the way differences carry it.
pub(crate) fn index_definition(columns: &[String], unique: bool) -> String {
    let cols = columns.join(",");
    if unique { format!("U:{}", cols) } else { cols }
}

/// Read-only access to the live schema.
#[async_trait]
pub trait CatalogReader: Send {
    /// Names of all user tables.
    async fn table_names(&mut self) -> MigrateResult<Vec<String>>;

    /// Columns of a table, in ordinal order.
    async fn columns(&mut self, table: &str) -> MigrateResult<Vec<ColumnInfo>>;

    /// Named indexes of a table.
    async fn indexes(&mut self, table: &str) -> MigrateResult<Vec<IndexInfo>>;
}

const TABLES_SQL: &str = "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @P1 ORDER BY TABLE_NAME";

const COLUMNS_SQL: &str = "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_MAXIMUM_LENGTH, \
     NUMERIC_PRECISION, NUMERIC_SCALE, DATETIME_PRECISION, IS_NULLABLE \
     FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION";

const INDEXES_SQL: &str = "SELECT i.name, c.name, CAST(i.is_unique AS INT), \
     CAST(i.is_primary_key AS INT), CAST(i.is_unique_constraint AS INT) \
     FROM sys.indexes i \
     JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
     JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
     WHERE i.object_id = OBJECT_ID(@P1) AND i.name IS NOT NULL \
     ORDER BY i.name, ic.key_ordinal";

/// Catalog reader backed by `INFORMATION_SCHEMA` and `sys.indexes`.
pub struct InformationSchemaCatalog<'c> {
    conn: &'c mut dyn Connection,
    schema: String,
}

impl<'c> InformationSchemaCatalog<'c> {
    /// Read the `dbo` schema over the given connection.
    pub fn new(conn: &'c mut dyn Connection) -> Self {
        Self {
            conn,
            schema: "dbo".to_string(),
        }
    }

    /// Read a different database schema.
    pub fn database_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

#[async_trait]
impl CatalogReader for InformationSchemaCatalog<'_> {
    async fn table_names(&mut self) -> MigrateResult<Vec<String>> {
        let rows = self
            .conn
            .query(TABLES_SQL, &[SqlValue::from(self.schema.as_str())])
            .await?;
        rows.iter().map(|row| text_at(row, 0)).collect()
    }

    async fn columns(&mut self, table: &str) -> MigrateResult<Vec<ColumnInfo>> {
        let params = [SqlValue::from(self.schema.as_str()), SqlValue::from(table)];
        let rows = self.conn.query(COLUMNS_SQL, &params).await?;

        rows.iter()
            .map(|row| {
                let name = text_at(row, 0)?;
                let data_type = render_type(
                    &text_at(row, 1)?,
                    opt_int_at(row, 2)?,
                    opt_int_at(row, 3)?,
                    opt_int_at(row, 4)?,
                    opt_int_at(row, 5)?,
                );
                let nullable = opt_text_at(row, 6)?
                    .is_some_and(|v| v.eq_ignore_ascii_case("YES"));
                Ok(ColumnInfo::new(name, data_type, nullable))
            })
            .collect()
    }

    async fn indexes(&mut self, table: &str) -> MigrateResult<Vec<IndexInfo>> {
        let object = format!("[{}].[{}]", self.schema, table);
        let rows = self.conn.query(INDEXES_SQL, &[SqlValue::from(object)]).await?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &rows {
            let name = text_at(row, 0)?;
            let column = text_at(row, 1)?;
            match indexes.last_mut() {
                Some(last) if last.name == name => last.columns.push(column),
                _ => indexes.push(IndexInfo {
                    name,
                    columns: vec![column],
                    is_unique: opt_int_at(row, 2)?.unwrap_or(0) != 0,
                    is_primary: opt_int_at(row, 3)?.unwrap_or(0) != 0,
                    is_unique_constraint: opt_int_at(row, 4)?.unwrap_or(0) != 0,
                }),
            }
        }

        Ok(indexes)
    }
}

/// Rebuild a declared-style type string from `INFORMATION_SCHEMA` parts.
fn render_type(
    data_type: &str,
    max_length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i64>,
    datetime_precision: Option<i64>,
) -> String {
    let base = data_type.to_ascii_uppercase();
    match base.as_str() {
        "DECIMAL" | "NUMERIC" => match (precision, scale) {
            (Some(p), Some(s)) => format!("{}({},{})", base, p, s),
            _ => base,
        },
        "CHAR" | "NCHAR" | "VARCHAR" | "NVARCHAR" | "BINARY" | "VARBINARY" => match max_length {
            Some(-1) => format!("{}(MAX)", base),
            Some(len) => format!("{}({})", base, len),
            None => base,
        },
        "DATETIME2" | "TIME" | "DATETIMEOFFSET" => match datetime_precision {
            Some(p) => format!("{}({})", base, p),
            None => base,
        },
        _ => base,
    }
}
