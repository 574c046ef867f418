//! Schema catalog: migrations for the fixed tables and a store-independent
//! view of a backing table's ordered columns.

use rusqlite::{Connection, OptionalExtension, params};

/// Row-number column present in every backing table.
pub const ROW_NUMBER_COLUMN: &str = "line_number";

/// Applied in order; `PRAGMA user_version` records how many have run.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dataset (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name VARCHAR(50) NOT NULL,
        authors VARCHAR(50) NOT NULL
    );",
    "ALTER TABLE dataset ADD COLUMN status TEXT NOT NULL DEFAULT 'pending';",
    "CREATE TABLE IF NOT EXISTS dataset_field (
        dataset_id INTEGER NOT NULL REFERENCES dataset(id),
        column_name TEXT NOT NULL COLLATE NOCASE,
        column_type TEXT NOT NULL,
        user_defined INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (dataset_id, column_name)
    );",
];

/// Runs pending migrations in one transaction. Returns how many were applied.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<usize> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let current = usize::try_from(current).unwrap_or(0);
    if current >= MIGRATIONS.len() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        tracing::info!(version = idx + 1, "applying catalog migration");
        tx.execute_batch(sql)?;
    }
    tx.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
    tx.commit()?;
    Ok(MIGRATIONS.len() - current)
}

/// Double-quotes an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quotes a string literal for interpolation into SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared type exactly as stored; `None` when the column has none.
    pub declared_type: Option<String>,
    pub ordinal: usize,
}

/// Ordered column set of one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    /// Reads the column list in storage order; `None` if the table is missing.
    pub fn load(conn: &Connection, table: &str) -> rusqlite::Result<Option<Self>> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut stmt =
            conn.prepare("SELECT cid, name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map(params![table], |row| {
                let ordinal: i64 = row.get(0)?;
                let declared: String = row.get(2)?;
                Ok(ColumnDescriptor {
                    name: row.get(1)?,
                    declared_type: (!declared.is_empty()).then_some(declared),
                    ordinal: ordinal as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(Self {
            table: table.to_string(),
            columns,
        }))
    }

    /// Case-insensitive, like SQLite identifiers.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn declared_type(&self, name: &str) -> Option<&str> {
        self.column(name)
            .and_then(|column| column.declared_type.as_deref())
    }
}
