//! Preset and config persistence for the Vielle firmware.
//!
//! Two tables: an ordered preset table and a key→JSON-blob config table.
//! Presets carry a dense 1-based `number` used for selection from MIDI
//! program changes; after every committed operation the numbers form the
//! exact set `{1..N}`.
//!
//! Each method opens a fresh connection with WAL mode so the store can be
//! used from the dispatcher, the HTTP handlers and tests without shared
//! connection state.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS preset (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL DEFAULT '',
    number INTEGER UNIQUE,
    data TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS config (
    name TEXT PRIMARY KEY,
    data TEXT NOT NULL DEFAULT '{}'
);
"#;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("preset {0} not found")]
    NotFound(i64),

    #[error("reorder expects {expected} ids, got {got}")]
    OrderMismatch { expected: usize, got: usize },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A persisted preset row. `number` is only null while a reorder is in
/// flight inside a transaction; committed rows always carry one.
#[derive(Debug, Clone)]
pub struct PresetRow {
    pub id: i64,
    pub name: String,
    pub number: Option<i64>,
    pub data: serde_json::Value,
}

/// Database with connection-per-call for concurrent access.
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open a file-based store, creating the schema if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = store.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    /// Create a temporary store file with a unique name, suitable for tests.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("vielle_{}_{}.db", std::process::id(), unique);
        Self::open(std::env::temp_dir().join(name))
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
        ",
        )?;
        Ok(conn)
    }

    // Presets

    /// Insert a new preset. With `number = None` the next free number
    /// (`max + 1`) is assigned inside the same transaction.
    pub fn insert_preset(
        &self,
        name: &str,
        number: Option<i64>,
        data: &serde_json::Value,
    ) -> Result<PresetRow> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let number = match number {
            Some(n) => n,
            None => {
                let highest: Option<i64> =
                    tx.query_row("SELECT MAX(number) FROM preset", [], |row| row.get(0))?;
                highest.unwrap_or(0) + 1
            }
        };
        tx.execute(
            "INSERT INTO preset (name, number, data) VALUES (?1, ?2, ?3)",
            params![name, number, data.to_string()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        self.get_preset(id)
    }

    /// Update name and data of an existing preset, keeping its number.
    pub fn update_preset(&self, id: i64, name: &str, data: &serde_json::Value) -> Result<PresetRow> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE preset SET name = ?1, data = ?2 WHERE id = ?3",
            params![name, data.to_string(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.get_preset(id)
    }

    pub fn get_preset(&self, id: i64) -> Result<PresetRow> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, number, data FROM preset WHERE id = ?1",
            params![id],
            row_to_preset,
        )
        .optional()?
        .ok_or(StoreError::NotFound(id))
    }

    pub fn get_preset_by_number(&self, number: i64) -> Result<Option<PresetRow>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, name, number, data FROM preset WHERE number = ?1",
                params![number],
                row_to_preset,
            )
            .optional()?)
    }

    /// All presets in number order.
    pub fn list_presets(&self) -> Result<Vec<PresetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, number, data FROM preset ORDER BY number")?;
        let rows = stmt.query_map([], row_to_preset)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn first_preset(&self) -> Result<Option<PresetRow>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, name, number, data FROM preset ORDER BY number LIMIT 1",
                [],
                row_to_preset,
            )
            .optional()?)
    }

    pub fn last_preset(&self) -> Result<Option<PresetRow>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, name, number, data FROM preset ORDER BY number DESC LIMIT 1",
                [],
                row_to_preset,
            )
            .optional()?)
    }

    /// Delete a preset, then renumber the survivors into `1..N` keeping
    /// their previous relative order. One transaction.
    pub fn delete_preset(&self, id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM preset WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        let survivors = ordered_ids(&tx)?;
        renumber(&tx, &survivors)?;
        tx.commit()?;
        Ok(())
    }

    /// Rewrite the preset ordering. Two-phase: all numbers are cleared,
    /// then `number = i + 1` is written per id. The id list must cover
    /// every row exactly once.
    pub fn reorder_presets(&self, order: &[i64]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows: usize = tx.query_row("SELECT COUNT(*) FROM preset", [], |row| row.get(0))?;
        if rows != order.len() {
            return Err(StoreError::OrderMismatch {
                expected: rows,
                got: order.len(),
            });
        }
        renumber(&tx, order)?;
        tx.commit()?;
        Ok(())
    }

    /// All preset ids in number order.
    pub fn preset_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        ordered_ids(&conn)
    }

    // Config blobs

    pub fn load_config(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM config WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("unreadable config blob '{}': {}", name, e);
                    Ok(None)
                }
            },
        }
    }

    pub fn save_config(&self, name: &str, data: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO config (name, data) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
            params![name, data.to_string()],
        )?;
        Ok(())
    }

    pub fn delete_config(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM config WHERE name = ?1", params![name])?;
        Ok(())
    }
}

fn row_to_preset(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresetRow> {
    Ok(PresetRow {
        id: row.get(0)?,
        name: row.get(1)?,
        number: row.get(2)?,
        data: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
    })
}

fn ordered_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM preset ORDER BY number")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn renumber(conn: &Connection, order: &[i64]) -> Result<()> {
    conn.execute("UPDATE preset SET number = NULL", [])?;
    for (idx, id) in order.iter().enumerate() {
        conn.execute(
            "UPDATE preset SET number = ?1 WHERE id = ?2",
            params![(idx + 1) as i64, id],
        )?;
    }
    Ok(())
}
