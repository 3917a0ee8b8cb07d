use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{DeckError, DeckResult};

const DB_FILE: &str = "deck.db";

/// Process-wide durable key/value store, partitioned into namespaces.
///
/// Every call is a single SQLite statement, so each write is atomic on its own
/// and no entry is ever read-modified-written across two statements.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<StdMutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the store inside `state_dir`.
    pub fn open(state_dir: &Path) -> DeckResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let db_path = state_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let store = Self::init(conn)?;
        info!(path = %db_path.display(), "opened state store");
        Ok(store)
    }

    pub fn open_in_memory() -> DeckResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DeckResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace   TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (namespace, key)
            );",
        )?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    fn lock(&self) -> DeckResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DeckError::Store(format!("lock poisoned: {e}")))
    }

    /// Insert or overwrite `key` in `namespace`.
    pub fn put(&self, namespace: &str, key: &str, value: &str) -> DeckResult<()> {
        self.lock()?.execute(
            "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key)
             DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            rusqlite::params![namespace, key, value],
        )?;
        Ok(())
    }

    pub fn get(&self, namespace: &str, key: &str) -> DeckResult<Option<String>> {
        let value = self
            .lock()?
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                [namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// All entries in a namespace, oldest insert first.
    pub fn entries(&self, namespace: &str) -> DeckResult<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map([namespace], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove `key`; returns whether it existed.
    pub fn remove(&self, namespace: &str, key: &str) -> DeckResult<bool> {
        let removed = self.lock()?.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            [namespace, key],
        )?;
        Ok(removed > 0)
    }
}
