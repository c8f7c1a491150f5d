//! SQLite-backed coordination store.
//!
//! Each path is one row keyed by its full path, with the parent stored
//! alongside so `children` is a single indexed lookup.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{split, CoordinationStore, StoreError};

/// Durable store backed by a local SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        debug!(path = %path.as_ref().display(), "Opened coordination store");
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a query on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Worker("connection lock poisoned".to_string()))?;
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        split(path)?;
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM nodes WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let (parent, _) = split(path)?;
        let parent = parent.to_string();
        let path = path.to_string();
        let value = value.to_string();
        let now = chrono::Utc::now().timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO nodes (path, parent, value, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(path) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![path, parent, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        split(path)?;
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM nodes WHERE path = ?1", params![path])
                .map(|_| ())
        })
        .await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let parent = path.to_string();
        let paths: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT path FROM nodes WHERE parent = ?1 ORDER BY path")?;
                let rows = stmt
                    .query_map(params![parent], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>();
                rows
            })
            .await?;

        paths
            .iter()
            .map(|p| split(p).map(|(_, name)| name.to_string()))
            .collect()
    }
}
