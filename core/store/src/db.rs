//! SQLite connection ownership and access.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use tillsync_common::{Error, Result};

use crate::schema;

/// Handle to the terminal's local database.
///
/// A single connection is shared behind a mutex, so every read observes
/// either the state before or after a writer's transaction. Queries run on
/// tokio's blocking pool; callers suspend while SQLite works.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Create or open a local store database and migrate it.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(db_error)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(db_error)?;

        let store = Self::from_connection(conn)?;
        info!(
            "Local store opened at {} (journal mode {})",
            db_path.display(),
            mode
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(db_error)?;
        schema::migrate(&mut conn).map_err(db_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Any SQLite error is reported as `Error::LocalStore`; a transaction
    /// opened inside `f` and not committed is rolled back on drop.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::LocalStore("Connection mutex poisoned".to_string()))?;
            f(&mut guard).map_err(db_error)
        })
        .await
        .map_err(|e| Error::LocalStore(format!("Store task failed: {}", e)))?
    }

    /// Current schema version of the open database.
    pub async fn schema_version(&self) -> Result<i64> {
        self.call(|conn| conn.query_row("PRAGMA user_version", [], |row| row.get(0)))
            .await
    }
}

/// Map a SQLite failure into the shared error taxonomy.
pub(crate) fn db_error(err: rusqlite::Error) -> Error {
    Error::LocalStore(err.to_string())
}

/// Wrap a payload decoding failure so it can surface from a row mapper.
pub(crate) fn decode_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

/// Milliseconds since the Unix epoch for `at`.
pub(crate) fn to_millis(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`to_millis`]; out-of-range values clamp to the epoch.
pub(crate) fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_store_is_migrated() {
        let store = LocalStore::in_memory().unwrap();
        assert_eq!(
            store.schema_version().await.unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("terminal.db");

        let store = LocalStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            store.schema_version().await.unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("terminal.db");

        drop(LocalStore::open(&path).unwrap());
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.schema_version().await.unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_sql_errors_map_to_local_store() {
        let store = LocalStore::in_memory().unwrap();
        let result: Result<i64> = store
            .call(|conn| conn.query_row("SELECT * FROM missing_table", [], |row| row.get(0)))
            .await;
        assert!(matches!(result, Err(Error::LocalStore(_))));
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = chrono::Utc::now();
        let restored = from_millis(to_millis(now));
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}
