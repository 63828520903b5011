//! Key/value cache for the signed-in operator's identity.

use rusqlite::{params, OptionalExtension};

use tillsync_common::Result;

use crate::db::LocalStore;

impl LocalStore {
    /// Read one cached identity value.
    pub async fn identity_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT value FROM identity_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Store one identity value, replacing any previous one.
    pub async fn identity_set(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO identity_cache (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    /// Forget every cached identity value.
    pub async fn identity_clear(&self) -> Result<()> {
        self.call(|conn| {
            conn.execute("DELETE FROM identity_cache", [])?;
            Ok(())
        })
        .await
    }
}
