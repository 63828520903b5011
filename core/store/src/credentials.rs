//! Persisted session credential.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use tillsync_common::{Credential, Result};

use crate::db::{to_millis, LocalStore};

/// Durable home of the session credential.
///
/// Only the session manager writes through this trait. Both `save` and
/// `clear` replace the whole pair in one statement, so readers never see a
/// half-updated credential.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, if any.
    async fn load(&self) -> Result<Option<Credential>>;

    /// Replace the stored credential.
    async fn save(&self, credential: &Credential) -> Result<()>;

    /// Replace the stored credential only while it still equals `expected`.
    ///
    /// Returns `false`, writing nothing, when the credential was cleared or
    /// replaced since `expected` was read.
    async fn replace_if_current(&self, expected: &Credential, next: &Credential) -> Result<bool>;

    /// Remove the stored credential.
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl CredentialStore for LocalStore {
    async fn load(&self) -> Result<Option<Credential>> {
        self.call(|conn| {
            conn.query_row(
                "SELECT access_token, refresh_token FROM credentials WHERE id = 1",
                [],
                |row| {
                    Ok(Credential::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()
        })
        .await
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let credential = credential.clone();
        let now = to_millis(chrono::Utc::now());

        self.call(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO credentials (id, access_token, refresh_token, updated_at_ms)
                VALUES (1, ?1, ?2, ?3)
                "#,
                params![credential.access_token(), credential.refresh_token(), now],
            )?;
            Ok(())
        })
        .await
    }

    async fn replace_if_current(&self, expected: &Credential, next: &Credential) -> Result<bool> {
        let expected = expected.clone();
        let next = next.clone();
        let now = to_millis(chrono::Utc::now());

        self.call(move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE credentials
                SET access_token = ?1, refresh_token = ?2, updated_at_ms = ?3
                WHERE id = 1 AND access_token = ?4 AND refresh_token IS ?5
                "#,
                params![
                    next.access_token(),
                    next.refresh_token(),
                    now,
                    expected.access_token(),
                    expected.refresh_token()
                ],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.call(|conn| {
            conn.execute("DELETE FROM credentials", [])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_store_has_no_credential() {
        let store = LocalStore::in_memory().unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = LocalStore::in_memory().unwrap();
        let cred = Credential::new("access", Some("refresh".to_string()));

        store.save(&cred).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cred));
    }

    #[tokio::test]
    async fn test_save_replaces_pair() {
        let store = LocalStore::in_memory().unwrap();
        store
            .save(&Credential::new("a1", Some("r1".to_string())))
            .await
            .unwrap();
        store.save(&Credential::new("a2", None)).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token(), "a2");
        assert_eq!(loaded.refresh_token(), None);
    }

    #[tokio::test]
    async fn test_replace_if_current() {
        let store = LocalStore::in_memory().unwrap();
        let first = Credential::new("a1", Some("r1".to_string()));
        let second = Credential::new("a2", Some("r1".to_string()));
        store.save(&first).await.unwrap();

        assert!(store.replace_if_current(&first, &second).await.unwrap());
        assert_eq!(store.load().await.unwrap(), Some(second.clone()));

        // Stale expectation: nothing written.
        let third = Credential::new("a3", None);
        assert!(!store.replace_if_current(&first, &third).await.unwrap());
        assert_eq!(store.load().await.unwrap(), Some(second.clone()));
    }

    #[tokio::test]
    async fn test_replace_if_current_after_clear_writes_nothing() {
        let store = LocalStore::in_memory().unwrap();
        let first = Credential::new("a1", None);
        store.save(&first).await.unwrap();
        store.clear().await.unwrap();

        let next = Credential::new("a2", None);
        assert!(!store.replace_if_current(&first, &next).await.unwrap());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = LocalStore::in_memory().unwrap();
        store
            .save(&Credential::new("a", Some("r".to_string())))
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
