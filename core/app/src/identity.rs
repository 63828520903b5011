//! Cached identity of the signed-in operator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use tillsync_api::TeardownHook;
use tillsync_common::Result;
use tillsync_store::LocalStore;

const OPERATOR_KEY: &str = "operator";

/// The person using the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
}

/// Operator identity kept across restarts, forgotten on forced logout.
pub struct IdentityCache {
    store: LocalStore,
}

impl IdentityCache {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn remember(&self, operator: &Operator) -> Result<()> {
        self.store
            .identity_set(OPERATOR_KEY, &serde_json::to_string(operator)?)
            .await
    }

    pub async fn current(&self) -> Result<Option<Operator>> {
        match self.store.identity_get(OPERATOR_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn forget(&self) -> Result<()> {
        self.store.identity_clear().await
    }
}

#[async_trait]
impl TeardownHook for IdentityCache {
    fn name(&self) -> &str {
        "identity-cache"
    }

    async fn on_teardown(&self) -> Result<()> {
        self.forget().await?;
        info!("Cleared cached operator identity");
        Ok(())
    }
}
