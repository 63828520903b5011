//! Session credential ownership and single-flight token refresh.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use tillsync_common::{Credential, DeviceId, Error, Result};
use tillsync_store::CredentialStore;

use crate::transport::{HttpRequest, HttpTransport};

/// Outcome of a failed refresh cycle, shared by every waiting caller.
#[derive(Debug, Clone, Error)]
pub enum RefreshFailure {
    #[error("No refresh token stored")]
    NoRefreshToken,

    #[error("Refresh rejected with status {status}")]
    Rejected { status: u16, body: String },

    #[error("Refresh request failed: {0}")]
    Transport(String),

    #[error("Credential store failed: {0}")]
    Store(String),

    #[error("Credential cleared or replaced during refresh")]
    Superseded,
}

impl From<RefreshFailure> for Error {
    fn from(err: RefreshFailure) -> Self {
        match err {
            RefreshFailure::NoRefreshToken => Error::NoRefreshToken,
            other => Error::TokenRefreshFailed(other.to_string()),
        }
    }
}

/// Runs when the session is torn down, after the credential is cleared.
#[async_trait]
pub trait TeardownHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn on_teardown(&self) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<String, RefreshFailure>>>;

/// Sole owner of the session credential.
///
/// At most one refresh cycle is in flight at a time: concurrent callers of
/// [`SessionManager::refresh`] join the pending cycle and receive its
/// result, so the refresh endpoint is called once per cycle.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    device_id: DeviceId,
    refresh_path: String,
    in_flight: Mutex<Option<RefreshFuture>>,
    hooks: RwLock<Vec<Arc<dyn TeardownHook>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        device_id: DeviceId,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            device_id,
            refresh_path: refresh_path.into(),
            in_flight: Mutex::new(None),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Store a credential obtained from sign-in.
    pub async fn establish(&self, credential: Credential) -> Result<()> {
        self.store.save(&credential).await?;
        info!("Session established");
        Ok(())
    }

    /// Current access token, if signed in.
    pub async fn access_token(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .load()
            .await?
            .map(|credential| credential.access_token().to_string()))
    }

    /// Whether a credential is stored.
    pub async fn has_credential(&self) -> Result<bool> {
        Ok(self.store.load().await?.is_some())
    }

    /// Register a hook to run on forced teardown.
    pub fn on_teardown(&self, hook: Arc<dyn TeardownHook>) {
        match self.hooks.write() {
            Ok(mut hooks) => hooks.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }

    /// Obtain a new access token, joining a refresh already in flight.
    ///
    /// On success the new access token (and rotated refresh token, when the
    /// server returns one) has been stored. On failure the stored credential
    /// is left untouched. A credential cleared or replaced while the request
    /// was in flight is never overwritten; the cycle fails instead.
    ///
    /// # Errors
    /// - `NoRefreshToken` when no refresh token is stored
    /// - `TokenRefreshFailed` when the endpoint fails or rejects the token
    pub async fn refresh(&self) -> Result<String> {
        let cycle = {
            let mut slot = self
                .in_flight
                .lock()
                .map_err(|_| Error::TokenRefreshFailed("Refresh slot poisoned".to_string()))?;

            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let cycle = refresh_cycle(
                        Arc::clone(&self.store),
                        Arc::clone(&self.transport),
                        self.device_id.clone(),
                        self.refresh_path.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(cycle.clone());
                    cycle
                }
            }
        };

        let outcome = cycle.clone().await;

        if let Ok(mut slot) = self.in_flight.lock() {
            if slot
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&cycle))
            {
                *slot = None;
            }
        }

        outcome.map_err(Error::from)
    }

    /// Clear the credential, then run every teardown hook.
    ///
    /// Hook failures are logged and do not stop the remaining hooks.
    pub async fn teardown(&self) -> Result<()> {
        warn!("Tearing down session");
        self.store.clear().await?;

        let hooks = match self.hooks.read() {
            Ok(hooks) => hooks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for hook in hooks {
            if let Err(e) = hook.on_teardown().await {
                warn!("Teardown hook {} failed: {}", hook.name(), e);
            }
        }

        Ok(())
    }
}

async fn refresh_cycle(
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    device_id: DeviceId,
    refresh_path: String,
) -> std::result::Result<String, RefreshFailure> {
    let current = store
        .load()
        .await
        .map_err(|e| RefreshFailure::Store(e.to_string()))?
        .ok_or(RefreshFailure::NoRefreshToken)?;
    let refresh_token = current
        .refresh_token()
        .ok_or(RefreshFailure::NoRefreshToken)?;

    info!("Refreshing access token");

    let request = HttpRequest::post(
        refresh_path,
        serde_json::json!({
            "refreshToken": refresh_token,
            "deviceId": device_id.as_str(),
        }),
    );
    let response = transport
        .send(&request)
        .await
        .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

    if !response.is_success() {
        warn!("Token refresh rejected with status {}", response.status);
        return Err(RefreshFailure::Rejected {
            status: response.status,
            body: response.body,
        });
    }

    let tokens: RefreshResponse = serde_json::from_str(&response.body)
        .map_err(|e| RefreshFailure::Transport(format!("Invalid refresh response: {}", e)))?;

    let rotated = current.rotated(tokens.access_token, tokens.refresh_token);
    let stored = store
        .replace_if_current(&current, &rotated)
        .await
        .map_err(|e| RefreshFailure::Store(e.to_string()))?;
    if !stored {
        warn!("Session ended while refreshing; discarding new token");
        return Err(RefreshFailure::Superseded);
    }

    info!("Access token refreshed");
    Ok(rotated.access_token().to_string())
}
