//! Remote API connection settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API base URL for a development backend.
const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
/// Default token refresh endpoint, relative to the base URL.
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
/// Default per-request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every request path is appended to.
    pub base_url: String,
    /// Path of the token refresh endpoint.
    pub refresh_path: String,
    /// Timeout for a single request, in seconds.
    pub request_timeout_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl ApiConfig {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: format!("Tillsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
