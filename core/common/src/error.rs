//! Common error types for Tillsync.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for terminal sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device reports no reachable network; no request was attempted.
    #[error("Offline: no network reachable")]
    Offline,

    /// The session was torn down and the user must sign in again.
    #[error("Session expired: re-authentication required")]
    SessionExpired,

    /// A refresh was requested but no refresh token is stored.
    #[error("No refresh token stored")]
    NoRefreshToken,

    /// The remote refresh endpoint failed or rejected the refresh token.
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// The remote answered with a non-success status.
    #[error("Remote rejected request with status {status}: {}", .message.as_deref().unwrap_or(.body))]
    RemoteRejected {
        status: u16,
        message: Option<String>,
        body: String,
        /// Seconds from a `Retry-After` header, when the server sent one.
        retry_after_secs: Option<u64>,
    },

    /// The request never produced a response (connect failure, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// A local store transaction failed and was rolled back.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Build a `RemoteRejected` from a status and raw body, lifting the
    /// server's `message` (or `error`) field when the body is JSON.
    pub fn remote_rejected(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                ["message", "error"]
                    .iter()
                    .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(String::from))
            });

        Error::RemoteRejected {
            status,
            message,
            body,
            retry_after_secs: None,
        }
    }

    /// Attach a server-requested wait to a `RemoteRejected`; other variants
    /// pass through.
    pub fn with_retry_after(self, secs: Option<u64>) -> Self {
        match self {
            Error::RemoteRejected {
                status,
                message,
                body,
                ..
            } => Error::RemoteRejected {
                status,
                message,
                body,
                retry_after_secs: secs,
            },
            other => other,
        }
    }

    /// How long the server asked us to wait before trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RemoteRejected {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Whether the failure is transient and the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Offline | Error::Network(_) => true,
            Error::RemoteRejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Text suitable for showing an operator.
    pub fn user_message(&self) -> String {
        match self {
            Error::Offline => "You are offline. Changes will sync when the connection returns."
                .to_string(),
            Error::SessionExpired | Error::NoRefreshToken | Error::TokenRefreshFailed(_) => {
                "Your session has expired. Please sign in again.".to_string()
            }
            Error::RemoteRejected {
                message: Some(message),
                ..
            } => message.clone(),
            Error::RemoteRejected { status, .. } => {
                format!("The server rejected the request ({})", status)
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_rejected_lifts_message() {
        let err = Error::remote_rejected(422, r#"{"message":"Till already closed"}"#);
        match &err {
            Error::RemoteRejected {
                status, message, ..
            } => {
                assert_eq!(*status, 422);
                assert_eq!(message.as_deref(), Some("Till already closed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.user_message(), "Till already closed");
    }

    #[test]
    fn test_retry_after_only_on_rejections() {
        let err = Error::remote_rejected(429, "").with_retry_after(Some(7));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(Error::remote_rejected(429, "").retry_after(), None);

        let err = Error::Network("reset".to_string()).with_retry_after(Some(7));
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_remote_rejected_plain_body() {
        let err = Error::remote_rejected(502, "Bad Gateway");
        assert!(matches!(err, Error::RemoteRejected { message: None, .. }));
        assert!(err.is_transient());
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Offline.is_transient());
        assert!(Error::Network("timeout".to_string()).is_transient());
        assert!(!Error::SessionExpired.is_transient());
        assert!(!Error::remote_rejected(400, "{}").is_transient());
        assert!(Error::remote_rejected(429, "{}").is_transient());
    }

    #[test]
    fn test_session_errors_share_message() {
        assert_eq!(
            Error::SessionExpired.user_message(),
            Error::TokenRefreshFailed("boom".to_string()).user_message()
        );
    }
}
