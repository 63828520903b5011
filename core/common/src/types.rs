//! Common types used throughout Tillsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            ///
            /// # Errors
            /// - Returns error if id is empty or only whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(format!(
                        "{} cannot be empty",
                        $label
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of this physical terminal, announced to the server.
    DeviceId,
    "DeviceId"
);

string_id!(
    /// Identifier of the shop branch the terminal belongs to.
    BranchId,
    "BranchId"
);

string_id!(
    /// Identifier of the tenant owning the reference data.
    TenantId,
    "TenantId"
);

/// Client-generated idempotency key for a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a key previously rendered with `Display`.
    pub fn parse(value: &str) -> crate::Result<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid local id {}: {}", value, e)))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The access/refresh token pair of the signed-in session.
///
/// Token material is wiped on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    access_token: String,
    refresh_token: Option<String>,
}

impl Credential {
    /// Create a credential pair.
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// Bearer token for API requests.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Token used to obtain a new access token.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Produce the credential that results from a refresh: the new access
    /// token, and the rotated refresh token if the server issued one.
    pub fn rotated(&self, access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.or_else(|| self.refresh_token.clone()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_creation() {
        let id = DeviceId::new("till-01").unwrap();
        assert_eq!(id.as_str(), "till-01");
        assert_eq!(id.to_string(), "till-01");
    }

    #[test]
    fn test_empty_ids_fail() {
        assert!(DeviceId::new("").is_err());
        assert!(BranchId::new("   ").is_err());
        assert!(TenantId::new("").is_err());
    }

    #[test]
    fn test_local_id_roundtrip() {
        let id = LocalId::generate();
        let parsed = LocalId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(LocalId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(LocalId::generate(), LocalId::generate());
    }

    #[test]
    fn test_credential_rotation_keeps_refresh_token() {
        let cred = Credential::new("a1", Some("r1".to_string()));

        let kept = cred.rotated("a2", None);
        assert_eq!(kept.access_token(), "a2");
        assert_eq!(kept.refresh_token(), Some("r1"));

        let rotated = cred.rotated("a3", Some("r2".to_string()));
        assert_eq!(rotated.refresh_token(), Some("r2"));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("secret-access", Some("secret-refresh".to_string()));
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_credential_serialization() {
        let cred = Credential::new("a", Some("r".to_string()));
        let json = serde_json::to_string(&cred).unwrap();
        assert!(json.contains("accessToken"));
        let restored: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, cred);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_local_id_parse_never_panics(input in ".*") {
                let _ = LocalId::parse(&input);
            }

            #[test]
            fn test_non_blank_ids_are_kept_verbatim(id in "[a-z0-9-]{1,32}") {
                let device = DeviceId::new(id.clone()).unwrap();
                prop_assert_eq!(device.as_str(), id.as_str());
            }
        }
    }
}
