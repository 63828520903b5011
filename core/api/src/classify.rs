//! Classification of 401 response bodies.

use serde_json::Value;

/// Why the remote refused a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The access token expired; a refresh may recover.
    TokenExpired,
    /// The token, user or role is no longer valid.
    Revoked,
    /// Unrecognized body.
    Unknown,
}

const EXPIRED_CODES: &[&str] = &[
    "TOKEN_EXPIRED",
    "ACCESS_TOKEN_EXPIRED",
    "JWT_EXPIRED",
    "EXPIRED_TOKEN",
];

const REVOKED_CODES: &[&str] = &[
    "TOKEN_REVOKED",
    "TOKEN_INVALID",
    "INVALID_TOKEN",
    "SESSION_REVOKED",
    "USER_DISABLED",
    "USER_INACTIVE",
    "ROLE_DISABLED",
    "ROLE_REVOKED",
];

/// Classify the body of a 401 response.
///
/// Accepts the shapes the backend has used over time: a `code` field, an
/// `error` field (string or nested object), or a free-text `message`.
/// Codes take precedence over messages. Anything else is `Unknown`.
pub fn classify_unauthorized(body: &str) -> AuthFailure {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => classify_value(&value),
        Err(_) => AuthFailure::Unknown,
    }
}

fn classify_value(value: &Value) -> AuthFailure {
    let Some(object) = value.as_object() else {
        return AuthFailure::Unknown;
    };

    for key in ["code", "error"] {
        match object.get(key) {
            Some(Value::String(code)) => {
                if let Some(failure) = classify_code(code) {
                    return failure;
                }
                if key == "error" {
                    let failure = classify_message(code);
                    if failure != AuthFailure::Unknown {
                        return failure;
                    }
                }
            }
            Some(nested @ Value::Object(_)) => {
                let failure = classify_value(nested);
                if failure != AuthFailure::Unknown {
                    return failure;
                }
            }
            _ => {}
        }
    }

    object
        .get("message")
        .and_then(Value::as_str)
        .map(classify_message)
        .unwrap_or(AuthFailure::Unknown)
}

fn classify_code(code: &str) -> Option<AuthFailure> {
    let normalized: String = code
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();

    if EXPIRED_CODES.contains(&normalized.as_str()) {
        Some(AuthFailure::TokenExpired)
    } else if REVOKED_CODES.contains(&normalized.as_str()) {
        Some(AuthFailure::Revoked)
    } else {
        None
    }
}

fn classify_message(message: &str) -> AuthFailure {
    let message = message.to_lowercase();
    if message.contains("expired") {
        AuthFailure::TokenExpired
    } else if message.contains("revoked") || message.contains("disabled") {
        AuthFailure::Revoked
    } else {
        AuthFailure::Unknown
    }
}
