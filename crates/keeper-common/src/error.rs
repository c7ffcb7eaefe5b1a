//! Error types for keeper
//!
//! One error enum covers the whole taxonomy: parse/type errors, not-found,
//! transient and fatal backend failures, lock contention and stream errors.
//! Admin endpoints map these onto the `{error_code, error}` envelope.

use std::time::Duration;

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum KeeperError {
    #[error("parse key error: {reason}, key={key} value={value}")]
    KeyParse {
        key: String,
        value: String,
        reason: String,
    },

    #[error("type unsupport: {0}")]
    TypeUnsupported(String),

    #[error("key {key} type conflict: {left}, {right}")]
    TypeConflict {
        key: String,
        left: String,
        right: String,
    },

    #[error("key not exist")]
    KeyNotExist,

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("lease not found")]
    LeaseNotFound,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error("lock timeout after {0:?}")]
    LockTimeout(Duration),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("{0} event chan full")]
    MailboxFull(String),

    #[error("node has stopped")]
    NodeStopped,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("event unsupport: event_type={0}")]
    EventUnsupported(i32),

    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl KeeperError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        KeeperError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether the caller should treat this as "re-register please" on a
    /// heartbeat path rather than as a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KeeperError::KeyNotExist | KeeperError::NotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KeeperError::not_found("domain", "live");
        assert_eq!(format!("{}", err), "domain live not found");

        let err = KeeperError::TypeConflict {
            key: "port".to_string(),
            left: "int".to_string(),
            right: "string".to_string(),
        };
        assert_eq!(format!("{}", err), "key port type conflict: int, string");

        let err = KeeperError::MailboxFull("node1:1234".to_string());
        assert_eq!(format!("{}", err), "node1:1234 event chan full");
    }

    #[test]
    fn test_is_not_found() {
        assert!(KeeperError::KeyNotExist.is_not_found());
        assert!(KeeperError::not_found("node", "x:1").is_not_found());
        assert!(!KeeperError::Backend("boom".to_string()).is_not_found());
    }
}
