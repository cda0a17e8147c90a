//! Error types for harbor operations

use thiserror::Error;

/// Composite key validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Malformed resource key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Errors produced while loading or mutating cached entities.
///
/// These are cloned to every caller that joined the same in-flight load,
/// so the type carries owned strings only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("{0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Remote request failed: {0}")]
    Remote(String),

    #[error("Loader does not support alias {0}")]
    UnsupportedAlias(String),

    #[error("Load task aborted: {0}")]
    Aborted(String),
}

/// Transport-level errors. These never reach event subscribers; the
/// transport logs them and retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Socket closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Frame encoding failed: {0}")]
    Encode(String),

    #[error("Transport task has stopped")]
    Stopped,
}

/// Errors raised by the conditional synchronization step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Synchronization declined for {kind}")]
    Declined { kind: String },
}

/// Data action registration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Duplicate data action registration: {0}")]
    Duplicate(&'static str),

    #[error("Unknown data action: {0}")]
    Unknown(String),

    #[error("Data action dependency cycle through {0}")]
    Cycle(String),
}

/// Master error type for all harbor errors.
#[derive(Debug, Clone, Error)]
pub enum HarborError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),
}

/// Result type alias for harbor operations.
pub type HarborResult<T> = Result<T, HarborError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_is_verbatim() {
        let err = LoadError::NotFound("Connection is not found (c1)".to_string());
        assert_eq!(err.to_string(), "Connection is not found (c1)");
    }

    #[test]
    fn test_closed_display_includes_code() {
        let err = TransportError::Closed {
            code: 1006,
            reason: String::new(),
        };
        assert!(err.to_string().contains("1006"));
    }

    #[test]
    fn test_key_error_converts_into_load_error() {
        let err: LoadError = KeyError::Malformed {
            key: ":".to_string(),
            reason: "empty".to_string(),
        }
        .into();
        assert!(matches!(err, LoadError::InvalidKey(_)));
    }

    #[test]
    fn test_harbor_error_wraps_transport() {
        let err: HarborError = TransportError::Stopped.into();
        assert!(err.to_string().starts_with("Transport error"));
    }
}
