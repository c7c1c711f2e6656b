use thiserror::Error;

/// Errors raised by providers, storage backends and the throttler itself.
#[derive(Debug, Error)]
pub enum ThrottlerError {
    /// Invalid construction parameters. No usable instance is produced.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation needing a backing store ran before one was attached.
    #[error("No storage bound to the provider")]
    StorageNotBound,

    /// A fill would push the bucket over its capacity.
    #[error("Capacity exceeded for '{namespace}': requested {requested}, available {available}")]
    CapacityExceeded {
        namespace: String,
        requested: u64,
        available: u64,
    },

    /// Replace, touch or remove targeted an absent or expired key.
    #[error("Storage item not found: {0}")]
    ItemNotFound(String),

    #[error("Namespace cannot be empty")]
    InvalidNamespace,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThrottlerError {
    /// Whether the caller can recover by retrying later or fixing wiring.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ThrottlerError::Configuration(_) | ThrottlerError::Serialization(_)
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        ThrottlerError::Internal(format!("Failed to acquire lock on {}", what))
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::Configuration(err.to_string())
    }
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_message() {
        let err = ThrottlerError::CapacityExceeded {
            namespace: "foo".to_string(),
            requested: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded for 'foo': requested 3, available 1"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_configuration_is_fatal() {
        let err = ThrottlerError::Configuration("capacity must be greater than 0".into());
        assert!(!err.is_recoverable());
        assert!(ThrottlerError::StorageNotBound.is_recoverable());
        assert!(ThrottlerError::ItemNotFound("foo".into()).is_recoverable());
    }
}
