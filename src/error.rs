//! Error types for hotswap-registry.
//!
//! Errors are split by layer: [`ConfigError`] and [`ValidationError`] for the
//! configuration store, [`CoordinationError`] for calls into the coordination
//! service, [`RegistryError`] for the lease lifecycle and [`ServerError`] for
//! binding, rebinding and serving.

use std::fmt;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to load configuration from a source.
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    /// Failed to deserialize configuration.
    #[error("Failed to deserialize configuration: {0}")]
    DeserializationError(String),

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// File watching failed to initialize.
    #[error("File watching error: {0}")]
    WatchError(String),

    /// The store was built without sources, so there is nothing to reload from.
    #[error("No configuration sources to reload from")]
    NoSources,

    /// IO error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Validation error for configuration snapshots.
#[derive(Debug)]
pub enum ValidationError {
    /// Custom validation error with a message.
    Custom(String),

    /// A specific field has an invalid value.
    InvalidField {
        /// The field name/path
        field: String,
        /// The reason why it's invalid
        reason: String,
    },

    /// Multiple validation errors occurred.
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Create a custom validation error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is only one.
    pub fn from_list(mut errors: Vec<ValidationError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(msg) => write!(f, "{}", msg),
            Self::InvalidField { field, reason } => {
                write!(f, "Field '{}' is invalid: {}", field, reason)
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple validation errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for ConfigError {
    fn from(err: ValidationError) -> Self {
        ConfigError::ValidationError(err.to_string())
    }
}

/// Errors returned by a [`CoordinationClient`](crate::coordination::CoordinationClient).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    /// The store could not be reached or rejected the request.
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// The lease is unknown to the store (never granted, revoked or expired).
    #[error("Lease {0} not found")]
    LeaseNotFound(i64),

    /// The request did not complete within its deadline.
    #[error("Coordination request '{op}' timed out")]
    Timeout {
        /// Operation that timed out
        op: &'static str,
    },

    /// The client connection was closed.
    #[error("Coordination client is closed")]
    Closed,
}

/// Errors from the endpoint registration lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Granting the lease failed.
    #[error("Failed to grant lease: {0}")]
    Grant(#[source] CoordinationError),

    /// Writing the endpoint record failed.
    #[error("Failed to write endpoint record '{key}': {source}")]
    Put {
        /// Discovery key that was being written
        key: String,
        /// Underlying failure
        #[source]
        source: CoordinationError,
    },

    /// Opening the keep-alive stream failed.
    #[error("Failed to start lease renewal: {0}")]
    KeepAlive(#[source] CoordinationError),

    /// Withdrawal partially failed. Both steps are always attempted.
    #[error("Failed to withdraw endpoint (delete: {delete:?}, revoke: {revoke:?})")]
    Unregister {
        /// Failure deleting the endpoint record, if any
        delete: Option<CoordinationError>,
        /// Failure revoking the lease, if any
        revoke: Option<CoordinationError>,
    },

    /// `register` was called on a registry that is already active.
    #[error("Endpoint registry is already active")]
    AlreadyActive,

    /// `register` was called on a registry that has been unregistered.
    #[error("Endpoint registry has been retired and cannot be reused")]
    Retired,
}

/// Errors from binding, rebinding and serving.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured address could not be parsed.
    #[error("Invalid listen address '{addr}': {reason}")]
    InvalidAddress {
        /// Address as configured
        addr: String,
        /// Why it was rejected
        reason: String,
    },

    /// Opening the listening socket failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was being bound
        addr: String,
        /// Underlying IO failure
        #[source]
        source: std::io::Error,
    },

    /// The endpoint could not be advertised.
    #[error("Failed to register endpoint: {0}")]
    Registry(#[from] RegistryError),

    /// Closing the coordination client failed during shutdown.
    #[error("Failed to close coordination client: {0}")]
    Coordination(#[from] CoordinationError),

    /// The transport server exited with an error.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// `serve` was called more than once.
    #[error("Server is already serving")]
    AlreadyServing,

    /// The server is shutting down or stopped.
    #[error("Server is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_from_list() {
        assert!(ValidationError::from_list(vec![]).is_none());

        let single = ValidationError::from_list(vec![ValidationError::custom("bad")]).unwrap();
        assert_eq!(single.to_string(), "bad");

        let multiple = ValidationError::from_list(vec![
            ValidationError::invalid_field("server.addr", "empty"),
            ValidationError::invalid_field("coordination.addr", "empty"),
        ])
        .unwrap();
        let rendered = multiple.to_string();
        assert!(rendered.contains("1. Field 'server.addr' is invalid: empty"));
        assert!(rendered.contains("2. Field 'coordination.addr' is invalid: empty"));
    }

    #[test]
    fn test_io_error_converts() {
        let err: ConfigError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, ConfigError::IoError(_)));
        assert!(err.to_string().starts_with("IO error:"));
    }

    #[test]
    fn test_unregister_error_reports_both_steps() {
        let err = RegistryError::Unregister {
            delete: Some(CoordinationError::Unavailable("down".into())),
            revoke: Some(CoordinationError::LeaseNotFound(7)),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("delete: Some"));
        assert!(rendered.contains("LeaseNotFound(7)"));
    }
}
