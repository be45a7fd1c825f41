//! Error types for bus operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or lock expired: {lock_token}")]
    MessageNotFound { lock_token: String },

    #[error("Lock '{lock_token}' was lost before it could be renewed")]
    LockLost { lock_token: String },

    #[error("Receive timed out after {duration:?} without a message")]
    ReceiveTimeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request throttled by {provider}; retry after {retry_after:?}")]
    Throttled {
        provider: String,
        retry_after: Duration,
    },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error(
        "Transaction already has work enlisted by bus '{owner}'; bus '{intruder}' cannot join it"
    )]
    TransactionConflict { owner: String, intruder: String },

    #[error("Cannot register a {phase} callback: that phase has already fired")]
    CallbackPhaseClosed { phase: &'static str },

    #[error("Transaction is {state}; '{operation}' is not allowed")]
    TransactionClosed {
        state: &'static str,
        operation: &'static str,
    },

    #[error("Required header '{header}' is missing")]
    MissingHeader { header: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl BusError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::LockLost { .. } => false,
            Self::ReceiveTimeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::Throttled { .. } => true,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::TransactionConflict { .. } => false,
            Self::CallbackPhaseClosed { .. } => false,
            Self::TransactionClosed { .. } => false,
            Self::MissingHeader { .. } => false,
            Self::Validation(_) => false,
            Self::Configuration(_) => false,
        }
    }

    /// Check if error is the benign "nothing to read" condition of a receive
    pub fn is_empty_poll(&self) -> bool {
        matches!(self, Self::ReceiveTimeout { .. })
    }

    /// Check if the backend client that produced this error should be discarded
    ///
    /// Errors about a single message, and programming errors such as conflicts
    /// or validation failures, say nothing about the health of the connection
    /// and leave the cached client in place.
    pub fn should_evict_client(&self) -> bool {
        match self {
            Self::ReceiveTimeout { .. } | Self::MessageNotFound { .. } | Self::LockLost { .. } => {
                false
            }
            Self::TransactionConflict { .. }
            | Self::CallbackPhaseClosed { .. }
            | Self::TransactionClosed { .. }
            | Self::MissingHeader { .. }
            | Self::Validation(_)
            | Self::Configuration(_) => false,
            _ => true,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => Some(*retry_after),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
