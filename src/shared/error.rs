//! Shared Error Types
//!
//! Error types used across the sync subsystem.
//!
//! # Error Categories
//!
//! - `StoreError` - Durable local store failures (open, query, decode)
//! - `TransportError` - HTTP failures below the status-code level
//! - `SyncError` - Crate-wide error returned by public operations
//!
//! # Propagation
//!
//! Transient network failures never reach callers of the API proxy; they are
//! absorbed by the outbox. Only an unavailable store and retry exhaustion are
//! escalated, and those as events rather than errors.
//!
//! # Usage
//!
//! ```rust
//! use reliefsync::shared::error::SyncError;
//!
//! let error = SyncError::validation("target", "target path cannot be empty");
//! assert!(error.to_string().contains("target"));
//! ```

use thiserror::Error;

use crate::shared::config::ConfigError;

/// Durable local store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be opened; offline capability is unavailable
    #[error("Offline capability unavailable: {reason}")]
    Unavailable {
        /// Why opening the store failed
        reason: String,
    },

    /// Underlying SQLite error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Index lookup on a field name that is not a plain identifier
    #[error("Invalid index field '{0}'")]
    InvalidIndexField(String),
}

impl StoreError {
    /// Create a new unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// HTTP transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, reset, ...
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// GET failed online and neither cache nor local data can answer
    #[error("'{endpoint}' is unavailable offline")]
    UnavailableOffline {
        /// Endpoint that was requested
        endpoint: String,
    },

    /// The server answered with a non-retryable status
    #[error("Request rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// No conflict record with this id
    #[error("Conflict '{id}' not found")]
    ConflictNotFound {
        /// Conflict id
        id: String,
    },

    /// The conflict was already resolved and cannot be re-opened
    #[error("Conflict '{id}' is already resolved")]
    ConflictAlreadyResolved {
        /// Conflict id
        id: String,
    },

    /// No record with this id in the requested partition
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Data validation error
    #[error("Validation error in field '{field}': {message}")]
    Validation {
        /// The field that failed validation
        field: String,
        /// Human-readable error message
        message: String,
    },
}

impl SyncError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new unavailable-offline error
    pub fn unavailable_offline(endpoint: impl Into<String>) -> Self {
        Self::UnavailableOffline {
            endpoint: endpoint.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(err))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}
