//! Error types for registry and object-store collaborators.

use std::time::Duration;

use strata_core::BundleError;

/// Storage collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Blob, manifest, tag, or object does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Authentication failed or credentials were refused.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Rate limit exceeded.
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx from the registry.
    #[error("server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    /// Any other unexpected HTTP status.
    #[error("unexpected response: HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection, TLS, or body read failure.
    #[error("network error: {message}")]
    Network { message: String },

    /// Bytes did not hash to the digest they were addressed by.
    #[error("digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// Response body or header was not what the protocol promises.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Collaborator could not be constructed.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Error from the underlying object store.
    #[error("object store error for {uri}: {source}")]
    ObjectStore {
        uri: String,
        #[source]
        source: object_store::Error,
    },
}

impl StorageError {
    /// Whether a retry can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Map an object_store error, keeping "not found" distinct.
    pub fn from_object_store(err: object_store::Error, uri: &str) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound {
                what: uri.to_string(),
            },
            other => Self::ObjectStore {
                uri: uri.to_string(),
                source: other,
            },
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for BundleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { what } => BundleError::NotFound { what },
            StorageError::Unauthorized { message } => BundleError::Unauthorized { message },
            StorageError::DigestMismatch {
                subject,
                expected,
                actual,
            } => BundleError::DigestMismatch {
                subject,
                expected,
                actual,
            },
            other => BundleError::transport(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
