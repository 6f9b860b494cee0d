//! Content store errors.

use regfac_oci::Digest;
use thiserror::Error;

/// Errors returned by [`crate::ContentStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// No content or metadata is stored under this key.
    #[error("content not found: {0}")]
    NotFound(Digest),

    /// The buffered bytes do not hash to the expected digest. Nothing was stored.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// Filesystem error (local backend).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata record could not be encoded or decoded.
    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// KV backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
