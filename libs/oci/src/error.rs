//! Error types for digest parsing.

use thiserror::Error;

/// Errors that can occur when parsing a content digest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The digest string is empty.
    #[error("digest cannot be empty")]
    Empty,

    /// The digest is missing the `algorithm:encoded` separator.
    #[error("digest missing ':' separator")]
    MissingSeparator,

    /// The algorithm is not one we can verify.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The encoded part has the wrong length for its algorithm.
    #[error("invalid {algorithm} digest length: expected {expected}, got {actual}")]
    InvalidLength {
        algorithm: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The encoded part is not lowercase hex.
    #[error("invalid digest encoding: {0}")]
    InvalidEncoding(String),
}
