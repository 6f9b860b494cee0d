use reqwest::StatusCode;
use thiserror::Error;

use super::retry::Transient;

/// Errors from upstream registry operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid digest: {0}")]
    Digest(#[from] regfac_oci::DigestError),

    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: StatusCode, url: String },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Transient for RemoteError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_transient(),
            _ => false,
        }
    }
}
