//! Spec providers: map the spec ref of a pull path to an [`ImageSpec`].
//!
//! Providers are registered under a prefix (`remote`, `fixed`); the first
//! segment of a pulled repository name selects the provider and the rest is
//! the ref passed to it.

mod cache;
mod fixed;
mod remote;

use std::path::PathBuf;

use async_trait::async_trait;
use regfac_api::ImageSpec;
use thiserror::Error;

pub use cache::CachingSpecProvider;
pub use fixed::FixedSpecProvider;
pub use remote::{RemoteSpecProvider, TlsMaterial};

#[derive(Debug, Error)]
pub enum SpecError {
    /// The provider does not know this ref.
    #[error("invalid spec ref: {0}")]
    InvalidRef(String),

    #[error("invalid spec service address {0:?}")]
    InvalidAddress(String),

    #[error("invalid TLS material: {0}")]
    Tls(String),

    /// The spec service answered with something other than a spec.
    #[error("spec service unavailable: {0}")]
    Unavailable(String),

    #[error("spec service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed spec: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpecError {
    pub fn is_invalid_ref(&self) -> bool {
        matches!(self, Self::InvalidRef(_))
    }
}

#[async_trait]
pub trait ImageSpecProvider: Send + Sync {
    async fn get_spec(&self, reference: &str) -> Result<ImageSpec, SpecError>;
}
