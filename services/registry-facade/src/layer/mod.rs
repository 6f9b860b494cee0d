//! Sources of additional layers and the blobs behind them.
//!
//! Every source answers four questions for a given [`ImageSpec`]: which env
//! edits it contributes, which layers it adds, whether it can serve a digest,
//! and the blob for that digest. [`LayerSource`] is the closed set of
//! implementations; composition happens through [`CompositeLayerSource`],
//! [`SpecMappedImageSource`] and [`RevisioningLayerSource`].

mod composite;
mod content;
mod env;
mod file;
mod image;
mod revisioning;
mod spec_mapped;

use std::fmt;
use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt};
use regfac_api::ImageSpec;
use regfac_oci::{Descriptor, Digest};
use thiserror::Error;

use crate::image::DownloadError;
use crate::remote::{BlobStream, RemoteError};

pub use composite::CompositeLayerSource;
pub use content::ContentLayerSource;
pub use env::{EnvModifier, ParsedEnvs};
pub use file::FileLayerSource;
pub use image::{ImageLayerSource, SKIP_N_LABEL};
pub use revisioning::RevisioningLayerSource;
pub use spec_mapped::{RefProjection, SpecMappedImageSource};

/// A layer added to an image: the manifest descriptor plus the digest of its
/// uncompressed content for `rootfs.diff_ids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonLayer {
    pub descriptor: Descriptor,
    pub diff_id: Digest,
}

/// How a blob's bytes reach the client.
pub enum BlobContent {
    /// Client is sent elsewhere.
    Redirect(String),
    Stream(BlobStream),
}

/// A blob ready to be served.
pub struct Blob {
    pub media_type: String,
    pub size: Option<u64>,
    pub content: BlobContent,
}

impl Blob {
    pub fn from_bytes(media_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            media_type: media_type.into(),
            size: Some(data.len() as u64),
            content: BlobContent::Stream(stream::once(async move { Ok(data) }).boxed()),
        }
    }

    pub fn redirect(media_type: impl Into<String>, url: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            content: BlobContent::Redirect(url.into()),
        }
    }

    pub fn stream(media_type: impl Into<String>, size: Option<u64>, stream: BlobStream) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            content: BlobContent::Stream(stream),
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let content = match &self.content {
            BlobContent::Redirect(url) => url.as_str(),
            BlobContent::Stream(_) => "<stream>",
        };
        f.debug_struct("Blob")
            .field("media_type", &self.media_type)
            .field("size", &self.size)
            .field("content", &content)
            .finish()
    }
}

/// Errors from layer sources.
#[derive(Debug, Error)]
pub enum LayerError {
    /// No source can serve this digest.
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// The skip label of a source image is not a non-negative integer.
    #[error("invalid skip-n label {value:?} on {reference}: {source}")]
    InvalidSkipLabel {
        reference: String,
        value: String,
        source: ParseIntError,
    },

    /// Manifest layers and config diff IDs disagree.
    #[error("image {reference} has {layers} layers but {diff_ids} diff IDs")]
    LayerCountMismatch {
        reference: String,
        layers: usize,
        diff_ids: usize,
    },

    /// Reading a layer file failed.
    #[error("layer file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("layer file task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// The closed set of layer sources.
#[derive(Clone)]
pub enum LayerSource {
    File(Arc<FileLayerSource>),
    Image(Arc<ImageLayerSource>),
    Content(Arc<ContentLayerSource>),
    Composite(Arc<CompositeLayerSource>),
    SpecMapped(Arc<SpecMappedImageSource>),
    Revisioning(Arc<RevisioningLayerSource>),
}

impl LayerSource {
    /// A source that contributes nothing.
    pub fn empty() -> Self {
        Self::Composite(Arc::new(CompositeLayerSource::new(Vec::new())))
    }

    pub fn envs<'a>(
        &'a self,
        spec: &'a ImageSpec,
    ) -> BoxFuture<'a, Result<Vec<EnvModifier>, LayerError>> {
        match self {
            Self::File(s) => s.envs(spec).boxed(),
            Self::Image(s) => s.envs(spec).boxed(),
            Self::Content(s) => s.envs(spec).boxed(),
            Self::Composite(s) => s.envs(spec).boxed(),
            Self::SpecMapped(s) => s.envs(spec).boxed(),
            Self::Revisioning(s) => s.envs(spec).boxed(),
        }
    }

    pub fn get_layers<'a>(
        &'a self,
        spec: &'a ImageSpec,
    ) -> BoxFuture<'a, Result<Vec<AddonLayer>, LayerError>> {
        match self {
            Self::File(s) => s.get_layers(spec).boxed(),
            Self::Image(s) => s.get_layers(spec).boxed(),
            Self::Content(s) => s.get_layers(spec).boxed(),
            Self::Composite(s) => s.get_layers(spec).boxed(),
            Self::SpecMapped(s) => s.get_layers(spec).boxed(),
            Self::Revisioning(s) => s.get_layers(spec).boxed(),
        }
    }

    pub fn has_blob<'a>(&'a self, spec: &'a ImageSpec, digest: &'a Digest) -> BoxFuture<'a, bool> {
        match self {
            Self::File(s) => s.has_blob(spec, digest).boxed(),
            Self::Image(s) => s.has_blob(spec, digest).boxed(),
            Self::Content(s) => s.has_blob(spec, digest).boxed(),
            Self::Composite(s) => s.has_blob(spec, digest).boxed(),
            Self::SpecMapped(s) => s.has_blob(spec, digest).boxed(),
            Self::Revisioning(s) => s.has_blob(spec, digest).boxed(),
        }
    }

    pub fn get_blob<'a>(
        &'a self,
        spec: &'a ImageSpec,
        digest: &'a Digest,
    ) -> BoxFuture<'a, Result<Blob, LayerError>> {
        match self {
            Self::File(s) => s.get_blob(spec, digest).boxed(),
            Self::Image(s) => s.get_blob(spec, digest).boxed(),
            Self::Content(s) => s.get_blob(spec, digest).boxed(),
            Self::Composite(s) => s.get_blob(spec, digest).boxed(),
            Self::SpecMapped(s) => s.get_blob(spec, digest).boxed(),
            Self::Revisioning(s) => s.get_blob(spec, digest).boxed(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Image(_) => "image",
            Self::Content(_) => "content",
            Self::Composite(_) => "composite",
            Self::SpecMapped(_) => "spec-mapped",
            Self::Revisioning(_) => "revisioning",
        }
    }
}

impl fmt::Debug for LayerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LayerSource").field(&self.kind()).finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for tests across layer modules.

    use futures_util::TryStreamExt;

    use super::*;

    pub async fn read_blob(blob: Blob) -> Bytes {
        match blob.content {
            BlobContent::Stream(s) => {
                let chunks: Vec<Bytes> = s.try_collect().await.unwrap();
                Bytes::from(chunks.concat())
            }
            BlobContent::Redirect(url) => panic!("unexpected redirect to {url}"),
        }
    }

    pub fn spec() -> ImageSpec {
        ImageSpec {
            base_ref: "example.com/base:1".to_string(),
            ..Default::default()
        }
    }
}
