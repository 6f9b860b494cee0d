//! The manifest pipeline: resolve a base image and rewrite it for a spec.

mod download;

use std::sync::Arc;

use bytes::Bytes;
use regfac_api::ImageSpec;
use regfac_oci::{media_types, Descriptor, Digest, Manifest};
use thiserror::Error;
use tracing::debug;

use crate::blob::BlobCache;
use crate::layer::LayerError;
use crate::modifier::ConfigModifier;
use crate::remote::{Fetcher, RemoteError, Resolver};

pub use download::{download_config, download_manifest, DownloadError, ResolvedManifest};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot resolve {reference}: {source}")]
    Resolve {
        reference: String,
        source: RemoteError,
    },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("cannot modify image: {0}")]
    Modify(#[from] LayerError),

    #[error("cannot serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ManifestError {
    /// The upstream image (or part of it) does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Resolve { source, .. } => source.is_not_found(),
            Self::Download(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// The upstream content exists but is not a usable image.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            Self::Download(
                DownloadError::Parse(_)
                    | DownloadError::UnsupportedMediaType(_)
                    | DownloadError::EmptyIndex(_)
                    | DownloadError::NestedIndex(_)
            )
        )
    }
}

/// An upstream image, resolved down to a single manifest.
pub struct BaseImage {
    pub name: String,
    pub fetcher: Arc<dyn Fetcher>,
    pub manifest: Manifest,
    pub media_type: String,
}

impl BaseImage {
    pub async fn load(
        resolver: &dyn Resolver,
        reference: &str,
        cache: Option<&BlobCache>,
    ) -> Result<Self, ManifestError> {
        let resolve_err = |source| ManifestError::Resolve {
            reference: reference.to_string(),
            source,
        };
        let (name, desc) = resolver.resolve(reference).await.map_err(resolve_err)?;
        let fetcher = resolver.fetcher(reference).await.map_err(resolve_err)?;
        let resolved = download_manifest(fetcher.as_ref(), &desc, cache).await?;

        debug!(
            reference = %reference,
            digest = %desc.digest,
            layers = resolved.manifest.layers.len(),
            "loaded base image"
        );
        Ok(Self {
            name,
            fetcher,
            manifest: resolved.manifest,
            media_type: resolved.media_type,
        })
    }

    /// Applies the modifier to a copy of this image.
    ///
    /// The result depends only on the upstream image and what the modifier
    /// returns for `spec`, so rewriting twice yields byte-identical configs.
    pub async fn rewrite(
        &self,
        spec: &ImageSpec,
        modifier: &ConfigModifier,
        cache: Option<&BlobCache>,
    ) -> Result<RewrittenImage, ManifestError> {
        let mut config =
            download_config(self.fetcher.as_ref(), &self.manifest.config, cache).await?;
        let mut manifest = self.manifest.clone();
        modifier.modify(spec, &mut manifest, &mut config).await?;

        let config = Bytes::from(config.to_vec()?);
        let config_descriptor = Descriptor::new(
            self.manifest.config.media_type.clone(),
            Digest::from_bytes(&config),
            config.len() as u64,
        );
        manifest.config = config_descriptor.clone();

        // Docker clients reject schema 2 manifests without an explicit type.
        if self.media_type == media_types::DOCKER_MANIFEST {
            manifest.media_type = Some(media_types::DOCKER_MANIFEST.to_string());
        }

        Ok(RewrittenImage {
            manifest,
            media_type: self.media_type.clone(),
            config,
            config_descriptor,
        })
    }
}

/// A base image after layers and env have been injected.
#[derive(Debug, Clone)]
pub struct RewrittenImage {
    pub manifest: Manifest,
    pub media_type: String,
    pub config: Bytes,
    pub config_descriptor: Descriptor,
}

impl RewrittenImage {
    pub fn manifest_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(&self.manifest)?))
    }
}
