//! Manifest and config download, through the content store when available.

use bytes::Bytes;
use regfac_oci::{media_types, Descriptor, Digest, Document, ImageConfig, Manifest};
use thiserror::Error;
use tracing::{debug, warn};

use crate::blob::BlobCache;
use crate::remote::{fetch_all, Fetcher, RemoteError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] RemoteError),

    #[error("malformed document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    #[error("index {0} lists no manifests")]
    EmptyIndex(Digest),

    #[error("index entry {0} is itself an index")]
    NestedIndex(Digest),
}

impl DownloadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fetch(e) if e.is_not_found())
    }
}

/// A single-image manifest with the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    pub media_type: String,
    pub bytes: Bytes,
}

/// Media type for a manifest read back from the store, where the outer
/// descriptor may describe the index it was resolved from.
fn cached_media_type(manifest: &Manifest, desc: &Descriptor) -> String {
    match &manifest.media_type {
        Some(mt) => mt.clone(),
        None if media_types::is_manifest(&desc.media_type) => desc.media_type.clone(),
        None => media_types::OCI_MANIFEST.to_string(),
    }
}

/// Downloads the manifest `desc` points at.
///
/// An index is resolved to its first entry regardless of platform. The
/// resolved manifest is stored under `desc`'s key, so the next lookup of the
/// same index skips resolution.
pub async fn download_manifest(
    fetcher: &dyn Fetcher,
    desc: &Descriptor,
    cache: Option<&BlobCache>,
) -> Result<ResolvedManifest, DownloadError> {
    if let Some(cache) = cache {
        match cache.store().read_all(desc).await {
            Ok(bytes) => match Document::parse(&bytes) {
                Ok(Document::Manifest(manifest)) => {
                    debug!(digest = %desc.digest, "manifest served from content store");
                    let media_type = cached_media_type(&manifest, desc);
                    return Ok(ResolvedManifest {
                        manifest,
                        media_type,
                        bytes,
                    });
                }
                Ok(Document::Index(_)) => {
                    warn!(digest = %desc.digest, "cached manifest is an index; fetching upstream");
                }
                Err(e) => {
                    warn!(digest = %desc.digest, error = %e, "cached manifest is malformed; fetching upstream");
                }
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(digest = %desc.digest, error = %e, "content store read failed; fetching upstream");
            }
        }
    }

    let bytes = fetch_all(fetcher, desc).await?;
    let (bytes, manifest, media_type, content_digest) = match Document::parse(&bytes)? {
        Document::Manifest(manifest) => {
            let media_type = if media_types::is_manifest(&desc.media_type) {
                desc.media_type.clone()
            } else {
                cached_media_type(&manifest, desc)
            };
            (bytes, manifest, media_type, desc.digest.clone())
        }
        Document::Index(index) => {
            let inner = index
                .manifests
                .first()
                .cloned()
                .ok_or_else(|| DownloadError::EmptyIndex(desc.digest.clone()))?;
            debug!(
                index = %desc.digest,
                manifest = %inner.digest,
                entries = index.manifests.len(),
                "using first manifest of index"
            );
            let inner_bytes = fetch_all(fetcher, &inner).await?;
            match Document::parse(&inner_bytes)? {
                Document::Manifest(manifest) => {
                    let media_type = if media_types::is_manifest(&inner.media_type) {
                        inner.media_type.clone()
                    } else {
                        cached_media_type(&manifest, &inner)
                    };
                    (inner_bytes, manifest, media_type, inner.digest)
                }
                Document::Index(_) => return Err(DownloadError::NestedIndex(inner.digest)),
            }
        }
    };

    if !media_types::is_manifest(&media_type) {
        return Err(DownloadError::UnsupportedMediaType(media_type));
    }

    if let Some(cache) = cache {
        cache
            .put_best_effort(desc, Some(&content_digest), bytes.clone())
            .await;
    }

    Ok(ResolvedManifest {
        manifest,
        media_type,
        bytes,
    })
}

/// Downloads and parses an image config.
pub async fn download_config(
    fetcher: &dyn Fetcher,
    desc: &Descriptor,
    cache: Option<&BlobCache>,
) -> Result<ImageConfig, DownloadError> {
    if let Some(cache) = cache {
        match cache.store().read_all(desc).await {
            Ok(bytes) => match ImageConfig::from_slice(&bytes) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!(digest = %desc.digest, error = %e, "cached config is malformed; fetching upstream");
                }
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(digest = %desc.digest, error = %e, "content store read failed; fetching upstream");
            }
        }
    }

    let bytes = fetch_all(fetcher, desc).await?;
    let config = ImageConfig::from_slice(&bytes)?;

    if let Some(cache) = cache {
        cache
            .put_best_effort(desc, Some(&desc.digest), bytes)
            .await;
    }
    Ok(config)
}
