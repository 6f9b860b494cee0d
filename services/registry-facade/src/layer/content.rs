//! Layers described directly inside an image spec.

use bytes::Bytes;
use regfac_api::{ContentLayer, ImageSpec};
use regfac_oci::{media_types, Descriptor, Digest};

use super::{AddonLayer, Blob, EnvModifier, LayerError};
use crate::lru::{SharedLru, DEFAULT_CAPACITY};

/// Serves the `content_layer` entries of whichever spec it is asked about.
///
/// Direct layers are digested on each lookup; their bytes are kept in a
/// small LRU so a blob request following a manifest request does not need
/// the spec to carry the same content again.
pub struct ContentLayerSource {
    blobs: SharedLru<Digest, Bytes>,
}

impl Default for ContentLayerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentLayerSource {
    pub fn new() -> Self {
        Self {
            blobs: SharedLru::new(DEFAULT_CAPACITY),
        }
    }

    fn layer(&self, layer: &ContentLayer) -> AddonLayer {
        match layer {
            ContentLayer::Direct { content } => {
                let data = Bytes::copy_from_slice(content);
                let descriptor = Descriptor::for_bytes(media_types::OCI_LAYER, &data);
                self.blobs.put(descriptor.digest.clone(), data);
                AddonLayer {
                    diff_id: descriptor.digest.clone(),
                    descriptor,
                }
            }
            ContentLayer::Remote {
                digest,
                diff_id,
                media_type,
                url,
                size,
            } => {
                let mut descriptor = Descriptor::new(
                    ContentLayer::remote_media_type(digest, diff_id.as_ref(), media_type.as_deref()),
                    digest.clone(),
                    *size,
                );
                if !url.is_empty() {
                    descriptor.urls = Some(vec![url.clone()]);
                }
                AddonLayer {
                    descriptor,
                    diff_id: diff_id.clone().unwrap_or_else(|| digest.clone()),
                }
            }
        }
    }

    pub async fn envs(&self, _spec: &ImageSpec) -> Result<Vec<EnvModifier>, LayerError> {
        Ok(Vec::new())
    }

    pub async fn get_layers(&self, spec: &ImageSpec) -> Result<Vec<AddonLayer>, LayerError> {
        Ok(spec.content_layer.iter().map(|l| self.layer(l)).collect())
    }

    pub async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        if self.blobs.get(digest).is_some() {
            return true;
        }
        spec.content_layer.iter().any(|layer| match layer {
            ContentLayer::Direct { content } => &Digest::from_bytes(content) == digest,
            ContentLayer::Remote { digest: d, .. } => d == digest,
        })
    }

    pub async fn get_blob(&self, spec: &ImageSpec, digest: &Digest) -> Result<Blob, LayerError> {
        if let Some(data) = self.blobs.get(digest) {
            return Ok(Blob::from_bytes(media_types::OCI_LAYER, data));
        }

        for layer in &spec.content_layer {
            match layer {
                ContentLayer::Direct { content } => {
                    if &Digest::from_bytes(content) == digest {
                        let data = Bytes::copy_from_slice(content);
                        self.blobs.put(digest.clone(), data.clone());
                        return Ok(Blob::from_bytes(media_types::OCI_LAYER, data));
                    }
                }
                ContentLayer::Remote {
                    digest: d,
                    diff_id,
                    media_type,
                    url,
                    size,
                } if d == digest => {
                    let mt = ContentLayer::remote_media_type(d, diff_id.as_ref(), media_type.as_deref());
                    return Ok(Blob::redirect(mt, url.clone(), Some(*size)));
                }
                ContentLayer::Remote { .. } => {}
            }
        }
        Err(LayerError::BlobNotFound(digest.clone()))
    }
}
