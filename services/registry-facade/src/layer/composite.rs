use regfac_api::ImageSpec;
use regfac_oci::Digest;

use super::{AddonLayer, Blob, EnvModifier, LayerError, LayerSource};

/// Union of child sources.
///
/// Layers and env edits are concatenated in child order. Blobs are served by
/// the first child that reports having them, the same scan `has_blob` does.
#[derive(Debug, Default)]
pub struct CompositeLayerSource {
    children: Vec<LayerSource>,
}

impl CompositeLayerSource {
    pub fn new(children: Vec<LayerSource>) -> Self {
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub async fn envs(&self, spec: &ImageSpec) -> Result<Vec<EnvModifier>, LayerError> {
        let mut out = Vec::new();
        for child in &self.children {
            out.extend(child.envs(spec).await?);
        }
        Ok(out)
    }

    pub async fn get_layers(&self, spec: &ImageSpec) -> Result<Vec<AddonLayer>, LayerError> {
        let mut out = Vec::new();
        for child in &self.children {
            out.extend(child.get_layers(spec).await?);
        }
        Ok(out)
    }

    async fn find(&self, spec: &ImageSpec, digest: &Digest) -> Option<&LayerSource> {
        for child in &self.children {
            if child.has_blob(spec, digest).await {
                return Some(child);
            }
        }
        None
    }

    pub async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        self.find(spec, digest).await.is_some()
    }

    pub async fn get_blob(&self, spec: &ImageSpec, digest: &Digest) -> Result<Blob, LayerError> {
        match self.find(spec, digest).await {
            Some(child) => child.get_blob(spec, digest).await,
            None => Err(LayerError::BlobNotFound(digest.clone())),
        }
    }
}
