use std::fmt;
use std::sync::Arc;

use regfac_api::ImageSpec;
use regfac_oci::Digest;
use tracing::{debug, warn};

use super::{AddonLayer, Blob, EnvModifier, ImageLayerSource, LayerError};
use crate::lru::{SharedLru, DEFAULT_CAPACITY};
use crate::remote::Resolver;

/// Picks the image reference a spec wants layers from, if any.
pub type RefProjection = Box<dyn Fn(&ImageSpec) -> Option<String> + Send + Sync>;

/// An image-backed source chosen per spec.
///
/// The projection maps a spec to an image reference; an [`ImageLayerSource`]
/// is built the first time a reference is seen and kept in an LRU. Specs that
/// project to nothing contribute nothing.
pub struct SpecMappedImageSource {
    resolver: Arc<dyn Resolver>,
    project: RefProjection,
    sources: SharedLru<String, Arc<ImageLayerSource>>,
}

impl SpecMappedImageSource {
    pub fn new(resolver: Arc<dyn Resolver>, project: RefProjection) -> Self {
        Self::with_capacity(resolver, project, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(resolver: Arc<dyn Resolver>, project: RefProjection, capacity: usize) -> Self {
        Self {
            resolver,
            project,
            sources: SharedLru::new(capacity),
        }
    }

    /// Projects the IDE image reference.
    pub fn ide(resolver: Arc<dyn Resolver>) -> Self {
        Self::new(resolver, Box::new(|spec: &ImageSpec| spec.ide_ref.clone()))
    }

    /// Projects the desktop IDE image reference.
    pub fn desktop_ide(resolver: Arc<dyn Resolver>) -> Self {
        Self::new(resolver, Box::new(|spec: &ImageSpec| spec.desktop_ide_ref.clone()))
    }

    async fn source(&self, spec: &ImageSpec) -> Result<Option<Arc<ImageLayerSource>>, LayerError> {
        let Some(reference) = (self.project)(spec).filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        if let Some(source) = self.sources.get(&reference) {
            return Ok(Some(source));
        }

        debug!(reference = %reference, "building image layer source");
        let source = Arc::new(ImageLayerSource::new(self.resolver.as_ref(), &reference).await?);
        self.sources.put(reference, source.clone());
        Ok(Some(source))
    }

    pub async fn envs(&self, spec: &ImageSpec) -> Result<Vec<EnvModifier>, LayerError> {
        match self.source(spec).await? {
            Some(source) => source.envs(spec).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_layers(&self, spec: &ImageSpec) -> Result<Vec<AddonLayer>, LayerError> {
        match self.source(spec).await? {
            Some(source) => source.get_layers(spec).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        match self.source(spec).await {
            Ok(Some(source)) => source.has_blob(spec, digest).await,
            Ok(None) => false,
            Err(e) => {
                warn!(digest = %digest, error = %e, "cannot build image layer source");
                false
            }
        }
    }

    pub async fn get_blob(&self, spec: &ImageSpec, digest: &Digest) -> Result<Blob, LayerError> {
        match self.source(spec).await? {
            Some(source) => source.get_blob(spec, digest).await,
            None => Err(LayerError::BlobNotFound(digest.clone())),
        }
    }
}

impl fmt::Debug for SpecMappedImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecMappedImageSource")
            .field("cached", &self.sources.len())
            .finish()
    }
}
