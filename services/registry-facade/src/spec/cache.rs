use std::sync::Arc;

use async_trait::async_trait;
use regfac_api::ImageSpec;
use tracing::debug;

use super::{ImageSpecProvider, SpecError};
use crate::lru::SharedLru;

/// Remembers successful lookups of another provider, by ref.
pub struct CachingSpecProvider {
    inner: Arc<dyn ImageSpecProvider>,
    cache: SharedLru<String, ImageSpec>,
}

impl CachingSpecProvider {
    pub fn new(inner: Arc<dyn ImageSpecProvider>, capacity: usize) -> Self {
        Self {
            inner,
            cache: SharedLru::new(capacity),
        }
    }
}

#[async_trait]
impl ImageSpecProvider for CachingSpecProvider {
    async fn get_spec(&self, reference: &str) -> Result<ImageSpec, SpecError> {
        let key = reference.to_string();
        if let Some(spec) = self.cache.get(&key) {
            debug!(reference = %reference, "spec cache hit");
            return Ok(spec);
        }

        let spec = self.inner.get_spec(reference).await?;
        self.cache.put(key, spec.clone());
        Ok(spec)
    }
}
