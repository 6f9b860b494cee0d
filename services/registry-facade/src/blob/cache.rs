use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use regfac_oci::{Descriptor, Digest};
use regfac_store::{ContentStore, StoreError};
use tracing::{debug, warn};

use super::Accelerator;

/// The content store plus the optional accelerator it mirrors writes to.
#[derive(Debug, Clone)]
pub struct BlobCache {
    store: ContentStore,
    accelerator: Option<Arc<Accelerator>>,
}

impl BlobCache {
    pub fn new(store: ContentStore, accelerator: Option<Arc<Accelerator>>) -> Self {
        Self { store, accelerator }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn accelerator(&self) -> Option<&Accelerator> {
        self.accelerator.as_deref()
    }

    /// Commits `data` under `desc.digest`.
    ///
    /// When the stored bytes are exactly the content `desc` addresses, they
    /// are also pushed to the accelerator before returning. Accelerator
    /// failures are logged only.
    pub async fn put(
        &self,
        desc: &Descriptor,
        expected: Option<&Digest>,
        data: Bytes,
    ) -> Result<(), StoreError> {
        let mut writer = self.store.writer(desc);
        writer.write(&data);
        writer.commit(expected, BTreeMap::new()).await?;
        debug!(digest = %desc.digest, size = data.len(), "stored blob");

        if let Some(acc) = &self.accelerator {
            if expected == Some(&desc.digest) {
                if let Err(e) = acc.store(&desc.digest, &desc.media_type, data).await {
                    warn!(digest = %desc.digest, error = %e, "cannot push blob to accelerator");
                }
            }
        }
        Ok(())
    }

    /// [`put`](Self::put) for callers that can do without the cache entry.
    pub async fn put_best_effort(&self, desc: &Descriptor, expected: Option<&Digest>, data: Bytes) {
        if let Err(e) = self.put(desc, expected, data).await {
            warn!(digest = %desc.digest, error = %e, "cannot cache blob");
        }
    }
}
