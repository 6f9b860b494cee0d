use std::sync::Arc;

use arc_swap::ArcSwap;
use regfac_api::ImageSpec;
use regfac_oci::Digest;
use tracing::info;

use super::{AddonLayer, Blob, EnvModifier, LayerError, LayerSource};

/// Immutable view of the sources at one point in time.
#[derive(Debug)]
struct Revision {
    active: LayerSource,
    /// Previously active sources, oldest first.
    past: Vec<LayerSource>,
}

impl Revision {
    /// Active first, then past sources in the order they were replaced.
    fn lookup_order(&self) -> impl Iterator<Item = &LayerSource> {
        std::iter::once(&self.active).chain(self.past.iter())
    }
}

/// A hot-swappable source that keeps serving blobs of replaced sources.
///
/// Manifests are built from the active source only. Blob lookups also fall
/// back to every source that was ever active, so a client holding a manifest
/// from before an [`update`](Self::update) can still pull its layers. Past
/// sources are never dropped.
pub struct RevisioningLayerSource {
    current: ArcSwap<Revision>,
}

impl RevisioningLayerSource {
    pub fn new(active: LayerSource) -> Self {
        Self {
            current: ArcSwap::from_pointee(Revision {
                active,
                past: Vec::new(),
            }),
        }
    }

    /// Installs `source` as the active source and demotes the previous one.
    pub fn update(&self, source: LayerSource) {
        let previous = self.current.rcu(|rev| {
            let mut past = rev.past.clone();
            past.push(rev.active.clone());
            Arc::new(Revision {
                active: source.clone(),
                past,
            })
        });
        info!(
            past_revisions = previous.past.len() + 1,
            "layer source revision updated"
        );
    }

    pub fn past_len(&self) -> usize {
        self.current.load().past.len()
    }

    pub async fn envs(&self, spec: &ImageSpec) -> Result<Vec<EnvModifier>, LayerError> {
        let rev = self.current.load_full();
        rev.active.envs(spec).await
    }

    pub async fn get_layers(&self, spec: &ImageSpec) -> Result<Vec<AddonLayer>, LayerError> {
        let rev = self.current.load_full();
        rev.active.get_layers(spec).await
    }

    pub async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        let rev = self.current.load_full();
        for source in rev.lookup_order() {
            if source.has_blob(spec, digest).await {
                return true;
            }
        }
        false
    }

    pub async fn get_blob(&self, spec: &ImageSpec, digest: &Digest) -> Result<Blob, LayerError> {
        let rev = self.current.load_full();
        for source in rev.lookup_order() {
            if source.has_blob(spec, digest).await {
                return source.get_blob(spec, digest).await;
            }
        }
        Err(LayerError::BlobNotFound(digest.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    use super::*;
    use crate::layer::testing::{read_blob, spec};
    use crate::layer::FileLayerSource;

    async fn file_source(dir: &Path, name: &str, content: &[u8]) -> (LayerSource, Digest) {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(content).unwrap();
        let gz = enc.finish().unwrap();
        let path: PathBuf = dir.join(name);
        std::fs::write(&path, &gz).unwrap();

        let source = FileLayerSource::load(&[path]).await.unwrap();
        (LayerSource::File(Arc::new(source)), Digest::from_bytes(&gz))
    }

    #[tokio::test]
    async fn test_update_keeps_past_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let (s0, d0) = file_source(dir.path(), "s0.tar.gz", b"first").await;
        let (s1, d1) = file_source(dir.path(), "s1.tar.gz", b"second").await;

        let rev = RevisioningLayerSource::new(s0);
        rev.update(s1);
        assert_eq!(rev.past_len(), 1);

        let layers = rev.get_layers(&spec()).await.unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].descriptor.digest, d1);

        assert!(rev.has_blob(&spec(), &d0).await);
        assert!(rev.has_blob(&spec(), &d1).await);
        let blob = rev.get_blob(&spec(), &d0).await.unwrap();
        assert!(!read_blob(blob).await.is_empty());
    }

    #[tokio::test]
    async fn test_past_grows_with_every_update() {
        let rev = RevisioningLayerSource::new(LayerSource::empty());
        for _ in 0..3 {
            rev.update(LayerSource::empty());
        }
        assert_eq!(rev.past_len(), 3);

        let digest = Digest::from_bytes(b"x");
        assert!(!rev.has_blob(&spec(), &digest).await);
        assert!(matches!(
            rev.get_blob(&spec(), &digest).await,
            Err(LayerError::BlobNotFound(_))
        ));
    }
}
