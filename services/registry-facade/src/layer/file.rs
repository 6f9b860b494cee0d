//! Layers loaded from local gzip files.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use futures_util::StreamExt;
use regfac_api::ImageSpec;
use regfac_oci::{media_types, Descriptor, Digest, Digester};
use tokio_util::io::ReaderStream;
use tracing::info;

use super::{AddonLayer, Blob, EnvModifier, LayerError};

#[derive(Debug, Clone)]
struct FileLayer {
    path: PathBuf,
    layer: AddonLayer,
}

/// A fixed list of layers from `.tar.gz` files, digested once at load time.
#[derive(Debug, Default)]
pub struct FileLayerSource {
    layers: Vec<FileLayer>,
}

impl FileLayerSource {
    pub async fn load(paths: &[PathBuf]) -> Result<Self, LayerError> {
        let mut layers = Vec::with_capacity(paths.len());
        for path in paths {
            let p = path.clone();
            let layer = tokio::task::spawn_blocking(move || digest_layer_file(&p))
                .await?
                .map_err(|source| LayerError::Io {
                    path: path.clone(),
                    source,
                })?;
            info!(
                path = %path.display(),
                digest = %layer.descriptor.digest,
                diff_id = %layer.diff_id,
                "loaded layer file"
            );
            layers.push(FileLayer {
                path: path.clone(),
                layer,
            });
        }
        Ok(Self { layers })
    }

    fn find(&self, digest: &Digest) -> Option<&FileLayer> {
        self.layers.iter().find(|l| &l.layer.descriptor.digest == digest)
    }

    pub async fn envs(&self, _spec: &ImageSpec) -> Result<Vec<EnvModifier>, LayerError> {
        Ok(Vec::new())
    }

    pub async fn get_layers(&self, _spec: &ImageSpec) -> Result<Vec<AddonLayer>, LayerError> {
        Ok(self.layers.iter().map(|l| l.layer.clone()).collect())
    }

    pub async fn has_blob(&self, _spec: &ImageSpec, digest: &Digest) -> bool {
        self.find(digest).is_some()
    }

    pub async fn get_blob(&self, _spec: &ImageSpec, digest: &Digest) -> Result<Blob, LayerError> {
        let layer = self
            .find(digest)
            .ok_or_else(|| LayerError::BlobNotFound(digest.clone()))?;
        let file = tokio::fs::File::open(&layer.path)
            .await
            .map_err(|source| LayerError::Io {
                path: layer.path.clone(),
                source,
            })?;
        let desc = &layer.layer.descriptor;
        Ok(Blob::stream(
            desc.media_type.clone(),
            Some(desc.size),
            ReaderStream::new(file).boxed(),
        ))
    }
}

/// Digests the compressed file and, through a decoder, its uncompressed content.
fn digest_layer_file(path: &Path) -> io::Result<AddonLayer> {
    let mut compressed = Digester::new();
    io::copy(&mut File::open(path)?, &mut compressed)?;
    let size = compressed.written();

    let mut uncompressed = Digester::new();
    io::copy(&mut GzDecoder::new(File::open(path)?), &mut uncompressed)?;

    Ok(AddonLayer {
        descriptor: Descriptor::new(media_types::OCI_LAYER_GZIP, compressed.finalize(), size),
        diff_id: uncompressed.finalize(),
    })
}
