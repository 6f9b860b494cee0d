//! Layers and env directives taken from another upstream image.

use std::sync::Arc;

use regfac_api::ImageSpec;
use regfac_oci::{Digest, ImageConfig, Manifest};
use tracing::info;

use super::{AddonLayer, Blob, EnvModifier, LayerError};
use crate::image::{download_config, download_manifest};
use crate::remote::{Fetcher, Resolver};

/// Config label telling the facade to drop the first N layers of the image.
pub const SKIP_N_LABEL: &str = "skip-n.registry-facade.dev";

const ENV_SET_PREFIX: &str = "REGFAC_ENV_SET_";
const ENV_APPEND_PREFIX: &str = "REGFAC_ENV_APPEND_";
const ENV_PREPEND_PREFIX: &str = "REGFAC_ENV_PREPEND_";

/// Layers of an upstream image, fetched once at construction.
pub struct ImageLayerSource {
    reference: String,
    layers: Vec<AddonLayer>,
    envs: Vec<EnvModifier>,
    fetcher: Arc<dyn Fetcher>,
}

impl ImageLayerSource {
    pub async fn new(resolver: &dyn Resolver, reference: &str) -> Result<Self, LayerError> {
        let (_, desc) = resolver.resolve(reference).await?;
        let fetcher = resolver.fetcher(reference).await?;
        let resolved = download_manifest(fetcher.as_ref(), &desc, None).await?;
        let config = download_config(fetcher.as_ref(), &resolved.manifest.config, None).await?;

        let source = Self::from_parts(reference, &resolved.manifest, &config, fetcher)?;
        info!(
            reference = %reference,
            layers = source.layers.len(),
            envs = source.envs.len(),
            "loaded image layer source"
        );
        Ok(source)
    }

    /// Builds the source from an already downloaded manifest and config.
    pub fn from_parts(
        reference: &str,
        manifest: &Manifest,
        config: &ImageConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, LayerError> {
        let skip = match config.label(SKIP_N_LABEL) {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .map_err(|source| LayerError::InvalidSkipLabel {
                    reference: reference.to_string(),
                    value: value.to_string(),
                    source,
                })? as usize,
            None => 0,
        };

        let diff_ids = &config.rootfs.diff_ids;
        if manifest.layers.len() != diff_ids.len() {
            return Err(LayerError::LayerCountMismatch {
                reference: reference.to_string(),
                layers: manifest.layers.len(),
                diff_ids: diff_ids.len(),
            });
        }

        let layers = manifest
            .layers
            .iter()
            .zip(diff_ids)
            .skip(skip)
            .map(|(descriptor, diff_id)| AddonLayer {
                descriptor: descriptor.clone(),
                diff_id: diff_id.clone(),
            })
            .collect();

        Ok(Self {
            reference: reference.to_string(),
            layers,
            envs: env_directives(config.env()),
            fetcher,
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn find(&self, digest: &Digest) -> Option<&AddonLayer> {
        self.layers.iter().find(|l| &l.descriptor.digest == digest)
    }

    pub async fn envs(&self, _spec: &ImageSpec) -> Result<Vec<EnvModifier>, LayerError> {
        Ok(self.envs.clone())
    }

    pub async fn get_layers(&self, _spec: &ImageSpec) -> Result<Vec<AddonLayer>, LayerError> {
        Ok(self.layers.clone())
    }

    pub async fn has_blob(&self, _spec: &ImageSpec, digest: &Digest) -> bool {
        self.find(digest).is_some()
    }

    pub async fn get_blob(&self, _spec: &ImageSpec, digest: &Digest) -> Result<Blob, LayerError> {
        let layer = self
            .find(digest)
            .ok_or_else(|| LayerError::BlobNotFound(digest.clone()))?;
        let desc = &layer.descriptor;
        let stream = self.fetcher.fetch(desc).await?;
        Ok(Blob::stream(desc.media_type.clone(), Some(desc.size), stream))
    }
}

/// Translates `REGFAC_ENV_*` entries of the source image's env into edits.
fn env_directives(env: &[String]) -> Vec<EnvModifier> {
    let mut out = Vec::new();
    for entry in env {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };

        if let Some(name) = key.strip_prefix(ENV_APPEND_PREFIX) {
            if !name.is_empty() && !value.is_empty() {
                out.push(EnvModifier::append(name, value));
            }
        } else if let Some(name) = key.strip_prefix(ENV_PREPEND_PREFIX) {
            if !name.is_empty() && !value.is_empty() {
                out.push(EnvModifier::prepend(name, value));
            }
        } else if let Some(name) = key.strip_prefix(ENV_SET_PREFIX) {
            if !name.is_empty() {
                out.push(EnvModifier::set(name, value));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::{StaticFetcher, StaticResolver};
    use crate::layer::testing::{read_blob, spec};
    use rstest::rstest;
    use serde_json::json;

    fn config(labels: serde_json::Value, env: &[&str], diff_ids: usize) -> serde_json::Value {
        let diff_ids: Vec<String> = (0..diff_ids)
            .map(|i| Digest::from_bytes(format!("diff-{i}").as_bytes()).to_string())
            .collect();
        json!({
            "config": {"Env": env, "Labels": labels},
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        })
    }

    #[tokio::test]
    async fn test_loads_layers_and_envs() {
        let mut resolver = StaticResolver::default();
        resolver.add_image(
            "ide:1",
            &config(
                json!({}),
                &["PATH=/bin", "REGFAC_ENV_SET_FOO=baz", "REGFAC_ENV_APPEND_PATH=:/ide"],
                2,
            ),
            &[b"one", b"two"],
        );

        let source = ImageLayerSource::new(&resolver, "ide:1").await.unwrap();
        let layers = source.get_layers(&spec()).await.unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].descriptor.digest, Digest::from_bytes(b"one"));
        assert_eq!(layers[1].diff_id, Digest::from_bytes(b"diff-1"));

        assert_eq!(
            source.envs(&spec()).await.unwrap(),
            vec![
                EnvModifier::set("FOO", "baz"),
                EnvModifier::append("PATH", ":/ide"),
            ]
        );

        let blob = source
            .get_blob(&spec(), &Digest::from_bytes(b"two"))
            .await
            .unwrap();
        assert_eq!(read_blob(blob).await.as_ref(), b"two");
    }

    #[rstest]
    #[case("0", 3)]
    #[case("1", 2)]
    #[case(" 2 ", 1)]
    #[case("3", 0)]
    #[case("9", 0)]
    fn test_skip_label(#[case] label: &str, #[case] expected: usize) {
        let mut resolver = StaticResolver::default();
        let cfg = config(json!({ SKIP_N_LABEL: label }), &[], 3);
        let manifest = resolver.add_image("x", &cfg, &[b"a", b"b", b"c"]);
        let cfg: ImageConfig = serde_json::from_value(cfg).unwrap();

        let source =
            ImageLayerSource::from_parts("x", &manifest, &cfg, Arc::new(StaticFetcher::new([])))
                .unwrap();
        assert_eq!(source.layers.len(), expected);
        if expected > 0 {
            assert_eq!(
                source.layers.last().unwrap().descriptor.digest,
                Digest::from_bytes(b"c")
            );
        }
    }

    #[rstest]
    #[case("-1")]
    #[case("two")]
    #[case("70000")]
    fn test_unparsable_skip_label_fails(#[case] label: &str) {
        let mut resolver = StaticResolver::default();
        let cfg = config(json!({ SKIP_N_LABEL: label }), &[], 1);
        let manifest = resolver.add_image("x", &cfg, &[b"a"]);
        let cfg: ImageConfig = serde_json::from_value(cfg).unwrap();

        let err = ImageLayerSource::from_parts("x", &manifest, &cfg, Arc::new(StaticFetcher::new([])))
            .err()
            .unwrap();
        assert!(matches!(err, LayerError::InvalidSkipLabel { .. }));
    }

    #[test]
    fn test_layer_diff_id_mismatch_fails() {
        let mut resolver = StaticResolver::default();
        let cfg = config(json!({}), &[], 1);
        let manifest = resolver.add_image("x", &cfg, &[b"a", b"b"]);
        let cfg: ImageConfig = serde_json::from_value(cfg).unwrap();

        let err = ImageLayerSource::from_parts("x", &manifest, &cfg, Arc::new(StaticFetcher::new([])))
            .err()
            .unwrap();
        assert!(matches!(err, LayerError::LayerCountMismatch { layers: 2, diff_ids: 1, .. }));
    }

    #[test]
    fn test_env_directives_ignore_empty_names_and_values() {
        let env: Vec<String> = [
            "REGFAC_ENV_SET_=x",
            "REGFAC_ENV_APPEND_PATH=",
            "REGFAC_ENV_PREPEND_PATH=/a:",
            "REGFAC_ENV_SET_EMPTY=",
            "UNRELATED=1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            env_directives(&env),
            vec![
                EnvModifier::prepend("PATH", "/a:"),
                EnvModifier::set("EMPTY", ""),
            ]
        );
    }
}
