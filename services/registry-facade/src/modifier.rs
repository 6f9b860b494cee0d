//! Folds addon layers and env edits into an upstream manifest and config.

use regfac_api::ImageSpec;
use regfac_oci::{ImageConfig, Manifest};
use tracing::debug;

use crate::layer::{LayerError, LayerSource, ParsedEnvs};

/// Applies what a [`LayerSource`] contributes for a spec.
#[derive(Debug, Clone)]
pub struct ConfigModifier {
    source: LayerSource,
}

impl ConfigModifier {
    pub fn new(source: LayerSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &LayerSource {
        &self.source
    }

    /// Appends the source's layers to `manifest.layers` and their diff IDs to
    /// `config.rootfs.diff_ids`, then applies its env edits in order.
    ///
    /// Both lookups complete before anything is changed, so on error the
    /// manifest and config are untouched.
    pub async fn modify(
        &self,
        spec: &ImageSpec,
        manifest: &mut Manifest,
        config: &mut ImageConfig,
    ) -> Result<(), LayerError> {
        let layers = self.source.get_layers(spec).await?;
        let envs = self.source.envs(spec).await?;

        debug!(
            base = %spec.base_ref,
            layers = layers.len(),
            envs = envs.len(),
            "modifying image config"
        );

        for layer in layers {
            manifest.layers.push(layer.descriptor);
            config.rootfs.diff_ids.push(layer.diff_id);
        }

        if !envs.is_empty() {
            let mut parsed = ParsedEnvs::parse(config.env());
            for env in &envs {
                parsed.apply(env);
            }
            config.set_env(parsed.to_env());
        }
        Ok(())
    }
}
