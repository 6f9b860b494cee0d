//! The facade itself: spec lookup, manifest rewriting and blob dispatch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use regfac_api::{ImageSpec, PROVIDER_FIXED, PROVIDER_REMOTE};
use regfac_oci::Digest;
use regfac_store::ContentStore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blob::{self, Accelerator, BlobCache, BlobError, BlobSource, ImageContext};
use crate::config::{Config, StaticLayerConfig, StaticLayerKind, StoreConfig};
use crate::image::ManifestError;
use crate::layer::{
    Blob, CompositeLayerSource, ContentLayerSource, FileLayerSource, ImageLayerSource,
    LayerError, LayerSource, RevisioningLayerSource, SpecMappedImageSource,
};
use crate::modifier::ConfigModifier;
use crate::remote::{CachingResolver, RegistryResolver, Resolver, RetryableClient};
use crate::spec::{
    CachingSpecProvider, FixedSpecProvider, ImageSpecProvider, RemoteSpecProvider, TlsMaterial,
};

/// Failure to find the spec a repository name refers to.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("repository name {0:?} has no spec ref")]
    MissingRef(String),

    #[error("unknown spec provider {0:?}")]
    UnknownProvider(String),

    #[error(transparent)]
    Spec(#[from] crate::spec::SpecError),
}

/// A rewritten manifest ready to be written to a client.
#[derive(Debug, Clone)]
pub struct ServedManifest {
    pub bytes: Bytes,
    pub digest: Digest,
    pub media_type: String,
}

pub struct Registry {
    resolver: Arc<dyn Resolver>,
    cache: BlobCache,
    static_layers: Arc<RevisioningLayerSource>,
    layers: LayerSource,
    modifier: ConfigModifier,
    spec_providers: HashMap<String, Arc<dyn ImageSpecProvider>>,
}

impl Registry {
    /// Addon layers are, in order: the IDE image, the desktop IDE image,
    /// the static layers and the spec's content layers. Env edits apply in
    /// the same order, so a static `set` overrides one from the IDE image.
    pub fn new(
        resolver: Arc<dyn Resolver>,
        cache: BlobCache,
        static_layers: LayerSource,
        spec_providers: HashMap<String, Arc<dyn ImageSpecProvider>>,
    ) -> Self {
        let static_layers = Arc::new(RevisioningLayerSource::new(static_layers));
        let layers = LayerSource::Composite(Arc::new(CompositeLayerSource::new(vec![
            LayerSource::SpecMapped(Arc::new(SpecMappedImageSource::ide(resolver.clone()))),
            LayerSource::SpecMapped(Arc::new(SpecMappedImageSource::desktop_ide(
                resolver.clone(),
            ))),
            LayerSource::Revisioning(static_layers.clone()),
            LayerSource::Content(Arc::new(ContentLayerSource::new())),
        ])));

        Self {
            modifier: ConfigModifier::new(layers.clone()),
            resolver,
            cache,
            static_layers,
            layers,
            spec_providers,
        }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream.request_timeout())
            .build()
            .context("cannot build HTTP client")?;

        let registry_resolver = RegistryResolver::new(
            RetryableClient::new(http.clone(), config.upstream.retry_policy()),
            config.upstream.insecure_registries.clone(),
        );
        let resolver: Arc<dyn Resolver> = Arc::new(CachingResolver::new(Arc::new(registry_resolver)));

        let store = match &config.store {
            StoreConfig::Local { path } => {
                tokio::fs::create_dir_all(path)
                    .await
                    .with_context(|| format!("cannot create store directory {}", path.display()))?;
                ContentStore::local(path.clone())
            }
            StoreConfig::Redis { url } => ContentStore::redis(url)
                .await
                .context("cannot connect to redis content store")?,
            StoreConfig::Memory => ContentStore::memory(),
        };
        let accelerator = config
            .accelerator
            .as_ref()
            .map(|acc| Arc::new(Accelerator::new(http.clone(), acc.url.clone(), acc.lookup_timeout())));
        let cache = BlobCache::new(store, accelerator);

        let mut spec_providers: HashMap<String, Arc<dyn ImageSpecProvider>> = HashMap::new();
        if let Some(remote) = &config.remote_spec_provider {
            let tls = match &remote.tls {
                Some(tls) => Some(
                    TlsMaterial::load(&tls.authority, &tls.certificate, &tls.private_key)
                        .await
                        .context("cannot load spec provider TLS material")?,
                ),
                None => None,
            };
            let provider = RemoteSpecProvider::new(
                &remote.addr,
                tls,
                Duration::from_secs(remote.request_timeout_secs),
            )
            .context("cannot create remote spec provider")?;
            spec_providers.insert(
                PROVIDER_REMOTE.to_string(),
                Arc::new(CachingSpecProvider::new(Arc::new(provider), remote.cache_size)),
            );
        }
        if let Some(path) = &config.fixed_spec_provider {
            let provider = FixedSpecProvider::load(path)
                .await
                .context("cannot load fixed spec provider")?;
            spec_providers.insert(PROVIDER_FIXED.to_string(), Arc::new(provider));
        }
        if spec_providers.is_empty() {
            warn!("no spec provider configured; every pull will fail");
        }

        let static_layers = build_static_layers(resolver.as_ref(), &config.static_layer)
            .await
            .context("cannot build static layers")?;

        info!(
            providers = ?spec_providers.keys().collect::<Vec<_>>(),
            static_layers = config.static_layer.len(),
            "registry initialised"
        );
        Ok(Self::new(resolver, cache, static_layers, spec_providers))
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    /// Rebuilds the static layers and makes them active. Blobs of the
    /// previous static layers stay servable.
    pub async fn update_static_layers(&self, cfg: &[StaticLayerConfig]) -> Result<(), LayerError> {
        let source = build_static_layers(self.resolver.as_ref(), cfg).await?;
        self.set_static_layers(source);
        Ok(())
    }

    pub fn set_static_layers(&self, source: LayerSource) {
        self.static_layers.update(source);
    }

    /// Looks up the spec for a repository name of the form
    /// `{provider}/{spec ref}`.
    pub async fn spec(&self, name: &str) -> Result<ImageSpec, LookupError> {
        let (provider, reference) = name
            .split_once('/')
            .filter(|(_, r)| !r.is_empty())
            .ok_or_else(|| LookupError::MissingRef(name.to_string()))?;
        let provider_impl = self
            .spec_providers
            .get(provider)
            .ok_or_else(|| LookupError::UnknownProvider(provider.to_string()))?;

        debug!(spec_provider = %provider, reference = %reference, "looking up spec");
        Ok(provider_impl.get_spec(reference).await?)
    }

    /// Produces the rewritten manifest for `spec`.
    pub async fn manifest(&self, spec: &ImageSpec) -> Result<ServedManifest, ManifestError> {
        let image = self.context(spec);
        let rewritten = image.rewritten().await?;

        // Saves regenerating the config when it is requested next.
        self.cache
            .put_best_effort(
                &rewritten.config_descriptor,
                Some(&rewritten.config_descriptor.digest),
                rewritten.config.clone(),
            )
            .await;

        let bytes = rewritten.manifest_bytes()?;
        let digest = Digest::from_bytes(&bytes);
        debug!(
            base = %spec.base_ref,
            digest = %digest,
            layers = rewritten.manifest.layers.len(),
            "rewrote manifest"
        );
        Ok(ServedManifest {
            bytes,
            digest,
            media_type: rewritten.media_type.clone(),
        })
    }

    /// Serves a blob of the image `spec` describes.
    pub async fn blob(&self, spec: &ImageSpec, digest: &Digest) -> Result<Blob, BlobError> {
        let image = self.context(spec);
        let sources = [
            BlobSource::Store(&self.cache),
            BlobSource::Proxy(&image),
            BlobSource::Config(&image),
            BlobSource::Layers(&self.layers),
        ];
        blob::dispatch(&sources, spec, digest).await
    }

    fn context<'a>(&'a self, spec: &'a ImageSpec) -> ImageContext<'a> {
        ImageContext::new(self.resolver.as_ref(), &self.cache, &self.modifier, spec)
    }
}

async fn build_static_layers(
    resolver: &dyn Resolver,
    cfg: &[StaticLayerConfig],
) -> Result<LayerSource, LayerError> {
    let mut sources = Vec::with_capacity(cfg.len());
    for layer in cfg {
        let source = match layer.kind {
            StaticLayerKind::File => LayerSource::File(Arc::new(
                FileLayerSource::load(&[PathBuf::from(&layer.reference)]).await?,
            )),
            StaticLayerKind::Image => LayerSource::Image(Arc::new(
                ImageLayerSource::new(resolver, &layer.reference).await?,
            )),
        };
        sources.push(source);
    }
    Ok(LayerSource::Composite(Arc::new(CompositeLayerSource::new(sources))))
}
