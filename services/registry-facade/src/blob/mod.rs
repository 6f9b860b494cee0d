//! Blob dispatch.
//!
//! A blob request is answered by one of an ordered list of sources:
//!
//! 1. the content store (manifests, configs and anything else cached there)
//! 2. the layers of the unmodified upstream manifest, proxied
//! 3. the rewritten config, regenerated from the upstream image
//! 4. the addon layer sources
//!
//! The **last** source claiming the digest serves it. Scanning backwards and
//! stopping at the first hit picks the same source without asking the
//! earlier ones.

mod accelerator;
mod cache;

use regfac_api::ImageSpec;
use regfac_oci::{Descriptor, Digest};
use regfac_store::StoreError;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::image::{BaseImage, ManifestError, RewrittenImage};
use crate::layer::{Blob, LayerError, LayerSource};
use crate::modifier::ConfigModifier;
use crate::remote::{RemoteError, Resolver};

pub use accelerator::Accelerator;
pub use cache::BlobCache;

const DEFAULT_BLOB_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob unknown: {0}")]
    Unknown(Digest),

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error("content store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl BlobError {
    /// Whether the client should see `BLOB_UNKNOWN`.
    ///
    /// Store failures count: when the store was chosen it is the only source
    /// for the digest.
    pub fn is_unknown(&self) -> bool {
        match self {
            Self::Unknown(_) | Self::Store(_) => true,
            Self::Layer(LayerError::BlobNotFound(_)) => true,
            Self::Layer(LayerError::Remote(e)) | Self::Remote(e) => e.is_not_found(),
            Self::Manifest(e) => e.is_not_found(),
            Self::Layer(_) => false,
        }
    }
}

/// The base image of one request and its rewrite, each computed at most once.
pub struct ImageContext<'a> {
    resolver: &'a dyn Resolver,
    cache: &'a BlobCache,
    modifier: &'a ConfigModifier,
    spec: &'a ImageSpec,
    base: OnceCell<BaseImage>,
    rewritten: OnceCell<RewrittenImage>,
}

impl<'a> ImageContext<'a> {
    pub fn new(
        resolver: &'a dyn Resolver,
        cache: &'a BlobCache,
        modifier: &'a ConfigModifier,
        spec: &'a ImageSpec,
    ) -> Self {
        Self {
            resolver,
            cache,
            modifier,
            spec,
            base: OnceCell::new(),
            rewritten: OnceCell::new(),
        }
    }

    pub fn spec(&self) -> &ImageSpec {
        self.spec
    }

    pub fn cache(&self) -> &BlobCache {
        self.cache
    }

    pub async fn base(&self) -> Result<&BaseImage, ManifestError> {
        self.base
            .get_or_try_init(|| BaseImage::load(self.resolver, &self.spec.base_ref, Some(self.cache)))
            .await
    }

    pub async fn rewritten(&self) -> Result<&RewrittenImage, ManifestError> {
        let base = self.base().await?;
        self.rewritten
            .get_or_try_init(|| base.rewrite(self.spec, self.modifier, Some(self.cache)))
            .await
    }
}

/// One entry of the dispatch list.
pub enum BlobSource<'a> {
    Store(&'a BlobCache),
    Proxy(&'a ImageContext<'a>),
    Config(&'a ImageContext<'a>),
    Layers(&'a LayerSource),
}

impl BlobSource<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Proxy(_) => "proxy",
            Self::Config(_) => "config",
            Self::Layers(_) => "layers",
        }
    }

    pub async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        match self {
            Self::Store(cache) => match cache.store().exists(digest).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(digest = %digest, error = %e, "content store lookup failed");
                    false
                }
            },
            Self::Proxy(image) => match image.base().await {
                Ok(base) => base.manifest.layers.iter().any(|l| &l.digest == digest),
                Err(e) => {
                    debug!(digest = %digest, error = %e, "base image unavailable for proxying");
                    false
                }
            },
            Self::Config(image) => match image.rewritten().await {
                Ok(rewritten) => &rewritten.config_descriptor.digest == digest,
                Err(e) => {
                    debug!(digest = %digest, error = %e, "cannot regenerate config");
                    false
                }
            },
            Self::Layers(source) => source.has_blob(spec, digest).await,
        }
    }

    pub async fn get_blob(&self, spec: &ImageSpec, digest: &Digest) -> Result<Blob, BlobError> {
        match self {
            Self::Store(cache) => {
                let info = cache.store().info(digest).await?;
                let media_type = info.media_type().unwrap_or(DEFAULT_BLOB_MEDIA_TYPE).to_string();

                let redirect = match cache.accelerator() {
                    Some(acc) => acc.lookup(digest).await,
                    None => None,
                };
                if let Some(url) = redirect {
                    debug!(digest = %digest, url = %url, "redirecting to accelerator");
                    return Ok(Blob::redirect(media_type, url, Some(info.size)));
                }

                let desc = Descriptor::new(media_type.clone(), digest.clone(), info.size);
                let reader = cache.store().reader_at(&desc).await?;
                Ok(Blob::stream(media_type, Some(reader.size), reader.stream))
            }
            Self::Proxy(image) => {
                let base = image.base().await?;
                let desc = base
                    .manifest
                    .layers
                    .iter()
                    .find(|l| &l.digest == digest)
                    .ok_or_else(|| BlobError::Unknown(digest.clone()))?;
                let stream = base.fetcher.fetch(desc).await?;
                Ok(Blob::stream(desc.media_type.clone(), Some(desc.size), stream))
            }
            Self::Config(image) => {
                let rewritten = image.rewritten().await?;
                let desc = &rewritten.config_descriptor;
                if &desc.digest != digest {
                    return Err(BlobError::Unknown(digest.clone()));
                }
                Ok(Blob::from_bytes(desc.media_type.clone(), rewritten.config.clone()))
            }
            Self::Layers(source) => Ok(source.get_blob(spec, digest).await?),
        }
    }
}

/// Serves `digest` from the last source in `sources` that has it.
pub async fn dispatch(
    sources: &[BlobSource<'_>],
    spec: &ImageSpec,
    digest: &Digest,
) -> Result<Blob, BlobError> {
    for source in sources.iter().rev() {
        if source.has_blob(spec, digest).await {
            debug!(digest = %digest, source = source.kind(), "serving blob");
            return source.get_blob(spec, digest).await;
        }
    }
    Err(BlobError::Unknown(digest.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use regfac_api::ContentLayer;
    use regfac_oci::media_types;
    use regfac_store::ContentStore;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::image::testing::StaticResolver;
    use crate::layer::testing::read_blob;
    use crate::layer::{BlobContent, ContentLayerSource};

    struct Fixture {
        resolver: StaticResolver,
        cache: BlobCache,
        layers: LayerSource,
        modifier: ConfigModifier,
        spec: ImageSpec,
    }

    impl Fixture {
        fn new(cache: BlobCache) -> Self {
            let mut resolver = StaticResolver::default();
            resolver.add_image(
                "base:1",
                &json!({
                    "config": {"Env": ["FOO=bar"]},
                    "rootfs": {"type": "layers", "diff_ids": [Digest::from_bytes(b"base").to_string()]},
                }),
                &[b"base-layer"],
            );
            let layers = LayerSource::Content(Arc::new(ContentLayerSource::new()));
            Self {
                resolver,
                cache,
                modifier: ConfigModifier::new(layers.clone()),
                layers,
                spec: ImageSpec {
                    base_ref: "base:1".to_string(),
                    content_layer: vec![ContentLayer::Direct {
                        content: b"hello!".to_vec(),
                    }],
                    ..Default::default()
                },
            }
        }

        fn context(&self) -> ImageContext<'_> {
            ImageContext::new(&self.resolver, &self.cache, &self.modifier, &self.spec)
        }
    }

    async fn serve(f: &Fixture, digest: &Digest) -> Result<Blob, BlobError> {
        let image = f.context();
        let sources = [
            BlobSource::Store(&f.cache),
            BlobSource::Proxy(&image),
            BlobSource::Config(&image),
            BlobSource::Layers(&f.layers),
        ];
        dispatch(&sources, &f.spec, digest).await
    }

    #[tokio::test]
    async fn test_serves_every_kind() {
        let f = Fixture::new(BlobCache::new(ContentStore::memory(), None));

        let blob = serve(&f, &Digest::from_bytes(b"base-layer")).await.unwrap();
        assert_eq!(blob.media_type, media_types::OCI_LAYER_GZIP);
        assert_eq!(read_blob(blob).await.as_ref(), b"base-layer");

        let blob = serve(&f, &Digest::from_bytes(b"hello!")).await.unwrap();
        assert_eq!(blob.media_type, media_types::OCI_LAYER);
        assert_eq!(read_blob(blob).await.as_ref(), b"hello!");

        let rewritten = f.context().rewritten().await.unwrap().clone();
        let blob = serve(&f, &rewritten.config_descriptor.digest).await.unwrap();
        assert_eq!(blob.media_type, media_types::OCI_CONFIG);
        let bytes = read_blob(blob).await;
        assert_eq!(Digest::from_bytes(&bytes), rewritten.config_descriptor.digest);
        assert_eq!(rewritten.manifest.layers.len(), 2);
    }

    #[tokio::test]
    async fn test_last_matching_source_wins() {
        let f = Fixture::new(BlobCache::new(ContentStore::memory(), None));
        let digest = Digest::from_bytes(b"hello!");
        let desc = Descriptor::new(media_types::OCI_LAYER, digest.clone(), 6);
        f.cache
            .put(&desc, Some(&digest), Bytes::from_static(b"hello!"))
            .await
            .unwrap();

        // Store and layers both claim it; layers come later.
        let store_only = [BlobSource::Store(&f.cache)];
        assert!(store_only[0].has_blob(&f.spec, &digest).await);
        let layers = BlobSource::Layers(&f.layers);
        assert!(layers.has_blob(&f.spec, &digest).await);

        let mut remote = f.spec.clone();
        remote.content_layer = vec![ContentLayer::Remote {
            digest: digest.clone(),
            diff_id: None,
            media_type: None,
            url: "https://cdn.example.com/hello".to_string(),
            size: 6,
        }];
        let layers = LayerSource::Content(Arc::new(ContentLayerSource::new()));
        let sources = [BlobSource::Store(&f.cache), BlobSource::Layers(&layers)];
        let blob = dispatch(&sources, &remote, &digest).await.unwrap();
        assert!(matches!(blob.content, BlobContent::Redirect(_)));

        let blob = dispatch(&store_only, &remote, &digest).await.unwrap();
        assert!(matches!(blob.content, BlobContent::Stream(_)));
    }

    #[tokio::test]
    async fn test_store_redirects_to_accelerator() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let acc = Accelerator::new(reqwest::Client::new(), server.uri(), Duration::from_secs(1));
        let cache = BlobCache::new(ContentStore::memory(), Some(Arc::new(acc)));

        let desc = Descriptor::for_bytes(media_types::OCI_CONFIG, b"{}");
        cache
            .put(&desc, Some(&desc.digest), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let blob = dispatch(&[BlobSource::Store(&cache)], &ImageSpec::default(), &desc.digest)
            .await
            .unwrap();
        assert_eq!(blob.media_type, media_types::OCI_CONFIG);
        assert!(matches!(
            blob.content,
            BlobContent::Redirect(ref url) if url.ends_with(&format!("/blobs/{}", desc.digest))
        ));
    }

    #[tokio::test]
    async fn test_unknown_digest() {
        let f = Fixture::new(BlobCache::new(ContentStore::memory(), None));
        let err = serve(&f, &Digest::from_bytes(b"nothing")).await.unwrap_err();
        assert!(matches!(err, BlobError::Unknown(_)));
        assert!(err.is_unknown());
    }

    #[tokio::test]
    async fn test_missing_base_image_still_serves_layers() {
        let mut f = Fixture::new(BlobCache::new(ContentStore::memory(), None));
        f.spec.base_ref = "missing:1".to_string();

        let blob = serve(&f, &Digest::from_bytes(b"hello!")).await.unwrap();
        assert_eq!(read_blob(blob).await.as_ref(), b"hello!");
    }
}
