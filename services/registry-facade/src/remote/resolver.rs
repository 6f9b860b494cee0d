//! Reference resolution and content fetching against upstream registries.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use regfac_oci::{media_types, Descriptor, Digest, Document};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use tracing::{debug, info};

use super::auth::{BearerChallenge, TokenResponse};
use super::client::RetryableClient;
use super::error::RemoteError;
use super::reference::Reference;
use crate::lru::{SharedLru, DEFAULT_CAPACITY};

/// Body of a fetched blob or manifest.
pub type BlobStream = BoxStream<'static, io::Result<Bytes>>;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Fetches content of one repository by descriptor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, desc: &Descriptor) -> Result<BlobStream, RemoteError>;
}

/// Turns references into descriptors and repository-scoped fetchers.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Returns the normalized name and the descriptor the reference points at.
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor), RemoteError>;

    async fn fetcher(&self, reference: &str) -> Result<Arc<dyn Fetcher>, RemoteError>;
}

/// Reads a whole fetched object into memory.
pub async fn fetch_all(fetcher: &dyn Fetcher, desc: &Descriptor) -> Result<Bytes, RemoteError> {
    let stream = fetcher.fetch(desc).await?;
    let chunks: Vec<Bytes> = stream.try_collect().await?;
    Ok(Bytes::from(chunks.concat()))
}

/// Resolver talking the distribution API to whatever registry a reference names.
#[derive(Clone)]
pub struct RegistryResolver {
    upstream: Arc<Upstream>,
}

struct Upstream {
    client: RetryableClient,
    insecure_registries: Vec<String>,
    /// Bearer tokens by `registry/repository`, least recently used evicted first.
    tokens: SharedLru<String, String>,
}

impl RegistryResolver {
    pub fn new(client: RetryableClient, insecure_registries: Vec<String>) -> Self {
        Self::with_token_capacity(client, insecure_registries, DEFAULT_CAPACITY)
    }

    pub fn with_token_capacity(
        client: RetryableClient,
        insecure_registries: Vec<String>,
        token_capacity: usize,
    ) -> Self {
        Self {
            upstream: Arc::new(Upstream {
                client,
                insecure_registries,
                tokens: SharedLru::new(token_capacity),
            }),
        }
    }
}

impl Upstream {
    async fn request(
        &self,
        reference: &Reference,
        method: Method,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, RemoteError> {
        let scope = format!("{}/{}", reference.registry, reference.repository);
        let token = self.tokens.get(&scope);

        let resp = self.send(&method, url, accept, token.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(challenge) = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Err(RemoteError::AuthRequired(scope));
        };

        let token = self.fetch_token(&challenge).await?;
        self.tokens.put(scope.clone(), token.clone());
        debug!(scope = %scope, "obtained upstream bearer token");

        let resp = self.send(&method, url, accept, Some(&token)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::AuthRequired(scope));
        }
        Ok(resp)
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        accept: Option<&str>,
        token: Option<&str>,
    ) -> Result<Response, reqwest::Error> {
        self.client
            .send(|c| {
                let mut rb = c.request(method.clone(), url);
                if let Some(accept) = accept {
                    rb = rb.header(ACCEPT, accept);
                }
                if let Some(token) = token {
                    rb = rb.bearer_auth(token);
                }
                rb
            })
            .await
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, RemoteError> {
        let query = challenge.query();
        let resp = self
            .client
            .send(|c| c.get(&challenge.realm).query(&query))
            .await?;
        let resp = check_status(resp, &challenge.realm)?;
        let body: TokenResponse = resp.json().await?;
        body.into_token()
            .ok_or_else(|| RemoteError::AuthRequired(challenge.realm.clone()))
    }
}

/// Maps a response to an error unless it is a success.
fn check_status(resp: Response, what: &str) -> Result<Response, RemoteError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(what.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RemoteError::AuthRequired(what.to_string()))
        }
        status => Err(RemoteError::UnexpectedStatus {
            status,
            url: resp.url().to_string(),
        }),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `Content-Type` without parameters.
fn media_type_of(headers: &HeaderMap) -> Option<String> {
    header_str(headers, CONTENT_TYPE)
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|mt| media_types::is_manifest(mt) || media_types::is_index(mt))
}

/// Builds a descriptor from a `HEAD` response, if it carries everything.
fn descriptor_from_headers(headers: &HeaderMap, pinned: Option<&Digest>) -> Option<Descriptor> {
    let media_type = media_type_of(headers)?;
    let digest = match pinned {
        Some(d) => d.clone(),
        None => Digest::parse(header_str(headers, DOCKER_CONTENT_DIGEST)?).ok()?,
    };
    let size: u64 = header_str(headers, CONTENT_LENGTH)?.parse().ok()?;
    if size == 0 {
        return None;
    }
    Some(Descriptor::new(media_type, digest, size))
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor), RemoteError> {
        let r = Reference::parse(reference)?;
        let url = format!(
            "{}/manifests/{}",
            r.repository_url(&self.upstream.insecure_registries),
            r.object
        );

        let head = self
            .upstream
            .request(&r, Method::HEAD, &url, Some(media_types::MANIFEST_ACCEPT))
            .await?;
        if head.status().is_success() {
            if let Some(desc) = descriptor_from_headers(head.headers(), r.digest()) {
                debug!(reference = %r, digest = %desc.digest, "resolved via HEAD");
                return Ok((r.to_string(), desc));
            }
        }

        // Some registries do not answer HEAD, or answer it without headers.
        let resp = self
            .upstream
            .request(&r, Method::GET, &url, Some(media_types::MANIFEST_ACCEPT))
            .await?;
        let resp = check_status(resp, reference)?;
        let header_media_type = media_type_of(resp.headers());
        let body = resp.bytes().await?;

        let digest = match r.digest() {
            Some(pinned) => {
                let computed = pinned.rehash(&body);
                if pinned != &computed {
                    return Err(RemoteError::DigestMismatch {
                        expected: pinned.to_string(),
                        actual: computed.to_string(),
                    });
                }
                computed
            }
            None => Digest::from_bytes(&body),
        };

        let media_type = match header_media_type {
            Some(mt) => mt,
            None => Document::parse(&body)?.media_type().to_string(),
        };

        info!(reference = %r, digest = %digest, media_type = %media_type, "resolved reference");
        Ok((
            r.to_string(),
            Descriptor::new(media_type, digest, body.len() as u64),
        ))
    }

    async fn fetcher(&self, reference: &str) -> Result<Arc<dyn Fetcher>, RemoteError> {
        let reference = Reference::parse(reference)?;
        Ok(Arc::new(RegistryFetcher {
            upstream: self.upstream.clone(),
            reference,
        }))
    }
}

struct RegistryFetcher {
    upstream: Arc<Upstream>,
    reference: Reference,
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(&self, desc: &Descriptor) -> Result<BlobStream, RemoteError> {
        let base = self
            .reference
            .repository_url(&self.upstream.insecure_registries);
        let is_manifest =
            media_types::is_manifest(&desc.media_type) || media_types::is_index(&desc.media_type);
        let (url, accept) = if is_manifest {
            (
                format!("{base}/manifests/{}", desc.digest),
                Some(media_types::MANIFEST_ACCEPT),
            )
        } else {
            (format!("{base}/blobs/{}", desc.digest), None)
        };

        debug!(url = %url, "fetching upstream content");
        let resp = self
            .upstream
            .request(&self.reference, Method::GET, &url, accept)
            .await?;
        let resp = check_status(resp, desc.digest.as_str())?;
        Ok(resp.bytes_stream().map_err(io::Error::other).boxed())
    }
}

#[derive(Debug, Clone)]
struct Resolution {
    name: String,
    descriptor: Descriptor,
}

/// Remembers successful resolutions by the literal reference string.
///
/// Entries never expire. References are expected to be digest-pinned; a
/// cached tag keeps pointing at whatever it resolved to first.
pub struct CachingResolver {
    inner: Arc<dyn Resolver>,
    cache: RwLock<HashMap<String, Resolution>>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn Resolver>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[async_trait]
impl Resolver for CachingResolver {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor), RemoteError> {
        if let Some(hit) = self.cache.read().get(reference).cloned() {
            return Ok((hit.name, hit.descriptor));
        }

        let (name, descriptor) = self.inner.resolve(reference).await?;
        self.cache.write().insert(
            reference.to_string(),
            Resolution {
                name: name.clone(),
                descriptor: descriptor.clone(),
            },
        );
        Ok((name, descriptor))
    }

    async fn fetcher(&self, reference: &str) -> Result<Arc<dyn Fetcher>, RemoteError> {
        self.inner.fetcher(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingResolver {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve(&self, reference: &str) -> Result<(String, Descriptor), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if reference.contains("missing") {
                return Err(RemoteError::NotFound(reference.to_string()));
            }
            Ok((
                reference.to_string(),
                Descriptor::for_bytes(media_types::OCI_MANIFEST, reference.as_bytes()),
            ))
        }

        async fn fetcher(&self, reference: &str) -> Result<Arc<dyn Fetcher>, RemoteError> {
            Err(RemoteError::NotFound(reference.to_string()))
        }
    }

    #[tokio::test]
    async fn test_caching_resolver_calls_delegate_once() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        let resolver = CachingResolver::new(inner.clone());

        let (_, a) = resolver.resolve("ghcr.io/org/app:1").await.unwrap();
        let (_, b) = resolver.resolve("ghcr.io/org/app:1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.len(), 1);
    }

    #[tokio::test]
    async fn test_caching_resolver_does_not_cache_failures() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        let resolver = CachingResolver::new(inner.clone());

        assert!(resolver.resolve("ghcr.io/org/missing:1").await.is_err());
        assert!(resolver.resolve("ghcr.io/org/missing:1").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(resolver.is_empty());
    }

    fn registry_resolver(server: &MockServer) -> RegistryResolver {
        let policy = RetryPolicy {
            max_attempts: 2,
            wait_min: Duration::from_millis(1),
            wait_max: Duration::from_millis(1),
            jitter: 0.0,
        };
        RegistryResolver::new(
            RetryableClient::new(reqwest::Client::new(), policy),
            vec![server.address().to_string()],
        )
    }

    fn manifest_bytes() -> Vec<u8> {
        let config = Descriptor::for_bytes(media_types::OCI_CONFIG, b"{}");
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": config,
            "layers": [],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_get() {
        let server = MockServer::start().await;
        let body = manifest_bytes();
        Mock::given(method("GET"))
            .and(path("/v2/base/manifests/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", media_types::OCI_MANIFEST)
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;

        let resolver = registry_resolver(&server);
        let (name, desc) = resolver
            .resolve(&format!("{}/base:1", server.address()))
            .await
            .unwrap();

        assert_eq!(name, format!("{}/base:1", server.address()));
        assert_eq!(desc.digest, Digest::from_bytes(&body));
        assert_eq!(desc.size, body.len() as u64);
        assert_eq!(desc.media_type, media_types::OCI_MANIFEST);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/base/manifests/1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = registry_resolver(&server);
        let err = resolver
            .resolve(&format!("{}/base:1", server.address()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_bearer_challenge() {
        let server = MockServer::start().await;
        let body = manifest_bytes();
        let digest = Digest::from_bytes(&body);
        let blob_path = format!("/v2/base/manifests/{digest}");

        Mock::given(method("GET"))
            .and(path(blob_path.as_str()))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(blob_path.as_str()))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "www-authenticate",
                format!(
                    r#"Bearer realm="{}/token",service="test",scope="repository:base:pull""#,
                    server.uri()
                )
                .as_str(),
            ))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok"})))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = registry_resolver(&server);
        let fetcher = resolver
            .fetcher(&format!("{}/base:1", server.address()))
            .await
            .unwrap();
        let desc = Descriptor::new(media_types::OCI_MANIFEST, digest, body.len() as u64);

        let fetched = fetch_all(fetcher.as_ref(), &desc).await.unwrap();
        assert_eq!(fetched, Bytes::from(body.clone()));

        // Token is reused for the second fetch.
        let fetched = fetch_all(fetcher.as_ref(), &desc).await.unwrap();
        assert_eq!(fetched.len(), body.len());
    }

    #[tokio::test]
    async fn test_evicted_token_is_fetched_again() {
        let server = MockServer::start().await;
        let body = manifest_bytes();
        let digest = Digest::from_bytes(&body);

        for repo in ["base", "other"] {
            let blob_path = format!("/v2/{repo}/manifests/{digest}");
            Mock::given(method("GET"))
                .and(path(blob_path.as_str()))
                .and(header("authorization", "Bearer tok"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
                .with_priority(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(blob_path.as_str()))
                .respond_with(ResponseTemplate::new(401).insert_header(
                    "www-authenticate",
                    format!(
                        r#"Bearer realm="{}/token",service="test",scope="repository:{repo}:pull""#,
                        server.uri()
                    )
                    .as_str(),
                ))
                .with_priority(2)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok"})))
            .expect(3)
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            max_attempts: 1,
            wait_min: Duration::from_millis(1),
            wait_max: Duration::from_millis(1),
            jitter: 0.0,
        };
        let resolver = RegistryResolver::with_token_capacity(
            RetryableClient::new(reqwest::Client::new(), policy),
            vec![server.address().to_string()],
            1,
        );
        let desc = Descriptor::new(media_types::OCI_MANIFEST, digest, body.len() as u64);

        // base, other, then base again after its token was evicted.
        for repo in ["base", "other", "base"] {
            let fetcher = resolver
                .fetcher(&format!("{}/{repo}:1", server.address()))
                .await
                .unwrap();
            let fetched = fetch_all(fetcher.as_ref(), &desc).await.unwrap();
            assert_eq!(fetched.len(), body.len());
        }
    }
}
