use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regfac_api::wire::{GetImageSpecResponse, HEALTH_PATH, IMAGE_SPECS_PATH};
use regfac_api::ImageSpec;
use reqwest::{Certificate, Client, Identity, StatusCode, Url};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ImageSpecProvider, SpecError};

/// PEM material for the connection to the spec service.
#[derive(Clone)]
pub struct TlsMaterial {
    /// CA bundle the service certificate must chain to.
    pub authority: Vec<u8>,
    /// Client certificate followed by its private key.
    pub identity: Vec<u8>,
}

impl TlsMaterial {
    pub async fn load(authority: &Path, certificate: &Path, private_key: &Path) -> Result<Self, SpecError> {
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|source| SpecError::Io { path, source })
            }
        };
        let authority = read(authority).await?;
        let mut identity = read(certificate).await?;
        identity.push(b'\n');
        identity.extend(read(private_key).await?);
        Ok(Self {
            authority,
            identity,
        })
    }
}

struct Connection {
    client: Client,
    healthy: AtomicBool,
}

impl Connection {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn mark_failed(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

/// Looks specs up at the spec service.
///
/// The HTTP client is created on first use after a successful health check
/// and reused until a request fails at the transport level or with a server
/// error; the next lookup then reconnects.
pub struct RemoteSpecProvider {
    base: Url,
    tls: Option<TlsMaterial>,
    timeout: Duration,
    conn: RwLock<Option<Arc<Connection>>>,
    connects: AtomicUsize,
}

impl RemoteSpecProvider {
    pub fn new(addr: &str, tls: Option<TlsMaterial>, timeout: Duration) -> Result<Self, SpecError> {
        let base = Url::parse(addr).map_err(|_| SpecError::InvalidAddress(addr.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(SpecError::InvalidAddress(addr.to_string()));
        }
        Ok(Self {
            base,
            tls,
            timeout,
            conn: RwLock::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    /// Number of connections established so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    fn url(&self, path: &str, reference: Option<&str>) -> Result<Url, SpecError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SpecError::InvalidAddress(self.base.to_string()))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
            if let Some(reference) = reference {
                segments.push(reference);
            }
        }
        Ok(url)
    }

    async fn connection(&self) -> Result<Arc<Connection>, SpecError> {
        {
            let guard = self.conn.read().await;
            if let Some(conn) = guard.as_ref().filter(|c| c.is_healthy()) {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.conn.write().await;
        // Another task may have reconnected while we waited.
        if let Some(conn) = guard.as_ref().filter(|c| c.is_healthy()) {
            return Ok(conn.clone());
        }

        let conn = Arc::new(self.connect().await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&self) -> Result<Connection, SpecError> {
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(tls) = &self.tls {
            let ca = Certificate::from_pem(&tls.authority).map_err(|e| SpecError::Tls(e.to_string()))?;
            let identity = Identity::from_pem(&tls.identity).map_err(|e| SpecError::Tls(e.to_string()))?;
            builder = builder.add_root_certificate(ca).identity(identity);
        }
        let client = builder.build()?;

        let health = self.url(HEALTH_PATH, None)?;
        let resp = client.get(health).send().await?;
        if !resp.status().is_success() {
            warn!(addr = %self.base, status = %resp.status(), "spec service is not healthy");
            return Err(SpecError::Unavailable(format!("health check returned {}", resp.status())));
        }

        self.connects.fetch_add(1, Ordering::Relaxed);
        info!(addr = %self.base, tls = self.tls.is_some(), "connected to spec service");
        Ok(Connection {
            client,
            healthy: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl ImageSpecProvider for RemoteSpecProvider {
    async fn get_spec(&self, reference: &str) -> Result<ImageSpec, SpecError> {
        let conn = self.connection().await?;
        let url = self.url(IMAGE_SPECS_PATH, Some(reference))?;
        debug!(reference = %reference, "fetching image spec");

        let resp = match conn.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                conn.mark_failed();
                return Err(e.into());
            }
        };

        let status = resp.status();
        match status {
            s if s.is_success() => Ok(resp.json::<GetImageSpecResponse>().await?.spec),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                Err(SpecError::InvalidRef(reference.to_string()))
            }
            s => {
                if s.is_server_error() {
                    conn.mark_failed();
                }
                let body = resp.text().await.unwrap_or_default();
                Err(SpecError::Unavailable(format!("{status}: {body}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::join_all;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/image-specs/ws-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "spec": {"baseRef": "alpine:3.20"}
            })))
            .mount(&server)
            .await;
        server
    }

    fn provider(server: &MockServer) -> RemoteSpecProvider {
        RemoteSpecProvider::new(&server.uri(), None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_reuses_connection() {
        let server = healthy_server().await;
        let provider = provider(&server);

        let spec = provider.get_spec("ws-1").await.unwrap();
        assert_eq!(spec.base_ref, "alpine:3.20");
        provider.get_spec("ws-1").await.unwrap();
        assert_eq!(provider.connects(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_connect_once() {
        let server = healthy_server().await;
        let provider = provider(&server);

        let results = join_all((0..8).map(|_| provider.get_spec("ws-1"))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(provider.connects(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ref() {
        let server = healthy_server().await;
        let err = provider(&server).get_spec("ws-2").await.unwrap_err();
        assert!(err.is_invalid_ref());
    }

    #[tokio::test]
    async fn test_unhealthy_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert!(matches!(
            provider.get_spec("ws-1").await,
            Err(SpecError::Unavailable(_))
        ));
        assert_eq!(provider.connects(), 0);
    }

    #[tokio::test]
    async fn test_server_error_forces_reconnect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/image-specs/ws-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert!(provider.get_spec("ws-1").await.is_err());
        assert!(provider.get_spec("ws-1").await.is_err());
        assert_eq!(provider.connects(), 2);
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            RemoteSpecProvider::new("not a url", None, Duration::from_secs(1)),
            Err(SpecError::InvalidAddress(_))
        ));
    }
}
