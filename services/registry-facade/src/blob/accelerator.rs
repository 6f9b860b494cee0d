//! Optional content-addressed HTTP gateway in front of the content store.
//!
//! The gateway exposes `HEAD|GET|PUT {url}/blobs/{digest}`. Blobs the facade
//! commits to its store are pushed there as well, and blob requests are
//! redirected to the gateway when it already has the content.

use std::time::Duration;

use bytes::Bytes;
use regfac_oci::Digest;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Accelerator {
    client: Client,
    url: String,
    lookup_timeout: Duration,
}

impl Accelerator {
    pub fn new(client: Client, url: impl Into<String>, lookup_timeout: Duration) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            lookup_timeout,
        }
    }

    fn blob_url(&self, digest: &Digest) -> String {
        format!("{}/blobs/{}", self.url, digest)
    }

    /// URL to redirect a blob request to, if the gateway has the blob.
    ///
    /// Bounded by the lookup timeout. Any failure counts as a miss.
    pub async fn lookup(&self, digest: &Digest) -> Option<String> {
        let url = self.blob_url(digest);
        let res = tokio::time::timeout(self.lookup_timeout, self.client.head(&url).send()).await;
        match res {
            Ok(Ok(resp)) if resp.status().is_success() => Some(url),
            Ok(Ok(resp)) => {
                debug!(digest = %digest, status = %resp.status(), "accelerator miss");
                None
            }
            Ok(Err(e)) => {
                debug!(digest = %digest, error = %e, "accelerator lookup failed");
                None
            }
            Err(_) => {
                debug!(digest = %digest, timeout = ?self.lookup_timeout, "accelerator lookup timed out");
                None
            }
        }
    }

    /// Uploads a blob. Runs inline with the caller.
    pub async fn store(&self, digest: &Digest, media_type: &str, data: Bytes) -> Result<(), reqwest::Error> {
        self.client
            .put(self.blob_url(digest))
            .header(CONTENT_TYPE, media_type)
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
