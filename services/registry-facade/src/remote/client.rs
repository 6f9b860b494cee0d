use reqwest::{Client, RequestBuilder, Response};

use super::retry::{with_retry, RetryPolicy};

/// HTTP client that replays requests on transient transport errors.
///
/// Requests are rebuilt for every attempt, so bodies must be cheap to clone.
#[derive(Debug, Clone)]
pub struct RetryableClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryableClient {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn send<F>(&self, build: F) -> Result<Response, reqwest::Error>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        with_retry(&self.policy, || build(&self.client).send()).await
    }
}
