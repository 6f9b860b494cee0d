//! Prometheus metrics of the facade.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::Stream;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use tracing::error;

use crate::remote::BlobStream;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub blob_requests: IntCounter,
    pub manifest_latency: Histogram,
    pub blob_throughput: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let blob_requests = IntCounter::new(
            "registry_facade_blob_req_total",
            "Number of blob requests served",
        )?;
        let manifest_latency = Histogram::with_opts(
            HistogramOpts::new(
                "registry_facade_manifest_req_seconds",
                "Time to produce a rewritten manifest",
            )
            .buckets(prometheus::exponential_buckets(0.005, 2.0, 12)?),
        )?;
        let blob_throughput = Histogram::with_opts(
            HistogramOpts::new(
                "registry_facade_blob_req_bytes_second",
                "Blob download throughput in bytes per second",
            )
            .buckets(prometheus::exponential_buckets(1024.0 * 1024.0, 2.0, 12)?),
        )?;

        registry.register(Box::new(blob_requests.clone()))?;
        registry.register(Box::new(manifest_latency.clone()))?;
        registry.register(Box::new(blob_throughput.clone()))?;

        Ok(Self {
            registry,
            blob_requests,
            manifest_latency,
            blob_throughput,
        })
    }

    /// Text exposition format of everything registered.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }

    /// Wraps a blob stream so its throughput is recorded when it ends.
    pub fn measure(&self, stream: BlobStream) -> BlobStream {
        Box::pin(ThroughputStream {
            inner: stream,
            bytes: 0,
            started: Instant::now(),
            histogram: self.blob_throughput.clone(),
        })
    }
}

/// `GET /metrics`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(metrics)
}

async fn serve_metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "cannot encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Counts bytes passing through and observes bytes per second on drop.
struct ThroughputStream {
    inner: BlobStream,
    bytes: u64,
    started: Instant,
    histogram: Histogram,
}

impl Stream for ThroughputStream {
    type Item = std::io::Result<bytes::Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let res = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &res {
            this.bytes += chunk.len() as u64;
        }
        res
    }
}

impl Drop for ThroughputStream {
    fn drop(&mut self) {
        let secs = self.started.elapsed().as_secs_f64();
        if self.bytes > 0 && secs > 0.0 {
            self.histogram.observe(self.bytes as f64 / secs);
        }
    }
}
