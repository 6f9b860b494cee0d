//! Application state shared across request handlers.

use std::sync::Arc;

use crate::metrics::Metrics;
use crate::registry::Registry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { registry, metrics }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}
