//! Registry facade
//!
//! Serves the pull side of the distribution API. Manifests and configs of
//! upstream images are rewritten on the fly to carry the layers and env
//! described by the image spec that the repository name points at.

use std::sync::Arc;

use anyhow::{Context, Result};
use regfac_facade::{api, config::Config, metrics, metrics::Metrics, registry::Registry, state::AppState};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing (prefer RUST_LOG, fallback to the configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting registry facade");
    info!(listen_addr = %config.listen_addr, prefix = %config.prefix, "Configuration loaded");

    let registry = Arc::new(Registry::from_config(&config).await?);
    let metrics = Arc::new(Metrics::new().context("cannot register metrics")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_handle = match config.metrics_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind metrics listener on {addr}"))?;
            info!(addr = %addr, "Serving metrics");
            let app = metrics::router(metrics.clone());
            let shutdown = wait_for_shutdown(shutdown_rx.clone());
            Some(tokio::spawn(async move {
                axum::serve(listener, app).with_graceful_shutdown(shutdown).await
            }))
        }
        None => None,
    };

    // Static layers are reloaded from the config file on SIGHUP
    let mut sighup = signal(SignalKind::hangup())?;
    let reload_handle = tokio::spawn({
        let registry = registry.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            loop {
                tokio::select! {
                    _ = sighup.recv() => reload_static_layers(&registry).await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    let app = api::create_router(AppState::new(registry, metrics), &config.prefix);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let shutdown = wait_for_shutdown(shutdown_rx);
        async move { axum::serve(listener, app).with_graceful_shutdown(shutdown).await }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    signal_shutdown(&shutdown_tx);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, reload_handle).await {
        warn!(error = %e, "Reload task did not shut down in time");
    }
    if let Some(handle) = metrics_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Metrics server did not shut down in time");
        }
    }

    info!("Registry facade shutdown complete");
    Ok(())
}

fn signal_shutdown(shutdown_tx: &watch::Sender<bool>) {
    if let Err(e) = shutdown_tx.send(true) {
        debug!(error = %e, "No task left to notify of shutdown");
    }
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}

async fn reload_static_layers(registry: &Registry) {
    info!("Reloading static layers");
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Cannot reload configuration; keeping current static layers");
            return;
        }
    };
    match registry.update_static_layers(&config.static_layer).await {
        Ok(()) => info!(count = config.static_layer.len(), "Static layers reloaded"),
        Err(e) => error!(error = %e, "Cannot rebuild static layers; keeping current ones"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_reaches_waiters() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_shutdown(rx));
        signal_shutdown(&tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_shutdown_without_waiters() {
        let (tx, rx) = watch::channel(false);
        drop(rx);
        signal_shutdown(&tx);
        assert!(!*tx.borrow());
    }
}
