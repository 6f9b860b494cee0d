//! Service configuration.
//!
//! Read from a JSON file (path in `REGFAC_CONFIG`) and overridden by
//! `REGFAC__`-prefixed environment variables, with `__` separating nested
//! keys: `REGFAC__UPSTREAM__RETRY_MAX=3`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::remote::RetryPolicy;

pub const CONFIG_PATH_ENV: &str = "REGFAC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/registry-facade/config.json";
const ENV_PREFIX: &str = "REGFAC";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Path prefix in front of `/v2/`.
    #[serde(default)]
    pub prefix: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serves `GET /metrics` on a separate listener when set.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub remote_spec_provider: Option<RemoteSpecProviderConfig>,

    /// JSON file mapping spec refs to specs.
    #[serde(default)]
    pub fixed_spec_provider: Option<PathBuf>,

    #[serde(default)]
    pub static_layer: Vec<StaticLayerConfig>,

    #[serde(default)]
    pub accelerator: Option<AcceleratorConfig>,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Local {
        path: PathBuf,
    },
    /// A Redis server, e.g. `redis://cache:6379/0`.
    Redis {
        url: String,
    },
    #[default]
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSpecProviderConfig {
    pub addr: String,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_spec_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Client-side TLS for the spec service connection.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub authority: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticLayerKind {
    /// A local `.tar.gz` file.
    File,
    /// All layers of an image reference.
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticLayerConfig {
    #[serde(rename = "type")]
    pub kind: StaticLayerKind,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceleratorConfig {
    pub url: String,

    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl AcceleratorConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    #[serde(default = "default_retry_wait_min_ms")]
    pub retry_wait_min_ms: u64,

    #[serde(default = "default_retry_wait_max_ms")]
    pub retry_wait_max_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Registries reached over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            retry_max: default_retry_max(),
            retry_wait_min_ms: default_retry_wait_min_ms(),
            retry_wait_max_ms: default_retry_wait_max_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            insecure_registries: Vec::new(),
        }
    }
}

impl UpstreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max,
            wait_min: Duration::from_millis(self.retry_wait_min_ms),
            wait_max: Duration::from_millis(self.retry_wait_max_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 32223))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_size() -> usize {
    crate::lru::DEFAULT_CAPACITY
}

fn default_spec_timeout_secs() -> u64 {
    10
}

fn default_lookup_timeout_ms() -> u64 {
    500
}

fn default_retry_max() -> u32 {
    5
}

fn default_retry_wait_min_ms() -> u64 {
    100
}

fn default_retry_wait_max_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Config {
    /// Loads from `REGFAC_CONFIG`, or the default path if present.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from(Path::new(&path), true),
            Err(_) => Self::load_from(Path::new(DEFAULT_CONFIG_PATH), false),
        }
    }

    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(required),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("cannot read configuration from {}", path.display()))?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(acc) = &self.accelerator {
            ensure!(acc.lookup_timeout_ms > 0, "accelerator.lookup_timeout_ms must be > 0");
            ensure!(!acc.url.is_empty(), "accelerator.url must not be empty");
        }
        if let Some(remote) = &self.remote_spec_provider {
            ensure!(!remote.addr.is_empty(), "remote_spec_provider.addr must not be empty");
        }
        ensure!(self.upstream.retry_max > 0, "upstream.retry_max must be > 0");
        ensure!(
            self.upstream.retry_wait_min_ms <= self.upstream.retry_wait_max_ms,
            "upstream.retry_wait_min_ms must not exceed upstream.retry_wait_max_ms"
        );
        ensure!(
            self.prefix.is_empty() || self.prefix.starts_with('/'),
            "prefix must start with '/'"
        );
        Ok(())
    }
}
