//! Upstream registry access.
//!
//! - [`RetryableClient`]: bounded exponential-backoff retry on transport errors
//! - [`RegistryResolver`]: reference → descriptor, plus repository-scoped fetchers
//! - [`CachingResolver`]: remembers successful resolutions by reference string

mod auth;
mod client;
mod error;
mod reference;
mod resolver;
mod retry;

pub use client::RetryableClient;
pub use error::RemoteError;
pub use reference::{Object, Reference, DEFAULT_REGISTRY};
pub use resolver::{
    fetch_all, BlobStream, CachingResolver, Fetcher, RegistryResolver, Resolver,
};
pub use retry::{with_retry, RetryPolicy, Transient};
