//! # regfac-api
//!
//! The contract between the workload orchestrator and the registry facade.
//!
//! The orchestrator decides what a pull should receive and publishes it as an
//! [`ImageSpec`]. The facade looks specs up by the first segment of the pulled
//! repository name (the *spec provider*) and the remainder (the *spec ref*):
//!
//! ```text
//! GET /v2/remote/ws-1234/manifests/latest
//!         ^^^^^^ ^^^^^^^
//!         |      spec ref, passed to the provider
//!         spec provider
//! ```

mod spec;

pub use spec::{ContentLayer, ImageSpec};

/// Provider prefix for specs fetched from the remote spec service.
pub const PROVIDER_REMOTE: &str = "remote";

/// Provider prefix for specs loaded from a static file.
pub const PROVIDER_FIXED: &str = "fixed";

/// Wire types of the remote spec service.
///
/// `GET {addr}/v1/image-specs/{ref}` answers `200` with [`GetImageSpecResponse`]
/// or `404` when the ref is unknown. `GET {addr}/healthz` answers `200` while
/// the service can serve lookups.
pub mod wire {
    use serde::{Deserialize, Serialize};

    use crate::ImageSpec;

    pub const IMAGE_SPECS_PATH: &str = "/v1/image-specs";
    pub const HEALTH_PATH: &str = "/healthz";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GetImageSpecResponse {
        pub spec: ImageSpec,
    }

    /// Error body returned alongside non-2xx responses.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ErrorBody {
        pub message: String,
    }
}
