//! Registry facade library.
//!
//! The `registry-facade` binary is a thin shell around [`registry::Registry`]
//! and [`api::create_router`]; both are exposed for integration testing.

pub mod api;
pub mod blob;
pub mod config;
pub mod image;
pub mod layer;
pub mod lru;
pub mod metrics;
pub mod modifier;
pub mod registry;
pub mod remote;
pub mod spec;
pub mod state;
