//! # regfac-oci
//!
//! The slice of the OCI image format the registry facade needs to rewrite
//! images in flight.
//!
//! ## Design Principles
//!
//! - Digests are validated on parse; an invalid digest never reaches a store key
//! - Manifests and configs keep fields this crate does not model, so a
//!   parse → modify → serialize cycle only changes what the facade touched
//! - Serialization is deterministic: the same input always yields the same bytes,
//!   which is what makes regenerated configs hash to the same digest

mod digest;
mod error;
mod manifest;
pub mod media_types;

pub use digest::{Digest, Digester};
pub use error::DigestError;
pub use manifest::{
    ContainerConfig, Descriptor, Document, ImageConfig, Index, Manifest, Platform, RootFs,
};
