//! Image reference parsing.

use std::fmt;

use regfac_oci::Digest;

use super::error::RemoteError;

/// Registry host used for references without one.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// A parsed `registry/repository[:tag|@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub object: Object,
}

/// What a reference points at inside its repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Tag(t) => f.write_str(t),
            Object::Digest(d) => write!(f, "{d}"),
        }
    }
}

impl Reference {
    pub fn parse(image_ref: &str) -> Result<Self, RemoteError> {
        let invalid = |reason: &str| RemoteError::InvalidReference {
            reference: image_ref.to_string(),
            reason: reason.to_string(),
        };

        if image_ref.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name_part, object) = if let Some((name, digest)) = image_ref.rsplit_once('@') {
            (name, Object::Digest(Digest::parse(digest)?))
        } else if let Some((name, tag)) = image_ref.rsplit_once(':') {
            // A colon before the last slash belongs to a registry port
            if tag.contains('/') || name.ends_with(']') {
                (image_ref, Object::Tag("latest".to_string()))
            } else {
                (name, Object::Tag(tag.to_string()))
            }
        } else {
            (image_ref, Object::Tag("latest".to_string()))
        };

        if name_part.is_empty() {
            return Err(invalid("missing repository"));
        }

        let (registry, repository) = match name_part.split_once('/') {
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name_part}")),
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (normalize_registry(host), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }

        Ok(Self {
            registry,
            repository,
            object,
        })
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.object {
            Object::Digest(d) => Some(d),
            Object::Tag(_) => None,
        }
    }

    /// `{scheme}://{registry}/v2/{repository}`
    pub fn repository_url(&self, insecure_registries: &[String]) -> String {
        let scheme = if insecure_registries.iter().any(|r| r == &self.registry) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}/v2/{}", self.registry, self.repository)
    }
}

fn normalize_registry(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Object::Tag(t) => write!(f, "{}/{}:{t}", self.registry, self.repository),
            Object::Digest(d) => write!(f, "{}/{}@{d}", self.registry, self.repository),
        }
    }
}
