//! Manifests, indexes, descriptors and image configs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::digest::Digest;
use crate::media_types;

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    /// Describes `data` with the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, Digest::from_bytes(data), data.len() as u64)
    }
}

/// Platform entry of an index descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(
        rename = "os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
    #[serde(
        rename = "os.features",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_features: Option<Vec<String>>,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Fields this crate does not model, carried through unchanged.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Image index / manifest list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A parsed manifest-like document.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Manifest(Manifest),
    Index(Index),
}

impl Document {
    /// Parses `data`, deciding between index and manifest by content.
    ///
    /// A top-level `manifests` array marks an index; anything else is
    /// parsed as a single manifest. The declared `mediaType` is not
    /// trusted because Docker manifests frequently omit it.
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(data)?;
        if value.get("manifests").is_some_and(Value::is_array) {
            Ok(Self::Index(serde_json::from_value(value)?))
        } else {
            Ok(Self::Manifest(serde_json::from_value(value)?))
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    /// The media type a server should announce for this document.
    ///
    /// Falls back to the OCI type matching the document's shape when the
    /// document does not declare one.
    pub fn media_type(&self) -> &str {
        match self {
            Self::Manifest(m) => m
                .media_type
                .as_deref()
                .unwrap_or(media_types::OCI_MANIFEST),
            Self::Index(i) => i.media_type.as_deref().unwrap_or(media_types::OCI_INDEX),
        }
    }
}

/// Image configuration blob.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ImageConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// `KEY=value` entries of the container config, empty when absent.
    pub fn env(&self) -> &[String] {
        self.config
            .as_ref()
            .and_then(|c| c.env.as_deref())
            .unwrap_or_default()
    }

    pub fn set_env(&mut self, env: Vec<String>) {
        self.config.get_or_insert_with(ContainerConfig::default).env = Some(env);
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }
}

/// The runtime section of an image config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Root filesystem chain, keyed by uncompressed layer digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
            other: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "config": {"Env": ["PATH=/bin", "FOO=bar"], "Cmd": ["/bin/sh"], "Labels": {"a": "b"}},
        "rootfs": {"type": "layers", "diff_ids": [
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ]},
        "history": [{"created_by": "x"}]
    }"#;

    fn manifest_json() -> String {
        let d = Digest::from_bytes(b"config");
        format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"{}","digest":"{d}","size":6}},"layers":[],"subject":{{"x":1}}}}"#,
            media_types::OCI_CONFIG
        )
    }

    #[test]
    fn test_config_keeps_unknown_fields() {
        let cfg = ImageConfig::from_slice(CONFIG.as_bytes()).unwrap();
        assert_eq!(cfg.env(), ["PATH=/bin", "FOO=bar"]);
        assert_eq!(cfg.label("a"), Some("b"));
        assert_eq!(cfg.rootfs.diff_ids.len(), 1);

        let out: Value = serde_json::from_slice(&cfg.to_vec().unwrap()).unwrap();
        assert_eq!(out["architecture"], "amd64");
        assert_eq!(out["config"]["Cmd"][0], "/bin/sh");
        assert_eq!(out["history"][0]["created_by"], "x");
    }

    #[test]
    fn test_config_serialization_is_deterministic() {
        let a = ImageConfig::from_slice(CONFIG.as_bytes()).unwrap();
        let b = ImageConfig::from_slice(&a.to_vec().unwrap()).unwrap();
        assert_eq!(a.to_vec().unwrap(), b.to_vec().unwrap());
    }

    #[test]
    fn test_set_env_on_config_without_runtime_section() {
        let mut cfg = ImageConfig::default();
        assert!(cfg.env().is_empty());
        cfg.set_env(vec!["A=1".into()]);
        assert_eq!(cfg.env(), ["A=1"]);
    }

    #[test]
    fn test_sniff_manifest() {
        let doc = Document::parse(manifest_json().as_bytes()).unwrap();
        let Document::Manifest(m) = &doc else {
            panic!("expected manifest");
        };
        assert_eq!(m.other["subject"]["x"], 1);
        assert_eq!(doc.media_type(), media_types::OCI_MANIFEST);
    }

    #[test]
    fn test_sniff_index_without_media_type() {
        let d = Digest::from_bytes(b"m");
        let json = format!(
            r#"{{"schemaVersion":2,"manifests":[{{"mediaType":"{}","digest":"{d}","size":1,"platform":{{"architecture":"amd64","os":"linux"}}}}]}}"#,
            media_types::OCI_MANIFEST
        );
        let doc = Document::parse(json.as_bytes()).unwrap();
        assert!(doc.is_index());
        assert_eq!(doc.media_type(), media_types::OCI_INDEX);
    }

    #[test]
    fn test_descriptor_skips_empty_optionals() {
        let desc = Descriptor::for_bytes(media_types::OCI_LAYER, b"abc");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["size"], 3);
        assert!(json.get("urls").is_none());
        assert!(json.get("platform").is_none());
    }
}
