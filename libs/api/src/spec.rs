use regfac_oci::{media_types, Digest};
use serde::{Deserialize, Serialize};

/// What a pull should receive on top of its base image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Upstream image the manifest is derived from.
    pub base_ref: String,

    /// Image whose layers (and env directives) are injected for the IDE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ide_ref: Option<String>,

    /// Same as `ide_ref`, for the desktop IDE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_ide_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_layer: Vec<ContentLayer>,
}

/// A layer described directly in the spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentLayer {
    /// Uncompressed tar bytes carried inline.
    Direct {
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },

    /// A layer hosted elsewhere, served by redirect.
    #[serde(rename_all = "camelCase")]
    Remote {
        digest: Digest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff_id: Option<Digest>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        url: String,
        size: u64,
    },
}

impl ContentLayer {
    /// Media type of a remote layer.
    ///
    /// An explicit media type wins. Otherwise a layer whose diff ID differs
    /// from its digest is compressed; a missing diff ID means the two are
    /// the same content.
    pub fn remote_media_type(
        digest: &Digest,
        diff_id: Option<&Digest>,
        media_type: Option<&str>,
    ) -> String {
        if let Some(mt) = media_type {
            return mt.to_string();
        }
        match diff_id {
            Some(d) if d != digest => media_types::OCI_LAYER_GZIP.to_string(),
            _ => media_types::OCI_LAYER.to_string(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
