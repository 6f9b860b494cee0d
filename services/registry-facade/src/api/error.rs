//! Distribution API errors.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::blob::BlobError;
use crate::image::ManifestError;
use crate::registry::LookupError;
use crate::spec::SpecError;

/// Error codes of the distribution protocol this service emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ManifestUnknown,
    ManifestInvalid,
    BlobUnknown,
    NameInvalid,
    DigestInvalid,
    Unsupported,
    Unknown,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::ManifestUnknown | Self::BlobUnknown => StatusCode::NOT_FOUND,
            Self::ManifestInvalid | Self::NameInvalid | Self::DigestInvalid => {
                StatusCode::BAD_REQUEST
            }
            Self::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::ManifestUnknown => "manifest unknown",
            Self::ManifestInvalid => "manifest invalid",
            Self::BlobUnknown => "blob unknown to registry",
            Self::NameInvalid => "invalid repository name",
            Self::DigestInvalid => "provided digest did not match uploaded content",
            Self::Unsupported => "The operation is unsupported.",
            Self::Unknown => "unknown error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEntry {
    pub code: ErrorCode,
    pub message: String,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug)]
pub struct RegistryError {
    pub code: ErrorCode,
    pub detail: String,
}

impl RegistryError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn unsupported() -> Self {
        Self::new(ErrorCode::Unsupported, "")
    }

    /// Maps a failed spec lookup. `not_found` is the code used when the
    /// repository name does not lead to a spec.
    pub fn from_lookup(err: LookupError, not_found: ErrorCode) -> Self {
        match err {
            LookupError::MissingRef(_) | LookupError::UnknownProvider(_) => {
                Self::new(not_found, err.to_string())
            }
            LookupError::Spec(SpecError::InvalidRef(_)) => Self::new(not_found, err.to_string()),
            LookupError::Spec(e) => {
                error!(error = %e, "spec lookup failed");
                Self::new(ErrorCode::Unknown, e.to_string())
            }
        }
    }
}

impl From<ManifestError> for RegistryError {
    fn from(err: ManifestError) -> Self {
        let code = if err.is_not_found() {
            ErrorCode::ManifestUnknown
        } else if err.is_invalid() {
            ErrorCode::ManifestInvalid
        } else if let ManifestError::Download(_) = err {
            error!(error = %err, "cannot fetch manifest");
            ErrorCode::ManifestUnknown
        } else {
            error!(error = %err, "cannot produce manifest");
            ErrorCode::Unknown
        };
        Self::new(code, err.to_string())
    }
}

impl From<BlobError> for RegistryError {
    fn from(err: BlobError) -> Self {
        let code = if err.is_unknown() {
            ErrorCode::BlobUnknown
        } else {
            error!(error = %err, "cannot serve blob");
            ErrorCode::Unknown
        };
        Self::new(code, err.to_string())
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: self.code,
                message: self.code.message().to_string(),
                detail: self.detail,
            }],
        };
        let mut response = (self.code.status(), Json(envelope)).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

#[cfg(test)]
mod tests {
    use regfac_oci::Digest;

    use super::*;
    use crate::image::DownloadError;
    use crate::layer::LayerError;
    use crate::remote::RemoteError;

    async fn body_json(err: RegistryError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_envelope() {
        let (status, body) = body_json(RegistryError::unsupported()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["errors"][0]["code"], "UNSUPPORTED");
        assert_eq!(body["errors"][0]["message"], "The operation is unsupported.");
    }

    #[tokio::test]
    async fn test_blob_not_found_is_blob_unknown() {
        let err = BlobError::Layer(LayerError::BlobNotFound(Digest::from_bytes(b"x")));
        let (status, body) = body_json(err.into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "BLOB_UNKNOWN");
    }

    #[test]
    fn test_manifest_fetch_failure_is_manifest_unknown() {
        let err = ManifestError::Download(DownloadError::Fetch(RemoteError::UnexpectedStatus {
            status: reqwest::StatusCode::BAD_GATEWAY,
            url: "https://registry.example/v2/base/manifests/1".into(),
        }));
        assert_eq!(RegistryError::from(err).code, ErrorCode::ManifestUnknown);

        let err = ManifestError::Download(DownloadError::UnsupportedMediaType("text/plain".into()));
        assert_eq!(RegistryError::from(err).code, ErrorCode::ManifestInvalid);

        let err = ManifestError::Resolve {
            reference: "base:1".into(),
            source: RemoteError::AuthRequired("registry.example".into()),
        };
        assert_eq!(RegistryError::from(err).code, ErrorCode::Unknown);
    }

    #[test]
    fn test_lookup_mapping() {
        let err = RegistryError::from_lookup(
            LookupError::Spec(SpecError::InvalidRef("ws-1".into())),
            ErrorCode::ManifestUnknown,
        );
        assert_eq!(err.code, ErrorCode::ManifestUnknown);

        let err = RegistryError::from_lookup(
            LookupError::Spec(SpecError::Unavailable("down".into())),
            ErrorCode::BlobUnknown,
        );
        assert_eq!(err.code, ErrorCode::Unknown);
    }
}
