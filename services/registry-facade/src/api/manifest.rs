use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
};
use regfac_oci::media_types;
use tracing::debug;

use super::error::{ErrorCode, RegistryError};
use super::DOCKER_CONTENT_DIGEST;
use crate::state::AppState;

/// Whether the `Accept` header admits an OCI or Docker v2 manifest. Only
/// those two types and the bare `*` range qualify; a request without
/// `Accept` admits nothing.
pub(super) fn accepts_manifest(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|range| range.split(';').next().unwrap_or_default().trim())
        .any(|range| {
            range == "*"
                || range.eq_ignore_ascii_case(media_types::OCI_MANIFEST)
                || range.eq_ignore_ascii_case(media_types::DOCKER_MANIFEST)
        })
}

pub(super) async fn handle(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    name: &str,
    reference: &str,
) -> Result<Response, RegistryError> {
    match *method {
        Method::GET | Method::HEAD => {}
        _ => return Err(RegistryError::unsupported()),
    }

    let _timer = state.metrics().manifest_latency.start_timer();
    if !accepts_manifest(headers) {
        return Err(RegistryError::new(
            ErrorCode::ManifestUnknown,
            "no acceptable manifest media type",
        ));
    }

    let registry = state.registry();
    let spec = registry
        .spec(name)
        .await
        .map_err(|e| RegistryError::from_lookup(e, ErrorCode::ManifestUnknown))?;
    debug!(name = %name, reference = %reference, base = %spec.base_ref, "serving manifest");

    let served = registry.manifest(&spec).await?;
    let content_type = HeaderValue::from_str(&served.media_type)
        .map_err(|e| RegistryError::new(ErrorCode::ManifestInvalid, e.to_string()))?;
    let digest = HeaderValue::from_str(served.digest.as_str())
        .map_err(|e| RegistryError::new(ErrorCode::Unknown, e.to_string()))?;
    let etag = HeaderValue::from_str(&format!("\"{}\"", served.digest))
        .map_err(|e| RegistryError::new(ErrorCode::Unknown, e.to_string()))?;
    let length = HeaderValue::from(served.bytes.len() as u64);

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(served.bytes)
    };
    let mut response = body.into_response();
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, content_type);
    h.insert(header::CONTENT_LENGTH, length);
    h.insert(header::ETAG, etag);
    h.insert(DOCKER_CONTENT_DIGEST, digest);
    Ok(response)
}
