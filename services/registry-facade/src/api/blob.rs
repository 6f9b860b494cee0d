use axum::{
    body::Body,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use regfac_oci::Digest;
use tracing::debug;

use super::error::{ErrorCode, RegistryError};
use super::DOCKER_CONTENT_DIGEST;
use crate::layer::BlobContent;
use crate::state::AppState;

pub(super) async fn handle(
    state: &AppState,
    method: &Method,
    name: &str,
    digest: &str,
) -> Result<Response, RegistryError> {
    match *method {
        Method::GET | Method::HEAD => {}
        _ => return Err(RegistryError::unsupported()),
    }

    let digest = Digest::parse(digest)
        .map_err(|e| RegistryError::new(ErrorCode::DigestInvalid, e.to_string()))?;
    state.metrics().blob_requests.inc();

    let registry = state.registry();
    let spec = registry
        .spec(name)
        .await
        .map_err(|e| RegistryError::from_lookup(e, ErrorCode::BlobUnknown))?;
    let blob = registry.blob(&spec, &digest).await?;

    let content_type = HeaderValue::from_str(&blob.media_type)
        .map_err(|e| RegistryError::new(ErrorCode::Unknown, e.to_string()))?;
    let digest_value = HeaderValue::from_str(digest.as_str())
        .map_err(|e| RegistryError::new(ErrorCode::DigestInvalid, e.to_string()))?;
    let etag = HeaderValue::from_str(&format!("\"{digest}\""))
        .map_err(|e| RegistryError::new(ErrorCode::DigestInvalid, e.to_string()))?;

    let mut response = match blob.content {
        BlobContent::Redirect(url) => {
            debug!(digest = %digest, url = %url, "redirecting blob");
            let location = HeaderValue::from_str(&url)
                .map_err(|e| RegistryError::new(ErrorCode::Unknown, e.to_string()))?;
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
        }
        BlobContent::Stream(_) if *method == Method::HEAD => Body::empty().into_response(),
        BlobContent::Stream(stream) => {
            Body::from_stream(state.metrics().measure(stream)).into_response()
        }
    };

    let served = response.status().is_success();
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, content_type);
    h.insert(DOCKER_CONTENT_DIGEST, digest_value);
    if served {
        h.insert(header::ETAG, etag);
        if let Some(size) = blob.size {
            h.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        }
    }
    Ok(response)
}
