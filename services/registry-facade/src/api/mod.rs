//! Distribution v2 pull API.

mod blob;
pub mod error;
mod manifest;
mod path;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use self::error::{ErrorCode, RegistryError};
use self::path::Target;
use crate::state::AppState;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// Create the registry router. `prefix` is prepended to `/v2/`.
pub fn create_router(state: AppState, prefix: &str) -> Router {
    let prefix = prefix.trim_end_matches('/');

    Router::new()
        .route(&format!("{prefix}/v2/{{*path}}"), any(dispatch))
        // `/v2/` itself and everything unmatched
        .fallback(base)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

async fn base() -> Response {
    let mut response = Json(serde_json::json!({})).into_response();
    response
        .headers_mut()
        .insert(API_VERSION, HeaderValue::from_static("registry/2.0"));
    response
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path(rest): Path<String>,
) -> Response {
    let result = match path::parse(&rest) {
        Target::Manifest { name, reference } => match check_name(name) {
            Ok(()) => manifest::handle(&state, &method, &headers, name, reference).await,
            Err(e) => Err(e),
        },
        Target::Blob { name, digest } => match check_name(name) {
            Ok(()) => blob::handle(&state, &method, name, digest).await,
            Err(e) => Err(e),
        },
        Target::Other => return base().await,
    };

    let mut response = result.into_response();
    response
        .headers_mut()
        .insert(API_VERSION, HeaderValue::from_static("registry/2.0"));
    response
}

fn check_name(name: &str) -> Result<(), RegistryError> {
    if path::is_valid_name(name) {
        Ok(())
    } else {
        Err(RegistryError::new(
            ErrorCode::NameInvalid,
            format!("invalid repository name {name:?}"),
        ))
    }
}
