//! Liveness probe endpoint.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz`: always 200 with the running version.
///
/// Never touches upstream or the credential pools, so it is safe as a Docker
/// or Kubernetes liveness probe.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })),
    )
}
