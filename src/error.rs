//! Error taxonomy and HTTP error rendering.
//!
//! [`GatewayError`] names the failures the gateway itself decides on (credential
//! exhaustion, bad client input, unknown routes). Handlers return
//! [`AppError`], which wraps any [`anyhow::Error`]; when rendered, the inner
//! error is downcast to [`GatewayError`] to pick the status code, and anything
//! else becomes a 500.
//!
//! Malformed upstream stream frames are deliberately absent here: the stream
//! transcoder forwards them verbatim instead of failing.
//!
//! CORS headers are not set here; the permissive `CorsLayer` wrapping the
//! router stamps every response, error responses included.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The credential list is empty; no upstream call is attempted.
    #[error("No API keys configured")]
    NoCredentialsConfigured,

    /// Every credential is cooling down or suspended right now.
    #[error("No available API keys: every key is cooling down or suspended")]
    CredentialsExhausted,

    /// Every credential was tried for this call and none succeeded.
    #[error("All API keys failed (last upstream status: {}){}", status_text(.last_status), detail_text(.detail))]
    AllCredentialsFailed {
        last_status: Option<StatusCode>,
        detail: Option<String>,
    },

    /// The caller's request does not have the expected shape. Never retried.
    #[error("{0}")]
    ProtocolViolation(String),

    #[error("404 Not Found")]
    NotFound,

    #[error("The specified HTTP method is not allowed for the requested resource")]
    MethodNotAllowed,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoCredentialsConfigured
            | Self::CredentialsExhausted
            | Self::AllCredentialsFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ProtocolViolation(_) | Self::MethodNotAllowed => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::NoCredentialsConfigured => "no_credentials_configured",
            Self::CredentialsExhausted => "credentials_exhausted",
            Self::AllCredentialsFailed { .. } => "all_credentials_failed",
            Self::ProtocolViolation(_) => "invalid_request_error",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
        }
    }
}

fn status_text(status: &Option<StatusCode>) -> String {
    match status {
        Some(s) => s.to_string(),
        None => "none, transport errors only".to_owned(),
    }
}

fn detail_text(detail: &Option<String>) -> String {
    match detail {
        Some(d) if !d.is_empty() => format!(": {d}"),
        _ => String::new(),
    }
}

/// Shorthand for a client-side [`GatewayError::ProtocolViolation`].
pub fn violation(message: impl Into<String>) -> anyhow::Error {
    GatewayError::ProtocolViolation(message.into()).into()
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any `Into<anyhow::Error>` converts via the blanket [`From`] impl, so
/// handlers propagate with `?`.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match self.0.downcast_ref::<GatewayError>() {
            Some(e) => (e.status(), e.kind()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };
        if status.is_server_error() {
            tracing::warn!(error = %format!("{:#}", self.0), "handler error");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        (
            status,
            Json(json!({
                "error": {
                    "message": format!("{:#}", self.0),
                    "type": kind,
                    "code": status.as_u16(),
                }
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
