//! HTTP surface of the gateway.
//!
//! [`app`] assembles the full service: the OpenAI-compatible routes from
//! [`client`], the websocket relay interceptor from [`socket`], request ids,
//! and permissive CORS on every response. `main` adds request tracing on top.

pub mod client;
pub mod health;
pub mod request_id;
pub mod socket;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::GatewayState;

pub fn app(state: Arc<GatewayState>) -> Router {
    client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            state,
            socket::upgrade_middleware,
        ))
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(CorsLayer::permissive())
}
