//! Websocket upgrade interception.
//!
//! Any request asking to upgrade to a websocket, on any path, is taken out of
//! normal routing and relayed to `[upstream] ws_base_url` with the same path
//! and query. Everything else continues down the stack.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Request, State},
    http::{header::UPGRADE, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use crate::{bridge, state::GatewayState};

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

pub async fn upgrade_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        return next.run(req).await;
    }

    let base = state.config().upstream.ws_base_url.clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    // The query usually carries the caller's key; only the path is logged.
    let target = format!("{}{}", base.trim_end_matches('/'), path_and_query);
    let path = req.uri().path().to_owned();

    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => {
            info!(%path, "relaying websocket session");
            upgrade.on_upgrade(move |socket| bridge::serve(socket, target))
        }
        Err(rejection) => {
            debug!(%path, "malformed websocket upgrade");
            rejection.into_response()
        }
    }
}
