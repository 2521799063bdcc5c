//! Client-facing OpenAI-compatible API.
//!
//! Handlers are a thin layer: they pick the credential pool, translate the
//! request with [`crate::upstream::schema`], dispatch through
//! [`crate::upstream::GeminiClient`], and translate the answer back. Every
//! route is served both at the root and under `/v1`.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    error::{AppError, GatewayError},
    state::GatewayState,
    stream::{self, DeltaTransformer, Transcoder},
    upstream::schema,
};

pub fn router(state: Arc<GatewayState>) -> Router {
    let openai: Router<Arc<GatewayState>> = Router::new()
        .route(
            "/chat/completions",
            post(chat_completions).fallback(method_not_allowed),
        )
        .route("/embeddings", post(embeddings).fallback(method_not_allowed))
        .route("/models", get(list_models).fallback(method_not_allowed));

    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .merge(openai.clone())
        .nest("/v1", openai)
        .fallback(not_found)
        .with_state(state)
}

/// `POST /chat/completions`, streaming when the body sets `"stream": true`.
pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let config = state.config();
    let model = schema::resolve_chat_model(
        body.get("model").and_then(Value::as_str),
        &config.models.default_chat,
    );
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let mut request = schema::build_generate_request(&body, &state.http).await?;
    if model.search {
        schema::add_search_tool(&mut request);
    }

    info!(model = %model.name, streaming, search = model.search, "chat completion");
    let pool = state.pool_for(&headers).await;
    let response = state
        .gemini()?
        .generate_content(&pool, &model.name, streaming, &request)
        .await?;
    let id = format!("chatcmpl-{}", schema::generate_id());

    if streaming {
        let include_usage = body
            .pointer("/stream_options/include_usage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let transcoder = Transcoder::new(DeltaTransformer::new(id, model.name, include_usage));
        let events = stream::transcode(response.bytes_stream(), transcoder);
        return Ok((
            [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
            Body::from_stream(events),
        )
            .into_response());
    }

    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let raw = response
        .bytes()
        .await
        .context("reading upstream chat response")?;

    match serde_json::from_slice::<Value>(&raw) {
        Ok(data) if data.get("candidates").is_some_and(Value::is_array) => {
            let created = chrono::Utc::now().timestamp();
            Ok(Json(schema::completion_response(&data, &model.name, &id, created)).into_response())
        }
        _ => {
            warn!(%status, bytes = raw.len(), "upstream reply has no candidates; passing through");
            let mut passthrough = (status, Body::from(raw)).into_response();
            if let Some(value) = content_type {
                passthrough.headers_mut().insert(CONTENT_TYPE, value);
            }
            Ok(passthrough)
        }
    }
}

/// `POST /embeddings`
pub async fn embeddings(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let config = state.config();
    let model = schema::resolve_embeddings_model(body.get("model"), &config.models.default_embeddings)?;
    let request = schema::build_embed_request(&body, &model)?;

    let pool = state.pool_for(&headers).await;
    let response = state
        .gemini()?
        .batch_embed_contents(&pool, &model, &request)
        .await?;
    let data: Value = response
        .json()
        .await
        .context("parsing upstream embeddings response")?;
    Ok(Json(schema::embeddings_response(
        &data,
        body.get("model").unwrap_or(&Value::Null),
    )))
}

/// `GET /models`
pub async fn list_models(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let pool = state.pool_for(&headers).await;
    let response = state.gemini()?.list_models(&pool).await?;
    let data: Value = response
        .json()
        .await
        .context("parsing upstream model list")?;
    Ok(Json(schema::models_response(&data)))
}

async fn method_not_allowed() -> AppError {
    GatewayError::MethodNotAllowed.into()
}

async fn not_found() -> AppError {
    GatewayError::NotFound.into()
}
