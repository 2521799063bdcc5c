//! Client for the Gemini REST API.
//!
//! [`GeminiClient`] knows the upstream URL layout and fixed headers; every
//! call goes through a [`RetryDispatcher`] so credential rotation applies
//! uniformly. Payload translation lives in [`schema`].

pub mod schema;

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Method,
};
use serde_json::Value;

use crate::{
    config::Config,
    credentials::CredentialPool,
    dispatcher::{RequestSpec, RetryDispatcher, RetryPolicy},
};

#[derive(Debug, Clone)]
pub struct GeminiClient {
    dispatcher: RetryDispatcher,
    base_url: String,
    api_version: String,
    api_client: HeaderValue,
    timeout: Duration,
}

impl GeminiClient {
    /// Build a client from the current config, sharing `http`'s connection pool.
    pub fn new(http: reqwest::Client, config: &Config) -> anyhow::Result<Self> {
        let policy = RetryPolicy {
            cooldown: config.gateway.cooldown(),
            entitlement_cooldown: config.gateway.entitlement_cooldown(),
        };
        let api_client = HeaderValue::from_str(&config.upstream.api_client)
            .context("[upstream] api_client is not a valid header value")?;
        Ok(Self {
            dispatcher: RetryDispatcher::new(http, policy),
            base_url: config.upstream.base_url.trim_end_matches('/').to_owned(),
            api_version: config.upstream.api_version.clone(),
            api_client,
            timeout: Duration::from_millis(config.upstream.timeout_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.api_version, path)
    }

    fn spec(&self, method: Method, url: String, body: Option<&Value>, stream: bool) -> RequestSpec {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-client", self.api_client.clone());
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        RequestSpec {
            method,
            url,
            headers,
            body: body.map(|b| Bytes::from(b.to_string())),
            timeout: (!stream).then_some(self.timeout),
        }
    }

    /// `generateContent`, or `streamGenerateContent?alt=sse` when `stream` is set.
    pub async fn generate_content(
        &self,
        pool: &CredentialPool,
        model: &str,
        stream: bool,
        body: &Value,
    ) -> anyhow::Result<reqwest::Response> {
        let url = if stream {
            self.url(&format!("models/{model}:streamGenerateContent?alt=sse"))
        } else {
            self.url(&format!("models/{model}:generateContent"))
        };
        let spec = self.spec(Method::POST, url, Some(body), stream);
        Ok(self.dispatcher.execute(pool, &spec).await?)
    }

    /// `batchEmbedContents` for a `models/<x>` model.
    pub async fn batch_embed_contents(
        &self,
        pool: &CredentialPool,
        model: &str,
        body: &Value,
    ) -> anyhow::Result<reqwest::Response> {
        let spec = self.spec(
            Method::POST,
            self.url(&format!("{model}:batchEmbedContents")),
            Some(body),
            false,
        );
        Ok(self.dispatcher.execute(pool, &spec).await?)
    }

    pub async fn list_models(&self, pool: &CredentialPool) -> anyhow::Result<reqwest::Response> {
        let spec = self.spec(Method::GET, self.url("models"), None, false);
        Ok(self.dispatcher.execute(pool, &spec).await?)
    }
}
