//! Retrying upstream dispatch across a credential pool.
//!
//! One logical call makes at most one attempt per credential in the pool.
//! Each attempt takes the next available credential, sends the request with
//! it, and classifies the outcome:
//!
//! | outcome                      | credential effect                 | next step |
//! |------------------------------|-----------------------------------|-----------|
//! | transport error              | short cooldown                    | retry     |
//! | status >= 500                | short cooldown                    | retry     |
//! | 429                          | suspended until local midnight    | retry     |
//! | 200                          | none                              | return    |
//! | any other status             | entitlement cooldown              | retry     |
//!
//! There is no delay between attempts.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{header::HeaderMap, Client, Method, StatusCode};
use tracing::{debug, info, warn};

use crate::{
    credentials::{mask, Credential, CredentialPool},
    error::GatewayError,
};

/// Header carrying the credential on every upstream request.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Upstream error bodies are truncated to this many characters when kept as
/// failure detail.
const DETAIL_LIMIT: usize = 512;

/// A fully described upstream request, minus the credential.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request timeout. `None` for streaming calls, which may legitimately
    /// stay open for minutes.
    pub timeout: Option<Duration>,
}

/// How long failing credentials are parked.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Applied after transport errors and 5xx responses.
    pub cooldown: chrono::Duration,
    /// Applied after non-429 client errors (bad key, missing entitlement).
    pub entitlement_cooldown: chrono::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cooldown: chrono::Duration::minutes(1),
            entitlement_cooldown: chrono::Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Cooldown,
    Suspend,
    Entitlement,
}

fn classify(status: StatusCode) -> Outcome {
    if status.as_u16() >= 500 {
        Outcome::Cooldown
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Outcome::Suspend
    } else if status == StatusCode::OK {
        Outcome::Success
    } else {
        Outcome::Entitlement
    }
}

#[derive(Debug, Clone)]
pub struct RetryDispatcher {
    client: Client,
    policy: RetryPolicy,
}

impl RetryDispatcher {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Send `spec` upstream, rotating through `pool` until an attempt returns
    /// 200 or every credential has been tried once.
    ///
    /// On success the response is returned unread so streaming bodies can be
    /// forwarded as they arrive.
    pub async fn execute(
        &self,
        pool: &CredentialPool,
        spec: &RequestSpec,
    ) -> Result<reqwest::Response, GatewayError> {
        let budget = pool.size().await;
        if budget == 0 {
            return Err(GatewayError::NoCredentialsConfigured);
        }

        let mut last_status = None;
        let mut detail = None;

        for attempt in 1..=budget {
            let Some(credential) = pool.next_available().await else {
                info!(attempt, budget, "no credential available");
                return Err(GatewayError::CredentialsExhausted);
            };
            let key = mask(&credential.secret);

            let response = match self.send(spec, &credential).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, credential = %key, error = %e, "upstream transport error");
                    detail = Some(e.to_string());
                    pool.mark_cooldown(&credential, self.policy.cooldown).await;
                    continue;
                }
            };

            let status = response.status();
            let outcome = classify(status);
            if outcome == Outcome::Success {
                debug!(attempt, credential = %key, "upstream accepted request");
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            warn!(attempt, credential = %key, %status, "upstream rejected request");
            last_status = Some(status);
            detail = Some(truncate(&body));

            match outcome {
                Outcome::Suspend => pool.mark_suspended(&credential).await,
                Outcome::Entitlement => {
                    pool.mark_cooldown(&credential, self.policy.entitlement_cooldown)
                        .await
                }
                _ => pool.mark_cooldown(&credential, self.policy.cooldown).await,
            }
        }

        Err(GatewayError::AllCredentialsFailed { last_status, detail })
    }

    async fn send(
        &self,
        spec: &RequestSpec,
        credential: &Credential,
    ) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .request(spec.method.clone(), &spec.url)
            .headers(spec.headers.clone())
            .header(API_KEY_HEADER, &credential.secret);
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }
        if let Some(timeout) = spec.timeout {
            request = request.timeout(timeout);
        }
        request.send().await
    }
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(DETAIL_LIMIT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{credentials::CredentialState, storage::MemoryStore};

    fn pool(raw: &str) -> CredentialPool {
        CredentialPool::new(
            Some(raw),
            chrono_tz::America::Los_Angeles,
            Arc::new(MemoryStore::new()),
        )
    }

    fn dispatcher() -> RetryDispatcher {
        RetryDispatcher::new(Client::new(), RetryPolicy::default())
    }

    fn spec(url: String) -> RequestSpec {
        RequestSpec {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Some(Bytes::from_static(b"{}")),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    async fn key_mock(server: &MockServer, key: &str, status: u16, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(header(API_KEY_HEADER, key))
            .respond_with(ResponseTemplate::new(status).set_body_string(format!("{key} -> {status}")))
            .expect(expected)
            .mount(server)
            .await;
    }

    // -----------------------------------------------------------------------
    // Budget and availability
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn empty_pool_fails_without_calling_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = dispatcher()
            .execute(&pool(""), &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoCredentialsConfigured));
    }

    #[tokio::test]
    async fn all_parked_fails_without_calling_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let p = pool("k1,k2");
        for _ in 0..2 {
            let c = p.next_available().await.unwrap();
            p.mark_cooldown(&c, chrono::Duration::minutes(5)).await;
        }

        let err = dispatcher()
            .execute(&p, &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CredentialsExhausted));
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn first_success_returns_without_touching_other_keys() {
        let server = MockServer::start().await;
        key_mock(&server, "k1", 200, 1).await;
        key_mock(&server, "k2", 200, 0).await;

        let p = pool("k1,k2");
        let response = dispatcher()
            .execute(&p, &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "k1 -> 200");
        assert!(p
            .states()
            .await
            .iter()
            .all(|s| *s == CredentialState::Available));
    }

    #[tokio::test]
    async fn server_error_cools_down_and_moves_to_next_key() {
        let server = MockServer::start().await;
        key_mock(&server, "k1", 503, 1).await;
        key_mock(&server, "k2", 200, 1).await;

        let p = pool("k1,k2");
        let before = Utc::now();
        let response = dispatcher()
            .execute(&p, &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "k2 -> 200");

        let states = p.states().await;
        match &states[0] {
            CredentialState::Cooldown { until } => {
                assert!(*until >= before + chrono::Duration::seconds(59));
                assert!(*until <= Utc::now() + chrono::Duration::seconds(61));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(states[1], CredentialState::Available);
    }

    #[tokio::test]
    async fn too_many_requests_suspends_key() {
        let server = MockServer::start().await;
        key_mock(&server, "k1", 429, 1).await;
        key_mock(&server, "k2", 200, 1).await;

        let p = pool("k1,k2");
        dispatcher()
            .execute(&p, &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap();
        assert!(matches!(p.states().await[0], CredentialState::Suspended { .. }));
    }

    #[tokio::test]
    async fn client_error_applies_entitlement_cooldown() {
        let server = MockServer::start().await;
        key_mock(&server, "k1", 403, 1).await;
        key_mock(&server, "k2", 200, 1).await;

        let p = pool("k1,k2");
        dispatcher()
            .execute(&p, &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap();
        match &p.states().await[0] {
            CredentialState::Cooldown { until } => {
                assert!(*until > Utc::now() + chrono::Duration::minutes(9));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_key_failing_reports_last_status_after_one_attempt_each() {
        let server = MockServer::start().await;
        key_mock(&server, "k1", 500, 1).await;
        key_mock(&server, "k2", 502, 1).await;
        key_mock(&server, "k3", 400, 1).await;

        let p = pool("k1,k2,k3");
        let err = dispatcher()
            .execute(&p, &spec(format!("{}/generate", server.uri())))
            .await
            .unwrap_err();
        match err {
            GatewayError::AllCredentialsFailed { last_status, detail } => {
                assert_eq!(last_status, Some(StatusCode::BAD_REQUEST));
                assert_eq!(detail.as_deref(), Some("k3 -> 400"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(p
            .states()
            .await
            .iter()
            .all(|s| matches!(s, CredentialState::Cooldown { .. })));
    }

    #[tokio::test]
    async fn transport_errors_cool_down_every_key() {
        // Nothing listens on port 1.
        let p = pool("k1,k2");
        let err = dispatcher()
            .execute(&p, &spec("http://127.0.0.1:1/generate".into()))
            .await
            .unwrap_err();
        match err {
            GatewayError::AllCredentialsFailed { last_status, .. } => assert_eq!(last_status, None),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(p
            .states()
            .await
            .iter()
            .all(|s| matches!(s, CredentialState::Cooldown { .. })));
    }

    #[tokio::test]
    async fn spec_headers_and_body_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(header("x-goog-api-client", "test-client"))
            .and(header(API_KEY_HEADER, "k1"))
            .and(wiremock::matchers::body_string("{\"a\":1}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut s = spec(format!("{}/generate", server.uri()));
        s.headers.insert("x-goog-api-client", "test-client".parse().unwrap());
        s.body = Some(Bytes::from_static(b"{\"a\":1}"));
        let response = dispatcher().execute(&pool("k1"), &s).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn classify_matches_status_table() {
        assert_eq!(classify(StatusCode::OK), Outcome::Success);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR), Outcome::Cooldown);
        assert_eq!(classify(StatusCode::GATEWAY_TIMEOUT), Outcome::Cooldown);
        assert_eq!(classify(StatusCode::TOO_MANY_REQUESTS), Outcome::Suspend);
        assert_eq!(classify(StatusCode::FORBIDDEN), Outcome::Entitlement);
        assert_eq!(classify(StatusCode::NO_CONTENT), Outcome::Entitlement);
        for code in [600, 799, 999] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify(status), Outcome::Cooldown, "{code}");
        }
    }

    #[test]
    fn truncate_limits_long_bodies() {
        let long = "x".repeat(DETAIL_LIMIT + 10);
        let cut = truncate(&long);
        assert_eq!(cut.len(), DETAIL_LIMIT + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("  short  "), "short");
    }
}
