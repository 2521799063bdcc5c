//! Configuration types for gemini-gateway.
//!
//! Config is loaded from a TOML file and validated before the server opens
//! its port. Every field has a default, so a missing file (or an empty one)
//! yields a working gateway that reads its API keys from the environment.
//! Invalid configs are rejected with a clear error rather than silently
//! falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! port         = 8080
//! api_keys_env = "GEMINI_API_KEYS"
//!
//! [upstream]
//! base_url    = "https://generativelanguage.googleapis.com"
//! api_version = "v1beta"
//!
//! [models]
//! default_chat = "gemini-2.0-flash"
//! ```

use std::path::Path;

use anyhow::Context;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub models: ModelsConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but an absent file yields the built-in defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gateway.port != 0, "[gateway] port must not be 0");
        anyhow::ensure!(
            (1..=MAX_COOLDOWN_SECS).contains(&self.gateway.cooldown_secs),
            "[gateway] cooldown_secs must be between 1 and {MAX_COOLDOWN_SECS}"
        );
        anyhow::ensure!(
            (1..=MAX_COOLDOWN_SECS).contains(&self.gateway.entitlement_cooldown_secs),
            "[gateway] entitlement_cooldown_secs must be between 1 and {MAX_COOLDOWN_SECS}"
        );
        anyhow::ensure!(self.gateway.max_pools > 0, "[gateway] max_pools must be positive");
        self.gateway.suspension_tz()?;

        let base = self.upstream.base_url.as_str();
        anyhow::ensure!(
            base.starts_with("http://") || base.starts_with("https://"),
            "[upstream] base_url `{base}` must be an http(s) URL"
        );
        let ws = self.upstream.ws_base_url.as_str();
        anyhow::ensure!(
            ws.starts_with("ws://") || ws.starts_with("wss://"),
            "[upstream] ws_base_url `{ws}` must be a ws(s) URL"
        );
        anyhow::ensure!(
            !self.upstream.api_version.is_empty(),
            "[upstream] api_version must not be empty"
        );
        anyhow::ensure!(
            !self.models.default_chat.is_empty() && !self.models.default_embeddings.is_empty(),
            "[models] defaults must not be empty"
        );
        Ok(())
    }
}

/// Upper bound for either cooldown (30 days).
pub const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 60 * 60;

/// Log line format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Listen port (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Environment variable holding the deployment's comma-separated key list.
    ///
    /// Used when a request carries no `Authorization: Bearer` list of its own.
    #[serde(default = "defaults::api_keys_env")]
    pub api_keys_env: String,

    /// Cooldown after a transport error or 5xx (default: 60 s).
    #[serde(default = "defaults::cooldown_secs")]
    pub cooldown_secs: u64,

    /// Cooldown after any other non-429 rejection (default: 600 s).
    #[serde(default = "defaults::entitlement_cooldown_secs")]
    pub entitlement_cooldown_secs: u64,

    /// IANA zone whose midnight ends a rate-limit suspension.
    ///
    /// Read at startup; a hot-reload does not change it.
    #[serde(default = "defaults::suspension_timezone")]
    pub suspension_timezone: String,

    /// Most credential pools kept in memory at once (default: 1024).
    ///
    /// Read at startup; a hot-reload does not change it.
    #[serde(default = "defaults::max_pools")]
    pub max_pools: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            log_level: None,
            log_format: LogFormat::default(),
            api_keys_env: defaults::api_keys_env(),
            cooldown_secs: defaults::cooldown_secs(),
            entitlement_cooldown_secs: defaults::entitlement_cooldown_secs(),
            suspension_timezone: defaults::suspension_timezone(),
            max_pools: defaults::max_pools(),
        }
    }
}

impl GatewayConfig {
    /// Resolve the deployment key list from the configured environment variable.
    pub fn api_keys(&self) -> Option<String> {
        std::env::var(&self.api_keys_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    pub fn suspension_tz(&self) -> anyhow::Result<Tz> {
        self.suspension_timezone.parse::<Tz>().map_err(|e| {
            anyhow::anyhow!(
                "[gateway] suspension_timezone `{}` is not a known IANA zone: {e}",
                self.suspension_timezone
            )
        })
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn entitlement_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.entitlement_cooldown_secs as i64)
    }
}

/// Where and how the upstream API is reached.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    #[serde(default = "defaults::api_version")]
    pub api_version: String,

    /// Base for relayed websocket sessions; the client's path and query are appended.
    #[serde(default = "defaults::ws_base_url")]
    pub ws_base_url: String,

    /// Value sent as `x-goog-api-client`.
    #[serde(default = "defaults::api_client")]
    pub api_client: String,

    /// Timeout for non-streaming calls in milliseconds (default: 300 000).
    /// Streaming calls are never timed out.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            api_version: defaults::api_version(),
            ws_base_url: defaults::ws_base_url(),
            api_client: defaults::api_client(),
            timeout_ms: defaults::timeout_ms(),
        }
    }
}

/// Fallback models for requests naming something upstream does not serve.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    #[serde(default = "defaults::default_chat")]
    pub default_chat: String,

    #[serde(default = "defaults::default_embeddings")]
    pub default_embeddings: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_chat: defaults::default_chat(),
            default_embeddings: defaults::default_embeddings(),
        }
    }
}

mod defaults {
    pub fn port() -> u16 { 8080 }
    pub fn api_keys_env() -> String { "GEMINI_API_KEYS".into() }
    pub fn cooldown_secs() -> u64 { 60 }
    pub fn entitlement_cooldown_secs() -> u64 { 600 }
    pub fn suspension_timezone() -> String { "America/Los_Angeles".into() }
    pub fn max_pools() -> usize { 1024 }
    pub fn base_url() -> String { "https://generativelanguage.googleapis.com".into() }
    pub fn api_version() -> String { "v1beta".into() }
    pub fn ws_base_url() -> String { "wss://generativelanguage.googleapis.com".into() }
    pub fn api_client() -> String { "genai-js/0.21.0".into() }
    pub fn timeout_ms() -> u64 { 300_000 }
    pub fn default_chat() -> String { "gemini-2.0-flash".into() }
    pub fn default_embeddings() -> String { "text-embedding-004".into() }
}
