//! Shared application state injected into every handler via [`axum::extract::State`].

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::{
    config::Config,
    credentials::{CredentialPool, PoolRegistry},
    storage::KvStore,
    upstream::GeminiClient,
};

pub struct GatewayState {
    /// Atomically-swappable live config; the lock is held only for the duration
    /// of `Arc::clone`, so it never blocks request handling.
    config_lock: Arc<RwLock<Arc<Config>>>,
    /// Path to the config file on disk, watched by the hot-reload task.
    pub config_path: PathBuf,
    /// Credential pools, one per distinct key list.
    ///
    /// The suspension time zone is fixed when the registry is built; a
    /// hot-reload does not change it.
    pub pools: PoolRegistry,
    /// Shared upstream HTTP client (connection pool).
    pub http: reqwest::Client,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        store: Arc<dyn KvStore>,
    ) -> anyhow::Result<Self> {
        let tz = config.gateway.suspension_tz()?;
        let max_pools = config.gateway.max_pools;
        Ok(Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            pools: PoolRegistry::new(store, tz, max_pools),
            http: reqwest::Client::new(),
        })
    }

    /// Returns a snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload task.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// Upstream client bound to the current config.
    pub fn gemini(&self) -> anyhow::Result<GeminiClient> {
        GeminiClient::new(self.http.clone(), &self.config())
    }

    /// Pool for this request's credentials.
    ///
    /// A `Authorization: Bearer k1,k2,...` header supplies the list; without
    /// one, the deployment list from `[gateway] api_keys_env` is used.
    pub async fn pool_for(&self, headers: &HeaderMap) -> Arc<CredentialPool> {
        let from_header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let raw = from_header.or_else(|| self.config().gateway.api_keys());
        self.pools.pool_for(raw.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn state() -> GatewayState {
        let mut config = Config::default();
        config.gateway.api_keys_env = format!("GGW_STATE_TEST_{}", uuid::Uuid::new_v4().simple());
        GatewayState::new(Arc::new(config), PathBuf::from("/nonexistent"), Arc::new(MemoryStore::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn bearer_header_selects_the_pool() {
        let s = state();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer a,b,c".parse().unwrap());
        assert_eq!(s.pool_for(&headers).await.size().await, 3);
    }

    #[tokio::test]
    async fn missing_header_falls_back_to_deployment_keys() {
        let s = state();
        assert_eq!(s.pool_for(&HeaderMap::new()).await.size().await, 0);

        std::env::set_var(&s.config().gateway.api_keys_env, "x,y");
        assert_eq!(s.pool_for(&HeaderMap::new()).await.size().await, 2);
        std::env::remove_var(&s.config().gateway.api_keys_env);
    }

    #[tokio::test]
    async fn same_list_shares_one_pool() {
        let s = state();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer a,b".parse().unwrap());
        let first = s.pool_for(&headers).await;
        let second = s.pool_for(&headers).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn replace_config_swaps_snapshot() {
        let s = state();
        let mut next = (*s.config()).clone();
        next.models.default_chat = "gemini-2.5-pro".into();
        s.replace_config(Arc::new(next));
        assert_eq!(s.config().models.default_chat, "gemini-2.5-pro");
    }
}
