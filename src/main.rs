use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod bridge;
mod config;
mod credentials;
mod dispatcher;
mod error;
mod state;
mod storage;
mod stream;
mod upstream;

use config::{Config, LogFormat};
use state::GatewayState;
use storage::MemoryStore;

const DEFAULT_FILTER: &str = "gemini_gateway=info,tower_http=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    let config_path = std::env::var("GGW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/gemini-gateway/config.toml"));

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    init_tracing(&config);

    info!(
        port = config.gateway.port,
        config = %config_path.display(),
        upstream = %config.upstream.base_url,
        "gemini-gateway starting"
    );
    if config.gateway.api_keys().is_none() {
        warn!(
            env = %config.gateway.api_keys_env,
            "no deployment API keys set; requests must bring their own"
        );
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    let state = Arc::new(GatewayState::new(
        Arc::new(config),
        config_path.clone(),
        Arc::new(MemoryStore::new()),
    )?);

    // Hot-reload watcher: polls the config file every 5 seconds
    tokio::spawn(config_watcher(Arc::clone(&state)));

    let app = api::app(Arc::clone(&state)).layer(
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down cleanly");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            config
                .gateway
                .log_level
                .as_deref()
                .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| DEFAULT_FILTER.into());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.gateway.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `gemini-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("GGW_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on change.
///
/// Uses filesystem `mtime` for change detection. Parse failures are logged and
/// ignored; the running config is unchanged. The listen port, suspension time
/// zone and pool capacity are not affected by a reload.
async fn config_watcher(state: Arc<GatewayState>) {
    let path = &state.config_path;

    let mut last_mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime || mtime.is_none() {
            continue;
        }

        match Config::load(path) {
            Ok(new_cfg) => {
                let previous = state.config();
                if new_cfg.gateway.port != previous.gateway.port
                    || new_cfg.gateway.suspension_timezone != previous.gateway.suspension_timezone
                    || new_cfg.gateway.max_pools != previous.gateway.max_pools
                {
                    warn!("port, suspension_timezone and max_pools changes need a restart");
                }
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{e:#}"), "config reload failed; keeping previous config");
            }
        }
    }
}
