//! Otto daemon entry point.
//!
//! Loads configuration, wires services over the local adapters, then runs
//! the worker pool, trigger loops and HTTP facade until SIGINT.

use anyhow::{Context, Result};
use otto_common::config::ConfigSet;
use otto_common::os_adapter::LocalOsAdapter;
use otto_common::services::Services;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ottod=info,otto_common=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_dir = env_path("OTTO_CONFIG_DIR", "./config");
    let data_dir = env_path("OTTO_DATA_DIR", "./data");
    let config = ConfigSet::load(&config_dir, &data_dir)
        .with_context(|| format!("loading config from {}", config_dir.display()))?;
    let bind = std::env::var("OTTO_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:7700".to_string());

    let services = Arc::new(Services::new(
        config,
        Arc::new(LocalOsAdapter),
        Arc::new(otto_common::web_engine::DisconnectedWebEngine),
    )?);
    let _ = services
        .audit
        .append("daemon_start", None, serde_json::json!({"bind": bind}));

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = ottod::worker::spawn(services.clone(), shutdown.clone());
    handles.extend(ottod::triggers::spawn(services.clone(), shutdown.clone()));

    let state = ottod::http::AppState::new(services.clone());
    let router = ottod::http::router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "ottod listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.abort();
    }
    let _ = services.audit.append("daemon_stop", None, serde_json::json!({}));
    Ok(())
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
