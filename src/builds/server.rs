use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::auth::StaticTokens;
use super::broadcast::Broadcaster;
use super::db::{BuildDb, DbHandle};
use super::fetcher::GitFetcher;
use super::orchestrator::{BuildOrchestrator, BuildSettings};
use super::queue::BuildQueue;
use super::ws;

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub webhook_secret: String,
    pub ws_tokens: Vec<String>,
    pub build: BuildSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from(".gamenest/builds.db"),
            dev_mode: false,
            webhook_secret: String::new(),
            ws_tokens: Vec::new(),
            build: BuildSettings {
                toolchain_path: None,
                export_root: PathBuf::from("./builds/build"),
                export_preset: PathBuf::from("./export/export_presets.cfg"),
                workspace_root: None,
            },
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the build server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = BuildDb::new(&config.db_path).context("Failed to initialize build database")?;
    let db = DbHandle::new(db);
    let hub = Arc::new(Broadcaster::new());

    if config.webhook_secret.is_empty() {
        tracing::warn!("webhook secret is empty; every webhook delivery will be rejected");
    }
    if config.build.toolchain_path.is_none() {
        tracing::warn!("export toolchain is not configured; builds will fail until GODOT_PATH is set");
    }
    let tokens = StaticTokens::new(config.ws_tokens.iter().cloned());
    if tokens.is_empty() {
        tracing::warn!("no realtime tokens configured; websocket connections will be rejected");
    }

    let orchestrator = Arc::new(BuildOrchestrator::new(
        db.clone(),
        hub.clone(),
        Arc::new(GitFetcher),
        config.build.clone(),
    ));
    let (queue, consumer) = BuildQueue::start(orchestrator);

    let state = Arc::new(AppState {
        db,
        hub: hub.clone(),
        queue,
        webhook_secret: config.webhook_secret.clone(),
        tokens: Arc::new(tokens),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr: SocketAddr = listener.local_addr()?;
    tracing::info!(%local_addr, "gamenest build server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router, and with it the last queue sender, is gone once serve returns.
    hub.shutdown();
    if let Err(e) = consumer.await {
        tracing::warn!(error = %e, "build queue consumer ended abnormally");
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
