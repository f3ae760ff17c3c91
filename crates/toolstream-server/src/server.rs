use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use toolstream_engine::{Runner, TypingConfig};

use crate::handlers;
use crate::runs::RunRegistry;

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Events buffered per run before the loop waits on the client.
    pub send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
    pub runs: Arc<RunRegistry>,
    pub typing: Option<TypingConfig>,
    pub send_queue: usize,
}

impl AppState {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self {
            runner,
            runs: Arc::new(RunRegistry::new()),
            typing: None,
            send_queue: ServerConfig::default().send_queue,
        }
    }

    pub fn with_typing(mut self, typing: Option<TypingConfig>) -> Self {
        self.typing = typing;
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/runs/{run_id}", delete(handlers::cancel_run))
        .route("/api/tools", get(handlers::list_tools))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns once the listener is bound.
pub async fn start(config: ServerConfig, mut state: AppState) -> Result<ServerHandle, std::io::Error> {
    state.send_queue = config.send_queue.max(1);
    let router = build_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "toolstream server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        runs: state.runs,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    runs: Arc<RunRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// Stop accepting connections, cancel active runs, and wait for open
    /// responses to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let cancelled = self.runs.cancel_all();
        if cancelled > 0 {
            tracing::info!(runs = cancelled, "cancelled active runs for shutdown");
        }
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed to join");
        }
    }
}
