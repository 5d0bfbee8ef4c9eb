//! Web server module: the command surface over HTTP plus an SSE event stream.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::engine::Engine;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Web server for pingtrail.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, engine: Arc<Engine>) -> Self {
        Self {
            config,
            state: AppState { engine },
        }
    }

    /// Start the server on the configured port and serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Build the router with all routes.
pub(crate) fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // Lifecycle
        .route("/api/start", post(handlers::handle_start))
        .route("/api/stop", post(handlers::handle_stop))
        .route("/api/state", get(handlers::handle_state))
        // Targets
        .route(
            "/api/targets",
            get(handlers::handle_list_targets).post(handlers::handle_add_target),
        )
        .route(
            "/api/targets/{id}",
            put(handlers::handle_update_target).delete(handlers::handle_remove_target),
        )
        .route("/api/targets/{id}/toggle", post(handlers::handle_toggle_target))
        .route("/api/presets", get(handlers::handle_presets))
        // Settings and statistics
        .route("/api/interval", put(handlers::handle_set_interval))
        .route("/api/statistics", get(handlers::handle_get_statistics))
        .route("/api/statistics/reset", post(handlers::handle_reset_statistics))
        .route("/api/recent", get(handlers::handle_recent))
        .route(
            "/api/config",
            get(handlers::handle_get_config).put(handlers::handle_save_config),
        )
        .route("/api/log-path", get(handlers::handle_log_path))
        // Events
        .route("/api/events", get(handlers::handle_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
