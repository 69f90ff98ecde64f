//! Status API server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::HostState;

/// Build the status API router
pub fn router(state: Arc<HostState>) -> Router {
    Router::new()
        .route("/api/plugins", get(api::list_plugins))
        .route("/api/devices", get(api::list_devices))
        .route("/api/message-types", get(api::list_message_types))
        .route("/api/stats", get(api::get_stats))
        .route("/api/detect", post(api::trigger_detect))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the status API over plain HTTP until `shutdown` flips
pub async fn run(state: Arc<HostState>, bind: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting status API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
