//! REST API handlers

use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;
use tracing::info;

use crate::state::HostState;

/// List loaded plugins with their devices
pub async fn list_plugins(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    Json(state.plugins())
}

/// List live devices and their execution state
pub async fn list_devices(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    Json(state.devices())
}

pub async fn list_message_types(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    Json(state.message_types())
}

pub async fn get_stats(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    Json(state.stats())
}

/// Run hardware detection in every plugin
pub async fn trigger_detect(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    info!("Manual hardware detect triggered");

    // Detect callbacks are plugin code and may block
    let plugins = state.registration.plugins().len();
    let detect = state.clone();
    let succeeded = tokio::task::spawn_blocking(move || detect.trigger_hardware_detect())
        .await
        .unwrap_or_default();

    Json(serde_json::json!({
        "status": "completed",
        "plugins": plugins,
        "succeeded": succeeded
    }))
}
