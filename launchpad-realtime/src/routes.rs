use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::service::RealtimeService;

pub fn create_router(service: Arc<RealtimeService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(service)
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(service): State<Arc<RealtimeService>>) -> Json<Value> {
    Json(json!({
        "providers": service.provider_statuses(),
        "connections": service.connection_count().await,
        "rooms": service.room_count().await,
        "queuedEvents": service.queued_events().await,
        "watcherEnabled": service.watcher_enabled(),
    }))
}
