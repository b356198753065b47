use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use od_queue::QueueBroker;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/desk/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let registry = state.supervisor.registry();
    let channel_ids = registry.channel_ids();
    let ready = channel_ids
        .iter()
        .filter(|id| registry.contains_ready(id))
        .count();

    let queue = match state.broker.counts().await {
        Ok(counts) => counts,
        Err(e) => {
            return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
        }
    };

    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": {
            "registered": channel_ids.len(),
            "ready": ready,
        },
        "queue": {
            "pending": queue.pending,
            "leased": queue.leased,
            "dead": queue.dead,
        }
    }))
}
