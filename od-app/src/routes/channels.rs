use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Extension, Json};
use od_channels::{ChannelId, ChannelKind};
use od_session::{ChannelRecord, ChannelStatus, ChannelStore, OperationKind, SessionError};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterRequest {
    tenant_id: String,
    kind: ChannelKind,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/desk/channels", get(list_channels))
        .route(
            "/api/v1/desk/channels/{id}",
            get(get_channel).put(register_channel),
        )
        .route("/api/v1/desk/channels/{id}/start", post(start_channel))
        .route("/api/v1/desk/channels/{id}/stop", post(stop_channel))
        .route("/api/v1/desk/channels/{id}/restart", post(restart_channel))
        .route(
            "/api/v1/desk/channels/{id}/clear-cache",
            post(clear_channel_cache),
        )
}

fn channel_json(record: &ChannelRecord, live: bool) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "tenant_id": record.tenant_id,
        "kind": record.kind,
        "status": record.status,
        "qr_payload": record.qr_payload,
        "retries": record.retries,
        "is_active": record.is_active,
        "live": live,
    })
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_channels(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let records = match state.store.list_active_channels().await {
        Ok(records) => records,
        Err(e) => {
            return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
        }
    };
    let registry = state.supervisor.registry();
    let channels: Vec<serde_json::Value> = records
        .iter()
        .map(|record| channel_json(record, registry.contains_ready(&record.id)))
        .collect();
    Json(serde_json::json!({ "channels": channels }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_channel(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let channel_id = ChannelId::from(id);
    match state.store.load_channel(&channel_id).await {
        Ok(Some(record)) => {
            let live = state.supervisor.registry().contains_ready(&channel_id);
            Json(serde_json::json!({ "channel": channel_json(&record, live) }))
        }
        Ok(None) => Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

/// Register a channel or update its tenant/kind/active flags. Connection
/// state (status, credentials, retry count) is preserved across updates.
#[tracing::instrument(level = "info", skip_all)]
async fn register_channel(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> Json<serde_json::Value> {
    let channel_id = ChannelId::from(id);
    let record = match state.store.load_channel(&channel_id).await {
        Ok(Some(mut existing)) => {
            existing.tenant_id = req.tenant_id.into();
            existing.kind = req.kind;
            existing.is_active = req.is_active;
            existing
        }
        Ok(None) => ChannelRecord {
            id: channel_id.clone(),
            tenant_id: req.tenant_id.into(),
            kind: req.kind,
            status: ChannelStatus::Disconnected,
            qr_payload: None,
            session_blob: None,
            retries: 0,
            is_active: req.is_active,
        },
        Err(e) => {
            return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
        }
    };
    if let Err(e) = state.store.upsert_channel(&record).await {
        return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
    }
    let live = state.supervisor.registry().contains_ready(&channel_id);
    Json(serde_json::json!({ "status": "ok", "channel": channel_json(&record, live) }))
}

/// Connecting can take minutes (QR pairing); the start runs in the
/// background and progress is published on the channel status topic.
#[tracing::instrument(level = "info", skip_all)]
async fn start_channel(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let channel_id = ChannelId::from(id);
    if state
        .supervisor
        .locks()
        .is_held(OperationKind::Start, &channel_id)
    {
        return Json(serde_json::json!({ "status": "already_in_progress" }));
    }
    match state.store.load_channel(&channel_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => {
            return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
        }
    }

    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        match supervisor.start_session(&channel_id).await {
            Ok(outcome) => {
                tracing::info!(%channel_id, ?outcome, "session start finished");
            }
            Err(error) => {
                tracing::warn!(%channel_id, %error, "session start failed");
            }
        }
    });
    Json(serde_json::json!({ "status": "starting" }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn stop_channel(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let channel_id = ChannelId::from(id);
    match state.supervisor.stop_session(&channel_id).await {
        Ok(od_session::ControlOutcome::Completed) => Json(serde_json::json!({ "status": "ok" })),
        Ok(od_session::ControlOutcome::AlreadyInProgress) => {
            Json(serde_json::json!({ "status": "already_in_progress" }))
        }
        Err(SessionError::ChannelNotFound(_)) => {
            Json(serde_json::json!({ "status": "not_found" }))
        }
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn restart_channel(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let channel_id = ChannelId::from(id);
    if state
        .supervisor
        .locks()
        .is_held(OperationKind::Update, &channel_id)
    {
        return Json(serde_json::json!({ "status": "already_in_progress" }));
    }
    match state.store.load_channel(&channel_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => {
            return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
        }
    }

    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        match supervisor.restart_session(&channel_id).await {
            Ok(outcome) => {
                tracing::info!(%channel_id, ?outcome, "session restart finished");
            }
            Err(error) => {
                tracing::warn!(%channel_id, %error, "session restart failed");
            }
        }
    });
    Json(serde_json::json!({ "status": "restarting" }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn clear_channel_cache(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let channel_id = ChannelId::from(id);
    match state.supervisor.clear_session_cache(&channel_id).await {
        Ok(od_session::ControlOutcome::Completed) => Json(serde_json::json!({ "status": "ok" })),
        Ok(od_session::ControlOutcome::AlreadyInProgress) => {
            Json(serde_json::json!({ "status": "already_in_progress" }))
        }
        Err(SessionError::ChannelBusy(_)) => Json(serde_json::json!({ "status": "busy" })),
        Err(SessionError::ChannelNotFound(_)) => {
            Json(serde_json::json!({ "status": "not_found" }))
        }
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}
