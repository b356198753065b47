use crate::server::AppState;
use axum::routing::post;
use axum::{Extension, Json};
use od_channels::OutboundContent;
use od_queue::{DeliveryJob, JobTarget, QueueBroker};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueRequest {
    channel_id: String,
    to: String,
    content: OutboundContent,
    #[serde(default)]
    ticket_id: Option<String>,
    #[serde(default)]
    campaign: Option<CampaignRef>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CampaignRef {
    campaign_id: String,
    contact_id: String,
    #[serde(default = "default_ack")]
    ack: i64,
}

fn default_ack() -> i64 {
    1
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/desk/messages", post(enqueue_message))
}

/// Accepts a delivery for the durable queue. The response only confirms
/// enqueueing; delivery outcomes are published on the delivery status topic.
#[tracing::instrument(level = "info", skip_all)]
async fn enqueue_message(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> Json<serde_json::Value> {
    let target = match (req.campaign, req.ticket_id) {
        (Some(campaign), None) => JobTarget::Campaign {
            campaign_id: campaign.campaign_id.into(),
            contact_id: campaign.contact_id.into(),
            ack: campaign.ack,
        },
        (None, Some(ticket_id)) => JobTarget::Ticket {
            ticket_id: ticket_id.into(),
        },
        _ => {
            return Json(serde_json::json!({
                "status": "error",
                "error": "exactly one of ticket_id or campaign is required",
            }));
        }
    };

    let mut job = DeliveryJob::new(req.channel_id.into(), target, req.to, req.content);
    if let Some(max_attempts) = req.max_attempts {
        job = job.with_max_attempts(max_attempts);
    }
    let job_id = job.id.clone();

    if let Err(e) = state.broker.enqueue(job).await {
        return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
    }
    Json(serde_json::json!({ "status": "queued", "job_id": job_id }))
}
