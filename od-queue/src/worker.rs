use crate::broker::QueueBroker;
use crate::error::Result;
use crate::job::{BackoffPolicy, DeliveryJob, JobTarget};
use chrono::Utc;
use od_channels::OutboundContent;
use od_session::{
    CampaignDelivery, ChannelStore, DeliveryOutcome, EventSink, SessionRegistry, publish_or_log,
    topics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_LEASE: Duration = Duration::from_secs(60);
const DEFAULT_BATCH: usize = 8;

/// Ack level a freshly completed send establishes. Delivery receipts and
/// read receipts arrive later with higher values and merge monotonically.
const ACK_SENT: i64 = 1;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease_for: Duration,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_for: DEFAULT_LEASE,
            batch_size: DEFAULT_BATCH,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Delivered,
    Retried,
    Parked,
}

/// Pool of workers draining the delivery queue.
///
/// Each job resolves its channel's live session from the registry,
/// dispatches by kind, and writes the outcome back. Failures never cross
/// the job boundary: they become a retry with backoff or, once attempts
/// run out, a parked job with a persisted error outcome.
pub struct DeliveryWorkerPool {
    broker: Arc<dyn QueueBroker>,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChannelStore>,
    events: Arc<dyn EventSink>,
    config: WorkerConfig,
}

impl DeliveryWorkerPool {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChannelStore>,
        events: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            registry,
            store,
            events,
            config,
        })
    }

    /// Spawn the configured number of polling workers; they run until
    /// cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        for worker_index in 0..self.config.workers.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::debug!(worker_index, "delivery worker started");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::debug!(worker_index, "delivery worker stopped");
                            return;
                        }
                        _ = tokio::time::sleep(pool.config.poll_interval) => {}
                    }
                    match pool.run_batch().await {
                        Ok(0) => {}
                        Ok(processed) => {
                            tracing::debug!(worker_index, processed, "delivery batch finished")
                        }
                        Err(error) => {
                            tracing::warn!(worker_index, %error, "delivery batch failed")
                        }
                    }
                }
            });
        }
    }

    /// Lease and process one batch. Returns how many jobs were handled.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run_batch(&self) -> Result<usize> {
        let jobs = self
            .broker
            .lease(self.config.batch_size, self.config.lease_for)
            .await?;
        let leased = jobs.len();
        for job in jobs {
            self.process(job).await;
        }
        Ok(leased)
    }

    /// Process a single leased job end to end. Never returns an error: the
    /// outcome is written to the broker and the store instead.
    async fn process(&self, job: DeliveryJob) {
        match self.attempt(&job).await {
            Ok(()) => {
                if let Err(error) = self.broker.ack(&job.id).await {
                    // The send happened; a lost ack just means one extra
                    // delivery attempt later. At-least-once, not exactly-once.
                    tracing::warn!(job_id = %job.id, %error, "acking delivered job failed");
                }
                self.record_outcome(&job, AttemptOutcome::Delivered, None)
                    .await;
            }
            Err(error) => {
                let detail = error.to_string();
                tracing::warn!(
                    job_id = %job.id,
                    channel_id = %job.channel_id,
                    kind = job.kind_str(),
                    attempt = job.attempts_made,
                    error = %detail,
                    "delivery attempt failed"
                );
                if job.attempts_exhausted() {
                    if let Err(error) = self.broker.park(&job.id, &detail).await {
                        tracing::error!(job_id = %job.id, %error, "parking exhausted job failed");
                    }
                    self.record_outcome(&job, AttemptOutcome::Parked, Some(&detail))
                        .await;
                } else {
                    let delay = self.config.backoff.delay_after(job.attempts_made);
                    if let Err(error) = self.broker.nack(&job.id, delay).await {
                        tracing::error!(job_id = %job.id, %error, "rescheduling job failed");
                    }
                    self.record_outcome(&job, AttemptOutcome::Retried, Some(&detail))
                        .await;
                }
            }
        }
    }

    /// One send attempt. Errors here are retryable by definition; anything
    /// permanent is expressed through the attempt budget.
    async fn attempt(&self, job: &DeliveryJob) -> anyhow::Result<()> {
        let handle = self
            .registry
            .get(&job.channel_id)
            .filter(|handle| handle.is_ready())
            .ok_or_else(|| anyhow::anyhow!("channel {} has no live session", job.channel_id))?;

        let receipt = handle.session().send(&job.to, &job.content).await?;
        handle.touch_heartbeat();

        if let JobTarget::Campaign {
            campaign_id,
            contact_id,
            ack,
        } = &job.target
        {
            self.store
                .merge_campaign_ack(
                    campaign_id,
                    contact_id,
                    CampaignDelivery {
                        message_id: receipt.message_id,
                        random: receipt.random,
                        ack: (*ack).max(ACK_SENT),
                        body: content_body(&job.content),
                        timestamp: Utc::now(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn record_outcome(&self, job: &DeliveryJob, outcome: AttemptOutcome, detail: Option<&str>) {
        let (status, stored) = match outcome {
            AttemptOutcome::Delivered => ("sent", Some(DeliveryOutcome::Sent)),
            AttemptOutcome::Retried => ("retrying", None),
            AttemptOutcome::Parked => ("error", Some(DeliveryOutcome::Error)),
        };

        if let Some(stored) = stored {
            if let Err(error) = self
                .store
                .record_delivery(job.id.as_str(), stored, detail)
                .await
            {
                tracing::error!(job_id = %job.id, %error, "recording delivery outcome failed");
            }
        }

        publish_or_log(
            self.events.as_ref(),
            topics::DELIVERY_STATUS,
            serde_json::json!({
                "message_ref": job.id,
                "channel_id": job.channel_id,
                "kind": job.kind_str(),
                "status": status,
                "attempt": job.attempts_made,
                "detail": detail,
            }),
        )
        .await;
    }
}

/// Human-readable body stored alongside campaign bookkeeping.
fn content_body(content: &OutboundContent) -> String {
    match content {
        OutboundContent::Text { body } => body.clone(),
        OutboundContent::Interactive { body, .. } => body.clone(),
        OutboundContent::Template { template, .. } => template.clone(),
        OutboundContent::Reaction { emoji, .. } => emoji.clone(),
    }
}
