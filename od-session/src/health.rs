use crate::error::Result;
use crate::events::{EventSink, publish_or_log, topics};
use crate::registry::SessionHandle;
use crate::status::{ChannelPatch, ChannelStatus};
use crate::store::ChannelStore;
use crate::supervisor::ConnectionSupervisor;
use chrono::Utc;
use dashmap::DashMap;
use od_channels::ChannelId;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(180);
const DEFAULT_ERROR_THRESHOLD: u32 = 3;
const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often the sweep runs.
    pub probe_interval: Duration,
    /// Sessions with a heartbeat newer than this are trusted without a probe.
    pub heartbeat_grace: Duration,
    /// Probe failures inside the rolling window before a forced restart.
    pub error_threshold: u32,
    /// Rolling window for the error count.
    pub error_window: Duration,
    /// Restarts before a channel is parked as failed.
    pub max_retries: u32,
    /// How long a session may sit non-connected before the pressure sweep
    /// reclaims it.
    pub stale_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            error_window: DEFAULT_ERROR_WINDOW,
            max_retries: DEFAULT_MAX_RETRIES,
            stale_grace: DEFAULT_STALE_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Recent traffic or a successful probe.
    Healthy,
    /// Registered but still pairing or initializing.
    Initializing,
    /// Probe failed, still under the error threshold; session kept.
    Degraded,
    /// Error threshold crossed; the session was torn down for restart.
    Unresponsive,
    /// Retry ceiling exceeded; parked until manual intervention.
    Failed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub channel_id: ChannelId,
    pub state: HealthState,
    pub error_count: u32,
    pub uptime_seconds: i64,
    pub seconds_since_heartbeat: i64,
    pub last_error: Option<String>,
}

/// Periodic liveness sweep over every registered session.
///
/// A session with recent inbound traffic passes for free; a quiet one gets
/// an active probe. Probe failures accumulate in a rolling window, and
/// crossing the threshold forces a restart through the supervisor. Repeated
/// restarts eventually hit the retry ceiling, which parks the channel as
/// failed instead of reconnecting forever.
pub struct HealthMonitor {
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<dyn ChannelStore>,
    events: Arc<dyn EventSink>,
    config: HealthConfig,
    errors: DashMap<ChannelId, VecDeque<Instant>>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<dyn ChannelStore>,
        events: Arc<dyn EventSink>,
        config: HealthConfig,
    ) -> Self {
        Self {
            supervisor,
            store,
            events,
            config,
            errors: DashMap::new(),
        }
    }

    /// Run sweeps on the configured interval until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.run_sweep().await {
                Ok(snapshots) => {
                    tracing::debug!(session_count = snapshots.len(), "health sweep finished")
                }
                Err(error) => tracing::warn!(%error, "health sweep failed"),
            }
            self.run_pressure_sweep().await;
        }
    }

    /// Reclaim sessions that never reached (or fell out of) the connected
    /// state and have sat idle past the grace period. Mid-reconnect
    /// sessions are younger than the grace and survive.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run_pressure_sweep(&self) -> usize {
        let registry = self.supervisor.registry();
        let mut reclaimed = 0;
        for channel_id in registry.channel_ids() {
            let Some(handle) = registry.get(&channel_id) else {
                continue;
            };
            if handle.is_ready() {
                continue;
            }
            if handle.uptime_seconds() < self.config.stale_grace.as_secs() as i64 {
                continue;
            }
            if let Some(handle) = registry.remove(&channel_id, "stale non-connected session") {
                if let Err(error) = handle.session().close().await {
                    tracing::debug!(%channel_id, %error, "closing stale session failed");
                }
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::info!(reclaimed, "pressure sweep reclaimed stale sessions");
        }
        reclaimed
    }

    /// One full sweep. Returns a snapshot per registered session and
    /// publishes the set as a metrics event.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run_sweep(&self) -> Result<Vec<HealthSnapshot>> {
        let registry = self.supervisor.registry();
        let mut snapshots = Vec::new();

        for channel_id in registry.channel_ids() {
            let Some(handle) = registry.get(&channel_id) else {
                continue;
            };
            let state = self.check_session(&channel_id, &handle).await;
            snapshots.push(HealthSnapshot {
                channel_id: channel_id.clone(),
                state,
                error_count: self.error_count(&channel_id),
                uptime_seconds: handle.uptime_seconds(),
                seconds_since_heartbeat: (Utc::now() - handle.last_heartbeat())
                    .num_seconds()
                    .max(0),
                last_error: handle.last_error(),
            });
        }

        publish_or_log(
            self.events.as_ref(),
            topics::SESSION_METRICS,
            serde_json::json!({
                "registered": snapshots.len(),
                "sessions": snapshots,
            }),
        )
        .await;
        Ok(snapshots)
    }

    async fn check_session(&self, channel_id: &ChannelId, handle: &Arc<SessionHandle>) -> HealthState {
        if !handle.is_ready() {
            return HealthState::Initializing;
        }

        let quiet_for = Utc::now() - handle.last_heartbeat();
        if quiet_for.to_std().unwrap_or(Duration::ZERO) < self.config.heartbeat_grace {
            self.errors.remove(channel_id);
            return HealthState::Healthy;
        }

        match handle.session().probe().await {
            Ok(()) => {
                handle.touch_heartbeat();
                self.errors.remove(channel_id);
                HealthState::Healthy
            }
            Err(error) => {
                let detail = error.to_string();
                handle.record_error(detail.clone());
                let errors = self.record_error(channel_id);
                tracing::warn!(%channel_id, error = %detail, errors, "session probe failed");
                if errors < self.config.error_threshold {
                    return HealthState::Degraded;
                }
                self.errors.remove(channel_id);
                self.force_restart(channel_id, &detail).await
            }
        }
    }

    /// Record a probe failure and return how many fall inside the rolling
    /// window.
    fn record_error(&self, channel_id: &ChannelId) -> u32 {
        let mut entry = self.errors.entry(channel_id.clone()).or_default();
        entry.push_back(Instant::now());
        while let Some(oldest) = entry.front() {
            if oldest.elapsed() >= self.config.error_window {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.len() as u32
    }

    fn error_count(&self, channel_id: &ChannelId) -> u32 {
        self.errors
            .get(channel_id)
            .map(|entry| entry.len() as u32)
            .unwrap_or(0)
    }

    /// Tear an unresponsive session down. Below the retry ceiling the
    /// channel goes back to the supervisor for a fresh start; at the
    /// ceiling it is parked as failed.
    async fn force_restart(&self, channel_id: &ChannelId, detail: &str) -> HealthState {
        let retries = match self.store.load_channel(channel_id).await {
            Ok(Some(record)) => record.retries,
            Ok(None) => {
                tracing::warn!(%channel_id, "unresponsive session has no channel record");
                self.supervisor.registry().remove(channel_id, "record missing");
                return HealthState::Unresponsive;
            }
            Err(error) => {
                tracing::error!(%channel_id, %error, "loading channel during health sweep failed");
                return HealthState::Unresponsive;
            }
        };

        if retries >= self.config.max_retries {
            let detail = format!("unresponsive after {retries} reconnect attempts: {detail}");
            if let Err(error) = self.supervisor.mark_failed(channel_id, &detail).await {
                tracing::error!(%channel_id, %error, "parking failed channel failed");
            }
            return HealthState::Failed;
        }

        if let Some(handle) = self
            .supervisor
            .registry()
            .remove(channel_id, "failed health probes")
        {
            if let Err(error) = handle.session().close().await {
                tracing::debug!(%channel_id, %error, "closing unresponsive session failed");
            }
        }
        // The retry counter moves in exactly one place: the supervisor's
        // start-failure path. A restart that succeeds resets it to zero.
        if let Err(error) = self
            .store
            .save_channel(
                channel_id,
                ChannelPatch::new().with_status(ChannelStatus::Disconnected),
            )
            .await
        {
            tracing::error!(%channel_id, %error, "persisting unresponsive teardown failed");
        }

        match self.supervisor.start_session(channel_id).await {
            Ok(outcome) => {
                tracing::info!(%channel_id, ?outcome, "unresponsive session restarted")
            }
            Err(error) => {
                tracing::warn!(%channel_id, %error, "restart after failed probes failed")
            }
        }
        HealthState::Unresponsive
    }
}
