use crate::error::{Result, SessionError};
use crate::events::{EventSink, publish_or_log, topics};
use crate::locks::{OperationKind, OperationLockManager};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::status::{ChannelPatch, ChannelRecord, ChannelStatus};
use crate::store::ChannelStore;
use futures_util::StreamExt;
use od_channels::{BackendEvent, ChannelBackend, ChannelId, ChannelKind, DisconnectReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECONNECT_BASE_MS: u64 = 30_000;
const RECONNECT_CEILING_MS: u64 = 300_000;
const BACKEND_EVENT_BUFFER: usize = 64;

/// Reconnect delay after `retries` consecutive failures: 30s doubling up to
/// a 5-minute ceiling.
pub fn reconnect_delay(retries: u32) -> Duration {
    let multiplier = 1_u64 << retries.min(10);
    Duration::from_millis((RECONNECT_BASE_MS * multiplier).min(RECONNECT_CEILING_MS))
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Concurrent connection attempts during bulk bring-up.
    pub bulk_concurrency: usize,
    /// Backoff base/ceiling; overridable so tests can compress time.
    pub reconnect_base_ms: u64,
    pub reconnect_ceiling_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(300),
            bulk_concurrency: 4,
            reconnect_base_ms: RECONNECT_BASE_MS,
            reconnect_ceiling_ms: RECONNECT_CEILING_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyConnected,
    AlreadyInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Completed,
    AlreadyInProgress,
}

/// Owns the connection state machine for every channel. All control
/// operations are serialized per (operation, channel) through the lock
/// manager; channels fail independently.
pub struct ConnectionSupervisor {
    registry: Arc<SessionRegistry>,
    locks: Arc<OperationLockManager>,
    store: Arc<dyn ChannelStore>,
    events: Arc<dyn EventSink>,
    backends: HashMap<ChannelKind, Arc<dyn ChannelBackend>>,
    config: SupervisorConfig,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        locks: Arc<OperationLockManager>,
        store: Arc<dyn ChannelStore>,
        events: Arc<dyn EventSink>,
        backends: HashMap<ChannelKind, Arc<dyn ChannelBackend>>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            locks,
            store,
            events,
            backends,
            config,
            shutdown,
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn locks(&self) -> Arc<OperationLockManager> {
        self.locks.clone()
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    fn delay_for(&self, retries: u32) -> Duration {
        let multiplier = 1_u64 << retries.min(10);
        Duration::from_millis(
            (self.config.reconnect_base_ms * multiplier).min(self.config.reconnect_ceiling_ms),
        )
    }

    /// Begin (or confirm) a connection for `channel_id`. Idempotent: a
    /// healthy session short-circuits, and a concurrent start returns
    /// `AlreadyInProgress` without side effects.
    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %channel_id))]
    pub async fn start_session(self: &Arc<Self>, channel_id: &ChannelId) -> Result<StartOutcome> {
        let Some(_guard) = self.locks.try_acquire(OperationKind::Start, channel_id) else {
            tracing::info!("session start already in progress");
            return Ok(StartOutcome::AlreadyInProgress);
        };
        self.start_locked(channel_id).await
    }

    async fn start_locked(self: &Arc<Self>, channel_id: &ChannelId) -> Result<StartOutcome> {
        if let Some(handle) = self.registry.get(channel_id) {
            if handle.is_ready() {
                tracing::info!("session already connected");
                return Ok(StartOutcome::AlreadyConnected);
            }
            self.registry.remove(channel_id, "stale handle before start");
            if let Err(error) = handle.session().close().await {
                tracing::debug!(%error, "closing stale session failed");
            }
        }

        let record = self
            .store
            .load_channel(channel_id)
            .await?
            .ok_or_else(|| SessionError::ChannelNotFound(channel_id.clone()))?;
        let backend = self
            .backends
            .get(&record.kind)
            .ok_or(SessionError::BackendMissing(record.kind))?
            .clone();

        self.store
            .save_channel(channel_id, ChannelPatch::new().with_status(ChannelStatus::Opening))
            .await?;
        self.publish_status(channel_id, ChannelStatus::Opening, None)
            .await;

        let (tx, rx) = mpsc::channel(BACKEND_EVENT_BUFFER);
        let session = match backend
            .connect(channel_id, record.session_blob.as_deref(), tx)
            .await
        {
            Ok(session) => session,
            Err(error) => {
                let detail = error.to_string();
                self.record_start_failure(&record, ChannelStatus::Disconnected, &detail)
                    .await;
                return Err(SessionError::Backend(detail));
            }
        };

        self.await_open(&record, session, rx).await
    }

    /// Race "opened" vs "closed" vs the connect timeout. Whichever fires
    /// first wins; dropping the receiver and closing the session detaches
    /// the losing listeners.
    async fn await_open(
        self: &Arc<Self>,
        record: &ChannelRecord,
        session: Arc<dyn od_channels::BackendSession>,
        mut rx: mpsc::Receiver<BackendEvent>,
    ) -> Result<StartOutcome> {
        let channel_id = &record.id;
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        let mut awaiting_auth = false;

        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    if let Err(error) = session.close().await {
                        tracing::debug!(%error, "closing timed-out session failed");
                    }
                    // A stalled pairing step is its own observable state.
                    let stalled = if awaiting_auth {
                        ChannelStatus::Timeout
                    } else {
                        ChannelStatus::Disconnected
                    };
                    let detail = format!(
                        "connection attempt exceeded {:?}",
                        self.config.connect_timeout
                    );
                    self.record_start_failure(record, stalled, &detail).await;
                    return Err(SessionError::ConnectTimeout(self.config.connect_timeout));
                }
                Ok(None) => {
                    let reason = DisconnectReason::ConnectionLost;
                    self.record_start_failure(
                        record,
                        ChannelStatus::Disconnected,
                        "backend dropped its event stream",
                    )
                    .await;
                    return Err(SessionError::ClosedWhileOpening(reason));
                }
                Ok(Some(event)) => event,
            };

            match event {
                BackendEvent::Qr { payload } => {
                    awaiting_auth = true;
                    self.store
                        .save_channel(
                            channel_id,
                            ChannelPatch::new()
                                .with_status(ChannelStatus::Qrcode)
                                .with_qr_payload(payload.clone()),
                        )
                        .await?;
                    self.publish_status(channel_id, ChannelStatus::Qrcode, Some(&payload))
                        .await;
                }
                BackendEvent::Pairing { code } => {
                    awaiting_auth = true;
                    self.store
                        .save_channel(
                            channel_id,
                            ChannelPatch::new()
                                .with_status(ChannelStatus::Pairing)
                                .with_qr_payload(code.clone()),
                        )
                        .await?;
                    self.publish_status(channel_id, ChannelStatus::Pairing, Some(&code))
                        .await;
                }
                BackendEvent::Opened => {
                    self.store
                        .save_channel(
                            channel_id,
                            ChannelPatch::new()
                                .with_status(ChannelStatus::Connected)
                                .clear_qr_payload()
                                .with_retries(0),
                        )
                        .await?;
                    let handle = SessionHandle::new(channel_id.clone(), session);
                    handle.mark_ready();
                    if let Some(previous) = self.registry.put(handle.clone()) {
                        if let Err(error) = previous.session().close().await {
                            tracing::debug!(%error, "closing displaced session failed");
                        }
                    }
                    self.spawn_event_pump(handle, rx);
                    self.publish_status(channel_id, ChannelStatus::Connected, None)
                        .await;
                    tracing::info!("session connected");
                    return Ok(StartOutcome::Started);
                }
                BackendEvent::Closed { reason } => {
                    if let Err(error) = session.close().await {
                        tracing::debug!(%error, "closing refused session failed");
                    }
                    let detail = reason.to_string();
                    self.record_start_failure(record, ChannelStatus::Disconnected, &detail)
                        .await;
                    if reason.is_terminal() {
                        self.wipe_credentials(channel_id).await;
                    }
                    return Err(SessionError::ClosedWhileOpening(reason));
                }
                BackendEvent::Activity { .. } => {}
            }
        }
    }

    /// Persist a failed start: stalled status plus an incremented retry
    /// counter. Failures here are logged, not propagated — the start error
    /// itself is what the caller sees.
    async fn record_start_failure(&self, record: &ChannelRecord, status: ChannelStatus, detail: &str) {
        tracing::warn!(channel_id = %record.id, %status, detail, "session start failed");
        let patch = ChannelPatch::new()
            .with_status(status)
            .with_retries(record.retries.saturating_add(1));
        if let Err(error) = self.store.save_channel(&record.id, patch).await {
            tracing::error!(%error, channel_id = %record.id, "persisting start failure failed");
        }
        self.publish_status(&record.id, status, None).await;
    }

    /// Drop persisted credentials after a terminal disconnect; the next
    /// start requires a fresh pairing.
    async fn wipe_credentials(&self, channel_id: &ChannelId) {
        let patch = ChannelPatch::new()
            .clear_session_blob()
            .clear_qr_payload()
            .with_retries(0);
        if let Err(error) = self.store.save_channel(channel_id, patch).await {
            tracing::error!(%error, %channel_id, "clearing session credentials failed");
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, handle: Arc<SessionHandle>, mut rx: mpsc::Receiver<BackendEvent>) {
        let supervisor = self.clone();
        let shutdown = self.shutdown.clone();
        // Every teardown path goes through the registry, which cancels this
        // token; the pump cannot outlive its handle's registration.
        let cancel = handle.pump_token();
        tokio::spawn(async move {
            let channel_id = handle.channel_id().clone();
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => event,
                };
                match event {
                    None => return,
                    Some(BackendEvent::Activity { .. }) => handle.touch_heartbeat(),
                    Some(BackendEvent::Closed { reason }) => {
                        handle.record_error(reason.to_string());
                        supervisor.handle_close(&handle, reason).await;
                        return;
                    }
                    Some(BackendEvent::Qr { payload }) => {
                        // The backend is demanding re-authentication mid-session.
                        tracing::warn!(%channel_id, "live session requested a new pairing");
                        if let Err(error) = supervisor
                            .store
                            .save_channel(
                                &channel_id,
                                ChannelPatch::new()
                                    .with_status(ChannelStatus::Qrcode)
                                    .with_qr_payload(payload.clone()),
                            )
                            .await
                        {
                            tracing::error!(%error, %channel_id, "persisting re-auth QR failed");
                        }
                        supervisor
                            .publish_status(&channel_id, ChannelStatus::Qrcode, Some(&payload))
                            .await;
                    }
                    Some(BackendEvent::Pairing { .. }) | Some(BackendEvent::Opened) => {}
                }
            }
        });
    }

    /// React to an unsolicited close on a live session. Terminal reasons
    /// wipe credentials and stay down; anything else schedules a reconnect
    /// with exponential backoff. Acts only if the closing session is still
    /// the registered one: a close racing a stop/restart/replacement must
    /// not resurrect a channel an operator took down.
    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %handle.channel_id(), %reason))]
    async fn handle_close(self: &Arc<Self>, handle: &Arc<SessionHandle>, reason: DisconnectReason) {
        let channel_id = handle.channel_id();
        if !self
            .registry
            .remove_if(channel_id, handle, &reason.to_string())
        {
            tracing::debug!("close from a session no longer registered; ignoring");
            return;
        }

        let record = match self.store.load_channel(channel_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!("closed session has no channel record");
                return;
            }
            Err(error) => {
                tracing::error!(%error, "loading channel after close failed");
                return;
            }
        };

        if record.status == ChannelStatus::Failed {
            // Health escalation already parked this channel; leave it be.
            return;
        }

        if reason.is_terminal() {
            tracing::warn!("terminal disconnect; credentials cleared, no reconnect");
            if let Err(error) = self
                .store
                .save_channel(
                    channel_id,
                    ChannelPatch::new()
                        .with_status(ChannelStatus::Disconnected)
                        .clear_session_blob()
                        .clear_qr_payload()
                        .with_retries(0),
                )
                .await
            {
                tracing::error!(%error, "persisting terminal disconnect failed");
            }
            self.publish_status(channel_id, ChannelStatus::Disconnected, None)
                .await;
            return;
        }

        let retries = record.retries.saturating_add(1);
        if let Err(error) = self
            .store
            .save_channel(
                channel_id,
                ChannelPatch::new()
                    .with_status(ChannelStatus::Disconnected)
                    .with_retries(retries),
            )
            .await
        {
            tracing::error!(%error, "persisting disconnect failed");
        }
        self.publish_status(channel_id, ChannelStatus::Disconnected, None)
            .await;

        let delay = self.delay_for(record.retries);
        tracing::info!(retries, ?delay, "scheduling reconnect");
        self.schedule_reconnect(channel_id.clone(), delay);
    }

    fn schedule_reconnect(self: &Arc<Self>, channel_id: ChannelId, delay: Duration) {
        let supervisor = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match supervisor.store.load_channel(&channel_id).await {
                Ok(Some(record)) if record.is_active && record.status != ChannelStatus::Failed => {}
                _ => return,
            }
            match supervisor.start_session(&channel_id).await {
                Ok(outcome) => {
                    tracing::info!(%channel_id, ?outcome, "scheduled reconnect finished")
                }
                Err(error) => {
                    tracing::warn!(%channel_id, %error, "scheduled reconnect failed")
                }
            }
        });
    }

    /// Tear down a channel's session and persist it as disconnected.
    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %channel_id))]
    pub async fn stop_session(&self, channel_id: &ChannelId) -> Result<ControlOutcome> {
        let Some(_guard) = self.locks.try_acquire(OperationKind::Remove, channel_id) else {
            return Ok(ControlOutcome::AlreadyInProgress);
        };

        if let Some(handle) = self.registry.remove(channel_id, "stop requested") {
            if let Err(error) = handle.session().close().await {
                tracing::debug!(%error, "closing stopped session failed");
            }
        }
        if self.store.load_channel(channel_id).await?.is_some() {
            self.store
                .save_channel(
                    channel_id,
                    ChannelPatch::new().with_status(ChannelStatus::Disconnected),
                )
                .await?;
            self.publish_status(channel_id, ChannelStatus::Disconnected, None)
                .await;
        }
        Ok(ControlOutcome::Completed)
    }

    /// Stop-then-start under the update lock.
    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %channel_id))]
    pub async fn restart_session(self: &Arc<Self>, channel_id: &ChannelId) -> Result<StartOutcome> {
        let Some(_guard) = self.locks.try_acquire(OperationKind::Update, channel_id) else {
            return Ok(StartOutcome::AlreadyInProgress);
        };

        if let Some(handle) = self.registry.remove(channel_id, "restart requested") {
            if let Err(error) = handle.session().close().await {
                tracing::debug!(%error, "closing session for restart failed");
            }
        }
        self.start_session(channel_id).await
    }

    /// Drop the stored session blob and QR payload so the next start pairs
    /// from scratch. Refused while a live session exists.
    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %channel_id))]
    pub async fn clear_session_cache(&self, channel_id: &ChannelId) -> Result<ControlOutcome> {
        let Some(_guard) = self.locks.try_acquire(OperationKind::ClearCache, channel_id) else {
            return Ok(ControlOutcome::AlreadyInProgress);
        };

        if self.registry.contains_ready(channel_id) {
            return Err(SessionError::ChannelBusy(channel_id.clone()));
        }
        self.store
            .load_channel(channel_id)
            .await?
            .ok_or_else(|| SessionError::ChannelNotFound(channel_id.clone()))?;
        self.store
            .save_channel(
                channel_id,
                ChannelPatch::new()
                    .with_status(ChannelStatus::Disconnected)
                    .clear_session_blob()
                    .clear_qr_payload()
                    .with_retries(0),
            )
            .await?;
        self.publish_status(channel_id, ChannelStatus::Disconnected, None)
            .await;
        Ok(ControlOutcome::Completed)
    }

    /// Park a channel in the terminal failed state. Called by the health
    /// monitor once the reconnect ceiling is exceeded; only a manual start
    /// or cache clear brings it back.
    #[tracing::instrument(level = "warn", skip_all, fields(channel_id = %channel_id))]
    pub async fn mark_failed(&self, channel_id: &ChannelId, detail: &str) -> Result<()> {
        if let Some(handle) = self.registry.remove(channel_id, "marked failed") {
            if let Err(error) = handle.session().close().await {
                tracing::debug!(%error, "closing failed session failed");
            }
        }
        self.store
            .save_channel(
                channel_id,
                ChannelPatch::new().with_status(ChannelStatus::Failed),
            )
            .await?;
        self.publish_status(channel_id, ChannelStatus::Failed, None)
            .await;
        publish_or_log(
            self.events.as_ref(),
            topics::CHANNEL_ALERT,
            serde_json::json!({
                "channel_id": channel_id,
                "detail": detail,
            }),
        )
        .await;
        Ok(())
    }

    /// Bring up every active, non-failed channel in bounded batches.
    /// Individual failures are logged; one channel never blocks the rest.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn start_active_sessions(self: &Arc<Self>) -> Result<usize> {
        let channels = self.store.list_active_channels().await?;
        let candidates: Vec<ChannelId> = channels
            .into_iter()
            .filter(|record| record.status != ChannelStatus::Failed)
            .map(|record| record.id)
            .collect();
        tracing::info!(channel_count = candidates.len(), "bulk session bring-up");

        let started = futures_util::stream::iter(candidates)
            .map(|channel_id| {
                let supervisor = self.clone();
                async move {
                    match supervisor.start_session(&channel_id).await {
                        Ok(StartOutcome::Started) => 1_usize,
                        Ok(outcome) => {
                            tracing::info!(%channel_id, ?outcome, "bulk start skipped");
                            0
                        }
                        Err(error) => {
                            tracing::warn!(%channel_id, %error, "bulk start failed");
                            0
                        }
                    }
                }
            })
            .buffer_unordered(self.config.bulk_concurrency.max(1))
            .fold(0_usize, |acc, started| async move { acc + started })
            .await;
        Ok(started)
    }

    /// Close every registered session; used on graceful shutdown.
    pub async fn shutdown_sessions(&self) {
        for channel_id in self.registry.channel_ids() {
            if let Some(handle) = self.registry.remove(&channel_id, "process shutdown") {
                if let Err(error) = handle.session().close().await {
                    tracing::debug!(%error, %channel_id, "closing session during shutdown failed");
                }
            }
            if let Err(error) = self
                .store
                .save_channel(
                    &channel_id,
                    ChannelPatch::new().with_status(ChannelStatus::Disconnected),
                )
                .await
            {
                tracing::warn!(%error, %channel_id, "persisting shutdown status failed");
            }
        }
    }

    async fn publish_status(&self, channel_id: &ChannelId, status: ChannelStatus, qr: Option<&str>) {
        publish_or_log(
            self.events.as_ref(),
            topics::CHANNEL_STATUS,
            serde_json::json!({
                "channel_id": channel_id,
                "status": status,
                "qr_payload": qr,
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConnectionSupervisor, ControlOutcome, StartOutcome, SupervisorConfig, reconnect_delay,
    };
    use crate::events::{MemoryEventSink, topics};
    use crate::locks::OperationLockManager;
    use crate::registry::SessionRegistry;
    use crate::status::{ChannelPatch, ChannelRecord, ChannelStatus};
    use crate::store::{ChannelStore, SqliteStore};
    use od_channels::{
        ChannelBackend, ChannelId, ChannelKind, ConnectScript, DisconnectReason, LoopbackBackend,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        supervisor: Arc<ConnectionSupervisor>,
        registry: Arc<SessionRegistry>,
        store: Arc<SqliteStore>,
        events: Arc<MemoryEventSink>,
        backend: Arc<LoopbackBackend>,
    }

    async fn fixture(script: ConnectScript, config: SupervisorConfig) -> Fixture {
        let path = std::env::temp_dir()
            .join(format!("opendesk-supervisor-{}", uuid::Uuid::new_v4()))
            .join("desk.db");
        let store = Arc::new(SqliteStore::open(path).await.expect("open store"));
        let registry = SessionRegistry::new();
        let locks = OperationLockManager::new();
        let events = Arc::new(MemoryEventSink::new());
        let backend =
            Arc::new(LoopbackBackend::new(ChannelKind::Whatsapp).with_default_script(script));
        let mut backends: HashMap<ChannelKind, Arc<dyn ChannelBackend>> = HashMap::new();
        backends.insert(ChannelKind::Whatsapp, backend.clone());

        let supervisor = ConnectionSupervisor::new(
            registry.clone(),
            locks,
            store.clone(),
            events.clone(),
            backends,
            config,
            CancellationToken::new(),
        );
        Fixture {
            supervisor,
            registry,
            store,
            events,
            backend,
        }
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_millis(250),
            bulk_concurrency: 2,
            reconnect_base_ms: 10,
            reconnect_ceiling_ms: 100,
        }
    }

    async fn seed_channel(store: &SqliteStore, id: &str) {
        store
            .upsert_channel(&ChannelRecord {
                id: id.into(),
                tenant_id: "tenant-1".into(),
                kind: ChannelKind::Whatsapp,
                status: ChannelStatus::Disconnected,
                qr_payload: None,
                session_blob: Some("stored-creds".to_string()),
                retries: 0,
                is_active: true,
            })
            .await
            .expect("seed channel");
    }

    #[test]
    fn backoff_formula_doubles_to_five_minute_ceiling() {
        for retries in 0..=10_u32 {
            let expected = (30_000_u64 * (1 << retries)).min(300_000);
            assert_eq!(
                reconnect_delay(retries).as_millis() as u64,
                expected,
                "retries = {retries}"
            );
        }
        assert_eq!(reconnect_delay(32).as_millis(), 300_000);
    }

    #[tokio::test]
    async fn start_connects_registers_and_persists() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        let outcome = fx.supervisor.start_session(&channel).await.expect("start");
        assert_eq!(outcome, StartOutcome::Started);
        assert!(fx.registry.contains_ready(&channel));

        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Connected);
        assert_eq!(record.retries, 0);

        let statuses = fx.events.events_for(topics::CHANNEL_STATUS);
        assert!(statuses.iter().any(|e| e["status"] == "connected"));
    }

    #[tokio::test]
    async fn start_is_idempotent_for_a_connected_channel() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        assert_eq!(
            fx.supervisor.start_session(&channel).await.expect("start"),
            StartOutcome::Started
        );
        assert_eq!(
            fx.supervisor.start_session(&channel).await.expect("restart"),
            StartOutcome::AlreadyConnected
        );
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_have_exactly_one_winner() {
        let fx = fixture(
            ConnectScript::OpenAfter(Duration::from_millis(100)),
            test_config(),
        )
        .await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let supervisor = fx.supervisor.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(
                async move { supervisor.start_session(&channel).await },
            ));
        }

        let mut started = 0;
        let mut in_progress = 0;
        for task in tasks {
            match task.await.expect("join").expect("start") {
                StartOutcome::Started => started += 1,
                StartOutcome::AlreadyInProgress => in_progress += 1,
                StartOutcome::AlreadyConnected => {}
            }
        }
        assert_eq!(started, 1, "exactly one start performs the connection");
        assert_eq!(in_progress, 4);
    }

    #[tokio::test]
    async fn qr_is_persisted_and_cleared_once_connected() {
        let fx = fixture(
            ConnectScript::QrThenOpen {
                qr: "scan-me".to_string(),
                open_after: Duration::from_millis(20),
            },
            test_config(),
        )
        .await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        fx.supervisor.start_session(&channel).await.expect("start");

        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Connected);
        assert_eq!(record.qr_payload, None, "QR is cleared after auth");

        let statuses = fx.events.events_for(topics::CHANNEL_STATUS);
        let qr_event = statuses
            .iter()
            .find(|e| e["status"] == "qrcode")
            .expect("qrcode status was published");
        assert_eq!(qr_event["qr_payload"], "scan-me");
    }

    #[tokio::test]
    async fn stalled_pairing_times_out_into_timeout_status() {
        let fx = fixture(
            ConnectScript::QrOnly {
                qr: "never-scanned".to_string(),
            },
            test_config(),
        )
        .await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        let result = fx.supervisor.start_session(&channel).await;
        assert!(result.is_err(), "stalled pairing must fail the start");

        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Timeout);
        assert_eq!(record.retries, 1);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn silent_stall_times_out_into_disconnected() {
        let fx = fixture(ConnectScript::Stall, test_config()).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        assert!(fx.supervisor.start_session(&channel).await.is_err());
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Disconnected);
        assert_eq!(record.retries, 1);
    }

    #[tokio::test]
    async fn close_during_open_fails_the_start() {
        let fx = fixture(
            ConnectScript::Close {
                reason: DisconnectReason::ServerError("handshake refused".to_string()),
            },
            test_config(),
        )
        .await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        assert!(fx.supervisor.start_session(&channel).await.is_err());
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Disconnected);
        assert_eq!(
            record.session_blob.as_deref(),
            Some("stored-creds"),
            "non-terminal close keeps stored credentials"
        );
    }

    #[tokio::test]
    async fn terminal_close_wipes_credentials_and_stays_down() {
        let mut config = test_config();
        // Make any accidental reconnect visible within the test window.
        config.reconnect_base_ms = 1;
        let fx = fixture(ConnectScript::Open, config).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        fx.supervisor.start_session(&channel).await.expect("start");
        let session = fx.backend.session(&channel).expect("loopback session");
        session.emit_close(DisconnectReason::LoggedOut).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Disconnected);
        assert_eq!(record.session_blob, None, "session blob cleared on logout");
        assert_eq!(record.qr_payload, None);
        assert!(
            fx.registry.is_empty(),
            "no reconnect after a terminal close"
        );
    }

    #[tokio::test]
    async fn transient_close_reconnects_with_backoff() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        fx.supervisor.start_session(&channel).await.expect("start");
        let session = fx.backend.session(&channel).expect("loopback session");
        session.emit_close(DisconnectReason::ConnectionLost).await;

        // Backoff base is 10ms in the test config; the reconnect should
        // land well within this window.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            fx.registry.contains_ready(&channel),
            "transient close must reconnect automatically"
        );
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Connected);
    }

    #[tokio::test]
    async fn stopped_channel_ignores_a_late_close() {
        let mut config = test_config();
        // Make any accidental reconnect visible within the test window.
        config.reconnect_base_ms = 1;
        let fx = fixture(ConnectScript::Open, config).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        fx.supervisor.start_session(&channel).await.expect("start");
        let session = fx.backend.session(&channel).expect("loopback session");
        fx.supervisor.stop_session(&channel).await.expect("stop");

        // The old session reports its disconnect only after the stop.
        session.emit_close(DisconnectReason::ConnectionLost).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(fx.registry.is_empty(), "a stopped channel stays down");
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Disconnected);
        assert_eq!(record.retries, 0, "no reconnect was scheduled");
    }

    #[tokio::test]
    async fn failed_channel_is_not_reconnected() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        fx.supervisor.start_session(&channel).await.expect("start");
        fx.store
            .save_channel(&channel, ChannelPatch::new().with_status(ChannelStatus::Failed))
            .await
            .expect("mark failed");

        let session = fx.backend.session(&channel).expect("loopback session");
        session.emit_close(DisconnectReason::ConnectionLost).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(fx.registry.is_empty());
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(
            record.status,
            ChannelStatus::Failed,
            "terminal failed state survives a late close"
        );
    }

    #[tokio::test]
    async fn stop_then_clear_cache_wipes_credentials() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        let channel = ChannelId::from("ch-1");
        seed_channel(&fx.store, "ch-1").await;

        fx.supervisor.start_session(&channel).await.expect("start");
        assert!(matches!(
            fx.supervisor.clear_session_cache(&channel).await,
            Err(crate::error::SessionError::ChannelBusy(_))
        ));

        assert_eq!(
            fx.supervisor.stop_session(&channel).await.expect("stop"),
            ControlOutcome::Completed
        );
        assert!(fx.registry.is_empty());

        assert_eq!(
            fx.supervisor
                .clear_session_cache(&channel)
                .await
                .expect("clear cache"),
            ControlOutcome::Completed
        );
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.session_blob, None);
        assert_eq!(record.qr_payload, None);
        assert_eq!(record.retries, 0);
    }

    #[tokio::test]
    async fn bulk_bring_up_skips_failed_channels() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        seed_channel(&fx.store, "ch-1").await;
        seed_channel(&fx.store, "ch-2").await;
        seed_channel(&fx.store, "ch-3").await;
        fx.store
            .save_channel(
                &"ch-3".into(),
                ChannelPatch::new().with_status(ChannelStatus::Failed),
            )
            .await
            .expect("mark failed");

        let started = fx
            .supervisor
            .start_active_sessions()
            .await
            .expect("bulk start");
        assert_eq!(started, 2);
        assert!(fx.registry.contains_ready(&"ch-1".into()));
        assert!(fx.registry.contains_ready(&"ch-2".into()));
        assert!(fx.registry.get(&"ch-3".into()).is_none());
    }

    #[tokio::test]
    async fn start_unknown_channel_is_not_found() {
        let fx = fixture(ConnectScript::Open, test_config()).await;
        let result = fx.supervisor.start_session(&"ghost".into()).await;
        assert!(matches!(
            result,
            Err(crate::error::SessionError::ChannelNotFound(_))
        ));
    }
}
