use crate::error::Result;
use crate::locks::OperationKind;
use crate::status::{ChannelPatch, ChannelStatus};
use crate::store::ChannelStore;
use crate::supervisor::ConnectionSupervisor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub examined: usize,
    pub marked_connected: usize,
    pub marked_disconnected: usize,
    pub restarts_triggered: usize,
    pub orphans_closed: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.marked_connected == 0 && self.marked_disconnected == 0 && self.orphans_closed == 0
    }
}

/// Reconciles persisted channel status with registry truth.
///
/// Crashes, kills, and missed writes can leave the store claiming a
/// connection that no longer exists (or the reverse). Each pass repairs
/// every such row, so the two views converge within one interval. The
/// registry is authoritative for liveness; the store is authoritative for
/// which channels should exist at all.
pub struct StateSynchronizer {
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<dyn ChannelStore>,
    config: SyncConfig,
}

impl StateSynchronizer {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<dyn ChannelStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            supervisor,
            store,
            config,
        }
    }

    /// Run reconciliation passes on the configured interval until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.run_once().await {
                Ok(report) if report.is_clean() => {
                    tracing::debug!(examined = report.examined, "state sync clean")
                }
                Ok(report) => tracing::info!(?report, "state sync repaired drift"),
                Err(error) => tracing::warn!(%error, "state sync failed"),
            }
        }
    }

    /// One reconciliation pass.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run_once(&self) -> Result<SyncReport> {
        let registry = self.supervisor.registry();
        let locks = self.supervisor.locks();
        let mut report = SyncReport::default();

        let channels = self.store.list_active_channels().await?;
        let mut known: HashSet<_> = HashSet::new();

        for record in channels {
            report.examined += 1;
            known.insert(record.id.clone());

            // A start in flight will settle the status itself; touching the
            // row now would race it.
            if locks.is_held(OperationKind::Start, &record.id) {
                continue;
            }
            if record.status == ChannelStatus::Failed {
                continue;
            }

            let live = registry.contains_ready(&record.id);
            match (live, record.status) {
                (true, ChannelStatus::Connected) => {}
                (true, status) => {
                    tracing::info!(
                        channel_id = %record.id,
                        persisted = %status,
                        "store lagged a live session; marking connected"
                    );
                    self.store
                        .save_channel(
                            &record.id,
                            ChannelPatch::new()
                                .with_status(ChannelStatus::Connected)
                                .clear_qr_payload(),
                        )
                        .await?;
                    report.marked_connected += 1;
                }
                (false, ChannelStatus::Disconnected) => {}
                (false, status) => {
                    tracing::info!(
                        channel_id = %record.id,
                        persisted = %status,
                        "store claimed a session that is not live; marking disconnected"
                    );
                    self.store
                        .save_channel(
                            &record.id,
                            ChannelPatch::new().with_status(ChannelStatus::Disconnected),
                        )
                        .await?;
                    report.marked_disconnected += 1;

                    // A stale `connected` row usually means a crash or kill
                    // dropped the session; bring it back.
                    if status == ChannelStatus::Connected {
                        match self.supervisor.start_session(&record.id).await {
                            Ok(outcome) => {
                                tracing::info!(
                                    channel_id = %record.id,
                                    ?outcome,
                                    "restart after stale connected row"
                                );
                                report.restarts_triggered += 1;
                            }
                            Err(error) => {
                                tracing::warn!(
                                    channel_id = %record.id,
                                    %error,
                                    "restart after stale connected row failed"
                                );
                            }
                        }
                    }
                }
            }
        }

        // Handles whose channel was deactivated or deleted out from under
        // them have nothing to reconcile against; close them.
        for channel_id in registry.channel_ids() {
            if known.contains(&channel_id) {
                continue;
            }
            if let Some(handle) = registry.remove(&channel_id, "channel no longer active") {
                if let Err(error) = handle.session().close().await {
                    tracing::debug!(%channel_id, %error, "closing orphaned session failed");
                }
                report.orphans_closed += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{StateSynchronizer, SyncConfig};
    use crate::events::MemoryEventSink;
    use crate::locks::{OperationKind, OperationLockManager};
    use crate::registry::SessionRegistry;
    use crate::status::{ChannelPatch, ChannelRecord, ChannelStatus};
    use crate::store::{ChannelStore, SqliteStore};
    use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};
    use od_channels::{ChannelBackend, ChannelId, ChannelKind, LoopbackBackend};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        sync: StateSynchronizer,
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<SqliteStore>,
        locks: Arc<OperationLockManager>,
    }

    async fn fixture() -> Fixture {
        let path = std::env::temp_dir()
            .join(format!("opendesk-sync-{}", uuid::Uuid::new_v4()))
            .join("desk.db");
        let store = Arc::new(SqliteStore::open(path).await.expect("open store"));
        let locks = OperationLockManager::new();
        let backend: Arc<LoopbackBackend> = Arc::new(LoopbackBackend::new(ChannelKind::Whatsapp));
        let mut backends: HashMap<ChannelKind, Arc<dyn ChannelBackend>> = HashMap::new();
        backends.insert(ChannelKind::Whatsapp, backend);

        let supervisor = ConnectionSupervisor::new(
            SessionRegistry::new(),
            locks.clone(),
            store.clone(),
            Arc::new(MemoryEventSink::new()),
            backends,
            SupervisorConfig {
                connect_timeout: Duration::from_millis(250),
                reconnect_base_ms: 10,
                reconnect_ceiling_ms: 100,
                ..SupervisorConfig::default()
            },
            CancellationToken::new(),
        );
        let sync = StateSynchronizer::new(supervisor.clone(), store.clone(), SyncConfig::default());
        Fixture {
            sync,
            supervisor,
            store,
            locks,
        }
    }

    async fn seed(store: &SqliteStore, id: &str, status: ChannelStatus, active: bool) {
        store
            .upsert_channel(&ChannelRecord {
                id: id.into(),
                tenant_id: "tenant-1".into(),
                kind: ChannelKind::Whatsapp,
                status,
                qr_payload: None,
                session_blob: None,
                retries: 0,
                is_active: active,
            })
            .await
            .expect("seed channel");
    }

    #[tokio::test]
    async fn aligned_state_produces_a_clean_report() {
        let fx = fixture().await;
        seed(&fx.store, "ch-live", ChannelStatus::Disconnected, true).await;
        fx.supervisor
            .start_session(&"ch-live".into())
            .await
            .expect("start");
        seed(&fx.store, "ch-down", ChannelStatus::Disconnected, true).await;

        let report = fx.sync.run_once().await.expect("sync");
        assert_eq!(report.examined, 2);
        assert!(report.is_clean(), "aligned state must not be touched");
    }

    #[tokio::test]
    async fn stale_connected_row_is_repaired_and_restarted() {
        let fx = fixture().await;
        seed(&fx.store, "ch-1", ChannelStatus::Connected, true).await;

        let report = fx.sync.run_once().await.expect("sync");
        assert_eq!(report.marked_disconnected, 1);
        assert_eq!(report.restarts_triggered, 1);

        // The loopback backend reconnects immediately, so by the end of the
        // pass the channel is live again.
        assert!(fx.supervisor.registry().contains_ready(&"ch-1".into()));
        let record = fx
            .store
            .load_channel(&"ch-1".into())
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Connected);
    }

    #[tokio::test]
    async fn stale_opening_row_is_repaired_without_restart() {
        let fx = fixture().await;
        seed(&fx.store, "ch-1", ChannelStatus::Opening, true).await;

        let report = fx.sync.run_once().await.expect("sync");
        assert_eq!(report.marked_disconnected, 1);
        assert_eq!(report.restarts_triggered, 0);
        let record = fx
            .store
            .load_channel(&"ch-1".into())
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn store_lagging_a_live_session_is_marked_connected() {
        let fx = fixture().await;
        seed(&fx.store, "ch-1", ChannelStatus::Disconnected, true).await;
        fx.supervisor
            .start_session(&"ch-1".into())
            .await
            .expect("start");
        // Simulate a missed write after the connection opened.
        fx.store
            .save_channel(
                &"ch-1".into(),
                ChannelPatch::new().with_status(ChannelStatus::Opening),
            )
            .await
            .expect("force drift");

        let report = fx.sync.run_once().await.expect("sync");
        assert_eq!(report.marked_connected, 1);
        let record = fx
            .store
            .load_channel(&"ch-1".into())
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Connected);
    }

    #[tokio::test]
    async fn channels_with_a_start_in_flight_are_skipped() {
        let fx = fixture().await;
        seed(&fx.store, "ch-1", ChannelStatus::Opening, true).await;
        let channel = ChannelId::from("ch-1");
        let _guard = fx
            .locks
            .try_acquire(OperationKind::Start, &channel)
            .expect("hold start lock");

        let report = fx.sync.run_once().await.expect("sync");
        assert!(report.is_clean(), "in-flight start must not be repaired");
        let record = fx
            .store
            .load_channel(&channel)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Opening);
    }

    #[tokio::test]
    async fn failed_channels_are_left_parked() {
        let fx = fixture().await;
        seed(&fx.store, "ch-1", ChannelStatus::Failed, true).await;

        let report = fx.sync.run_once().await.expect("sync");
        assert!(report.is_clean());
        let record = fx
            .store
            .load_channel(&"ch-1".into())
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(record.status, ChannelStatus::Failed);
    }

    #[tokio::test]
    async fn orphaned_handles_are_closed() {
        let fx = fixture().await;
        seed(&fx.store, "ch-1", ChannelStatus::Disconnected, true).await;
        fx.supervisor
            .start_session(&"ch-1".into())
            .await
            .expect("start");
        // Deactivate the channel behind the registry's back.
        seed(&fx.store, "ch-1", ChannelStatus::Connected, false).await;

        let report = fx.sync.run_once().await.expect("sync");
        assert_eq!(report.orphans_closed, 1);
        assert!(fx.supervisor.registry().is_empty());
    }
}
