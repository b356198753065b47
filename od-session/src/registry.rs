use chrono::{DateTime, Utc};
use dashmap::DashMap;
use od_channels::{BackendSession, ChannelId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The in-process face of one live channel connection. Created when a
/// connection attempt begins; destroyed when the channel disconnects or the
/// process exits. Never persisted.
pub struct SessionHandle {
    channel_id: ChannelId,
    session: Arc<dyn BackendSession>,
    created_at: DateTime<Utc>,
    initializing: AtomicBool,
    last_heartbeat: Mutex<DateTime<Utc>>,
    last_error: Mutex<Option<String>>,
    pump_cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(channel_id: ChannelId, session: Arc<dyn BackendSession>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            channel_id,
            session,
            created_at: now,
            initializing: AtomicBool::new(true),
            last_heartbeat: Mutex::new(now),
            last_error: Mutex::new(None),
            pump_cancel: CancellationToken::new(),
        })
    }

    /// Token for this handle's background event pump. Cancelled the moment
    /// the handle leaves the registry, so a torn-down session's pump cannot
    /// outlive it.
    pub fn pump_token(&self) -> CancellationToken {
        self.pump_cancel.clone()
    }

    pub fn cancel_pump(&self) {
        self.pump_cancel.cancel();
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn session(&self) -> Arc<dyn BackendSession> {
        self.session.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn mark_ready(&self) {
        self.initializing.store(false, Ordering::SeqCst);
    }

    /// Ready means initialization finished and the underlying connection is
    /// still authenticated.
    pub fn is_ready(&self) -> bool {
        !self.initializing.load(Ordering::SeqCst) && self.session.is_authenticated()
    }

    pub fn touch_heartbeat(&self) {
        if let Ok(mut heartbeat) = self.last_heartbeat.lock() {
            *heartbeat = Utc::now();
        }
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.last_heartbeat
            .lock()
            .map(|heartbeat| *heartbeat)
            .unwrap_or(self.created_at)
    }

    pub fn record_error(&self, detail: impl Into<String>) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(detail.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().map(|e| e.clone()).unwrap_or(None)
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }
}

/// Process-local map from channel id to its live session handle. The single
/// source of truth for "is this channel connected in this process".
///
/// The registry does not close connections: a `put` that replaces a handle
/// expects the caller to have torn the old one down, and slot ownership is
/// arbitrated by the operation lock manager, not here.
#[derive(Default)]
pub struct SessionRegistry {
    handles: DashMap<ChannelId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handle, returning the one it displaced, if any. The
    /// displaced handle's pump is cancelled; it no longer speaks for the
    /// channel.
    pub fn put(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let channel_id = handle.channel_id().clone();
        let previous = self.handles.insert(channel_id.clone(), handle);
        if let Some(previous) = &previous {
            previous.cancel_pump();
            tracing::warn!(%channel_id, "session registry replaced an existing handle");
        }
        previous
    }

    pub fn get(&self, channel_id: &ChannelId) -> Option<Arc<SessionHandle>> {
        self.handles.get(channel_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, channel_id: &ChannelId, reason: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.handles.remove(channel_id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            handle.cancel_pump();
            tracing::info!(%channel_id, reason, "session removed from registry");
        }
        removed
    }

    /// Remove only if `expected` is still the registered handle. A
    /// session's own teardown uses this to stand down when the slot has
    /// already been reclaimed or handed to a newer session.
    pub fn remove_if(
        &self,
        channel_id: &ChannelId,
        expected: &Arc<SessionHandle>,
        reason: &str,
    ) -> bool {
        let removed = self
            .handles
            .remove_if(channel_id, |_, current| Arc::ptr_eq(current, expected))
            .is_some();
        if removed {
            expected.cancel_pump();
            tracing::info!(%channel_id, reason, "session removed from registry");
        }
        removed
    }

    pub fn contains_ready(&self, channel_id: &ChannelId) -> bool {
        self.get(channel_id).is_some_and(|handle| handle.is_ready())
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.handles.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
