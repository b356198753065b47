use crate::backend::{BackendSession, ChannelBackend, SendReceipt};
use crate::types::{BackendEvent, ChannelId, ChannelKind, DisconnectReason, OutboundContent};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How a loopback connection attempt should play out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectScript {
    /// Authenticate and open right away.
    Open,
    /// Open after a delay, with no pairing step.
    OpenAfter(Duration),
    /// Emit a QR payload, then open once the user "scans" it.
    QrThenOpen { qr: String, open_after: Duration },
    /// Emit a QR payload and never open (the user never scans).
    QrOnly { qr: String },
    /// Emit a pairing code, then open.
    PairingThenOpen { code: String, open_after: Duration },
    /// Signal a close with the given reason instead of opening.
    Close { reason: DisconnectReason },
    /// Accept the attempt but never signal anything.
    Stall,
    /// Reject the connection attempt outright.
    Refuse,
}

/// In-process backend with scriptable connect behavior.
///
/// This is the dev/test stand-in for a real network client: connection
/// outcomes are driven by a per-channel script, and tests can inject
/// unsolicited closes, probe failures, and send failures on the live
/// session.
pub struct LoopbackBackend {
    kind: ChannelKind,
    default_script: ConnectScript,
    scripts: DashMap<ChannelId, ConnectScript>,
    sessions: DashMap<ChannelId, Arc<LoopbackSession>>,
}

impl LoopbackBackend {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            default_script: ConnectScript::Open,
            scripts: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    pub fn with_default_script(mut self, script: ConnectScript) -> Self {
        self.default_script = script;
        self
    }

    /// Override the connect script for a single channel.
    pub fn script_for(&self, channel_id: impl Into<ChannelId>, script: ConnectScript) {
        self.scripts.insert(channel_id.into(), script);
    }

    /// The most recent session created for `channel_id`, if any.
    pub fn session(&self, channel_id: &ChannelId) -> Option<Arc<LoopbackSession>> {
        self.sessions.get(channel_id).map(|entry| entry.clone())
    }

    fn script(&self, channel_id: &ChannelId) -> ConnectScript {
        self.scripts
            .get(channel_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| self.default_script.clone())
    }
}

#[async_trait]
impl ChannelBackend for LoopbackBackend {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn connect(
        &self,
        channel_id: &ChannelId,
        _session_blob: Option<&str>,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Arc<dyn BackendSession>> {
        let script = self.script(channel_id);
        if script == ConnectScript::Refuse {
            return Err(anyhow!("loopback connect refused for {channel_id}"));
        }

        let session = Arc::new(LoopbackSession {
            channel_id: channel_id.clone(),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_probes: AtomicBool::new(false),
            fail_sends_remaining: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            events,
        });
        self.sessions.insert(channel_id.clone(), session.clone());

        let scripted = session.clone();
        tokio::spawn(async move {
            scripted.run_script(script).await;
        });

        Ok(session)
    }
}

/// A scripted loopback session. Sends are recorded instead of leaving the
/// process.
pub struct LoopbackSession {
    channel_id: ChannelId,
    authenticated: AtomicBool,
    closed: AtomicBool,
    fail_probes: AtomicBool,
    fail_sends_remaining: AtomicU32,
    sent: Mutex<Vec<(String, OutboundContent)>>,
    events: mpsc::Sender<BackendEvent>,
}

impl LoopbackSession {
    async fn run_script(&self, script: ConnectScript) {
        match script {
            ConnectScript::Open => self.open().await,
            ConnectScript::OpenAfter(delay) => {
                tokio::time::sleep(delay).await;
                self.open().await;
            }
            ConnectScript::QrThenOpen { qr, open_after } => {
                self.emit(BackendEvent::Qr { payload: qr }).await;
                tokio::time::sleep(open_after).await;
                self.open().await;
            }
            ConnectScript::QrOnly { qr } => {
                self.emit(BackendEvent::Qr { payload: qr }).await;
            }
            ConnectScript::PairingThenOpen { code, open_after } => {
                self.emit(BackendEvent::Pairing { code }).await;
                tokio::time::sleep(open_after).await;
                self.open().await;
            }
            ConnectScript::Close { reason } => {
                self.closed.store(true, Ordering::SeqCst);
                self.emit(BackendEvent::Closed { reason }).await;
            }
            ConnectScript::Stall | ConnectScript::Refuse => {}
        }
    }

    async fn open(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.authenticated.store(true, Ordering::SeqCst);
        self.emit(BackendEvent::Opened).await;
    }

    async fn emit(&self, event: BackendEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(channel_id = %self.channel_id, "loopback event receiver dropped");
        }
    }

    /// Inject an unsolicited close, as if the network dropped the session.
    pub async fn emit_close(&self, reason: DisconnectReason) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.emit(BackendEvent::Closed { reason }).await;
    }

    /// Inject inbound traffic, which supervision treats as a heartbeat.
    pub async fn emit_activity(&self, message_id: impl Into<crate::types::MessageId>) {
        self.emit(BackendEvent::Activity {
            message_id: message_id.into(),
        })
        .await;
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail before succeeding again.
    pub fn fail_next_sends(&self, count: u32) {
        self.fail_sends_remaining.store(count, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<(String, OutboundContent)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BackendSession for LoopbackSession {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, target: &str, content: &OutboundContent) -> Result<SendReceipt> {
        if !self.is_authenticated() {
            return Err(anyhow!(
                "loopback session for {} is not connected",
                self.channel_id
            ));
        }
        let remaining = self.fail_sends_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("scripted send failure ({remaining} remaining)"));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((target.to_string(), content.clone()));
        }
        Ok(SendReceipt {
            message_id: ulid::Ulid::new().to_string().into(),
            random: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn probe(&self) -> Result<()> {
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(anyhow!("scripted probe failure for {}", self.channel_id));
        }
        if !self.is_authenticated() {
            return Err(anyhow!(
                "loopback session for {} is not connected",
                self.channel_id
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        Ok(())
    }
}
