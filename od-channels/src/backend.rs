use crate::types::{BackendEvent, ChannelId, ChannelKind, MessageId, OutboundContent};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a backend hands back for a completed send. The `random` nonce is
/// generated per send and recorded alongside campaign acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub random: String,
}

/// A connector to one chat network. `connect` begins a connection attempt
/// and reports progress on `events`; the returned session stays valid until
/// a `Closed` event fires or `close` is called.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Start a connection attempt for `channel_id`, resuming from
    /// `session_blob` when one is stored. Lifecycle events (QR, opened,
    /// closed) are pushed to `events` for as long as the session lives.
    async fn connect(
        &self,
        channel_id: &ChannelId,
        session_blob: Option<&str>,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Arc<dyn BackendSession>>;
}

/// A live connection to a chat network on behalf of one channel.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// True once the session has completed authentication.
    fn is_authenticated(&self) -> bool;

    async fn send(&self, target: &str, content: &OutboundContent) -> Result<SendReceipt>;

    /// Lightweight liveness round-trip against the network.
    async fn probe(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
