//! Channel backend seam for OpenDesk.
//!
//! Backends are pure connection I/O: they open an authenticated session to a
//! chat network and surface lifecycle events (`BackendEvent`) on an mpsc
//! channel. Supervision, persistence, and delivery live elsewhere.

mod backend;
mod loopback;
mod types;

pub use backend::{BackendSession, ChannelBackend, SendReceipt};
pub use loopback::{ConnectScript, LoopbackBackend, LoopbackSession};
pub use types::{
    BackendEvent, CampaignId, ChannelId, ChannelKind, ContactId, DisconnectReason, MessageId,
    OutboundContent, TenantId, TicketId,
};
