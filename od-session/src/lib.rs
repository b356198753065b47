//! Channel session supervision for OpenDesk.
//!
//! Owns the lifecycle of long-lived channel connections: the in-process
//! session registry, per-operation locks, the connection state machine,
//! health escalation, and reconciliation between registry reality and the
//! persisted channel records.

mod error;
mod events;
mod health;
mod locks;
mod registry;
mod status;
mod store;
mod supervisor;
mod sync;

pub use error::{Result, SessionError};
pub use events::{EventSink, MemoryEventSink, WebhookEventSink, publish_or_log, topics};
pub use health::{HealthConfig, HealthMonitor, HealthSnapshot, HealthState};
pub use locks::{OperationGuard, OperationKind, OperationLockManager};
pub use registry::{SessionHandle, SessionRegistry};
pub use status::{ChannelPatch, ChannelRecord, ChannelStatus};
pub use store::{
    CampaignContactRecord, CampaignDelivery, ChannelStore, DeliveryOutcome, SqliteStore,
};
pub use supervisor::{
    ConnectionSupervisor, ControlOutcome, StartOutcome, SupervisorConfig, reconnect_delay,
};
pub use sync::{StateSynchronizer, SyncConfig, SyncReport};
