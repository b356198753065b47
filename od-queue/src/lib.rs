//! Durable outbound delivery for OpenDesk.
//!
//! Jobs enter through a broker with at-least-once semantics and leave
//! through a worker pool that resolves the owning channel's live session,
//! dispatches by message kind, and writes the outcome back. Campaign
//! completions additionally merge a monotonic acknowledgment into the
//! campaign contact record.

mod broker;
mod error;
mod job;
mod worker;

pub use broker::{QueueBroker, QueueCounts, SqliteBroker};
pub use error::{QueueError, Result};
pub use job::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS, DeliveryJob, JobId, JobTarget};
pub use worker::{DeliveryWorkerPool, WorkerConfig};
