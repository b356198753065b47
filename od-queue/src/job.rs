use chrono::{DateTime, Utc};
use od_channels::{CampaignId, ChannelId, ContactId, OutboundContent, TicketId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2_000);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the delivered message belongs to. Campaign deliveries get the
/// transactional ack merge on completion; ticket deliveries only record an
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "target")]
pub enum JobTarget {
    Ticket {
        ticket_id: TicketId,
    },
    Campaign {
        campaign_id: CampaignId,
        contact_id: ContactId,
        /// Ack level a successful send establishes for the contact.
        ack: i64,
    },
}

/// One unit of outbound work on the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: JobId,
    pub channel_id: ChannelId,
    pub target: JobTarget,
    /// Recipient address on the channel network.
    pub to: String,
    pub content: OutboundContent,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(
        channel_id: ChannelId,
        target: JobTarget,
        to: impl Into<String>,
        content: OutboundContent,
    ) -> Self {
        Self {
            id: JobId::generate(),
            channel_id,
            target,
            to: to.into(),
            content,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Dispatch kind: the content kind, except campaign deliveries which
    /// route through the campaign completion path.
    pub fn kind_str(&self) -> &'static str {
        match self.target {
            JobTarget::Campaign { .. } => "campaign",
            JobTarget::Ticket { .. } => self.content.kind_str(),
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            factor: 2,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts already ran.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        let factor = u64::from(self.factor).saturating_pow(exponent);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }
}
