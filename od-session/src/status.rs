use od_channels::{ChannelId, ChannelKind, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a channel, shared by the persisted record and the
/// connection supervisor.
///
/// `qrcode`, `pairing`, and `timeout` are the authentication sub-states of
/// an open attempt; `failed` is the terminal state the health monitor
/// escalates to after the reconnect ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disconnected,
    Opening,
    Qrcode,
    Pairing,
    Timeout,
    Connected,
    Failed,
}

impl ChannelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Opening => "opening",
            Self::Qrcode => "qrcode",
            Self::Pairing => "pairing",
            Self::Timeout => "timeout",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are never auto-reconnected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "disconnected" => Ok(Self::Disconnected),
            "opening" => Ok(Self::Opening),
            "qrcode" => Ok(Self::Qrcode),
            "pairing" => Ok(Self::Pairing),
            "timeout" => Ok(Self::Timeout),
            "connected" => Ok(Self::Connected),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown channel status: {other:?}")),
        }
    }
}

/// The durable channel record. Owned by the store; mutated by the
/// supervisor and the state synchronizer through `ChannelPatch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub tenant_id: TenantId,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    pub qr_payload: Option<String>,
    pub session_blob: Option<String>,
    pub retries: u32,
    pub is_active: bool,
}

/// Partial update for a channel record. `None` leaves a field untouched;
/// the nested options distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPatch {
    pub status: Option<ChannelStatus>,
    pub qr_payload: Option<Option<String>>,
    pub session_blob: Option<Option<String>>,
    pub retries: Option<u32>,
    pub is_active: Option<bool>,
}

impl ChannelPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_qr_payload(mut self, payload: impl Into<String>) -> Self {
        self.qr_payload = Some(Some(payload.into()));
        self
    }

    pub fn clear_qr_payload(mut self) -> Self {
        self.qr_payload = Some(None);
        self
    }

    pub fn with_session_blob(mut self, blob: impl Into<String>) -> Self {
        self.session_blob = Some(Some(blob.into()));
        self
    }

    pub fn clear_session_blob(mut self) -> Self {
        self.session_blob = Some(None);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_is_active(mut self, is_active: bool) -> Self {
        self.is_active = Some(is_active);
        self
    }

    pub fn apply(&self, record: &mut ChannelRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(qr_payload) = &self.qr_payload {
            record.qr_payload = qr_payload.clone();
        }
        if let Some(session_blob) = &self.session_blob {
            record.session_blob = session_blob.clone();
        }
        if let Some(retries) = self.retries {
            record.retries = retries;
        }
        if let Some(is_active) = self.is_active {
            record.is_active = is_active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelPatch, ChannelRecord, ChannelStatus};
    use od_channels::ChannelKind;
    use std::str::FromStr;

    fn record() -> ChannelRecord {
        ChannelRecord {
            id: "ch-1".into(),
            tenant_id: "tenant-1".into(),
            kind: ChannelKind::Whatsapp,
            status: ChannelStatus::Qrcode,
            qr_payload: Some("qr".to_string()),
            session_blob: Some("blob".to_string()),
            retries: 2,
            is_active: true,
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ChannelStatus::Disconnected,
            ChannelStatus::Opening,
            ChannelStatus::Qrcode,
            ChannelStatus::Pairing,
            ChannelStatus::Timeout,
            ChannelStatus::Connected,
            ChannelStatus::Failed,
        ] {
            assert_eq!(ChannelStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(ChannelStatus::from_str("limbo").is_err());
    }

    #[test]
    fn only_failed_is_terminal() {
        assert!(ChannelStatus::Failed.is_terminal());
        assert!(!ChannelStatus::Disconnected.is_terminal());
        assert!(!ChannelStatus::Timeout.is_terminal());
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let mut target = record();
        ChannelPatch::new().apply(&mut target);
        assert_eq!(target, record());
    }

    #[test]
    fn patch_distinguishes_clear_from_untouched() {
        let mut target = record();
        ChannelPatch::new()
            .with_status(ChannelStatus::Connected)
            .clear_qr_payload()
            .with_retries(0)
            .apply(&mut target);

        assert_eq!(target.status, ChannelStatus::Connected);
        assert_eq!(target.qr_payload, None);
        assert_eq!(target.retries, 0);
        assert_eq!(
            target.session_blob.as_deref(),
            Some("blob"),
            "untouched field must survive the patch"
        );
    }
}
