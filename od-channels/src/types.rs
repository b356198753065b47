use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ChannelId);
id_newtype!(TenantId);
id_newtype!(MessageId);
id_newtype!(TicketId);
id_newtype!(CampaignId);
id_newtype!(ContactId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Whatsapp,
    Telegram,
    Instagram,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Instagram => "instagram",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Self::Whatsapp),
            "telegram" => Ok(Self::Telegram),
            "instagram" => Ok(Self::Instagram),
            other => Err(anyhow::anyhow!("unknown channel kind: {other:?}")),
        }
    }
}

/// Why a connection went away. Terminal reasons invalidate the stored
/// session credentials and require a fresh pairing before reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    SessionInvalid,
    ConnectionLost,
    Replaced,
    ServerError(String),
}

impl DisconnectReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::SessionInvalid)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged out"),
            Self::SessionInvalid => write!(f, "session invalid"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Replaced => write!(f, "replaced by another connection"),
            Self::ServerError(detail) => write!(f, "server error: {detail}"),
        }
    }
}

/// Lifecycle events a backend pushes while a connection attempt (and later
/// the live session) is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum BackendEvent {
    /// A QR payload the user must scan to authenticate.
    Qr { payload: String },
    /// A short pairing code shown instead of a QR image.
    Pairing { code: String },
    /// The connection is open and authenticated.
    Opened,
    /// The connection is gone.
    Closed { reason: DisconnectReason },
    /// Inbound traffic observed on the live session; used as a heartbeat.
    Activity { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Interactive {
        body: String,
        options: Vec<String>,
    },
    Template {
        template: String,
        params: Vec<String>,
    },
    Reaction {
        message_id: MessageId,
        emoji: String,
    },
}

impl OutboundContent {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Interactive { .. } => "interactive",
            Self::Template { .. } => "template",
            Self::Reaction { .. } => "reaction",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendEvent, ChannelKind, DisconnectReason, OutboundContent};
    use std::str::FromStr;

    #[test]
    fn channel_kind_round_trips_through_str() {
        for kind in [
            ChannelKind::Whatsapp,
            ChannelKind::Telegram,
            ChannelKind::Instagram,
        ] {
            assert_eq!(ChannelKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(ChannelKind::from_str("smoke-signal").is_err());
    }

    #[test]
    fn only_auth_reasons_are_terminal() {
        assert!(DisconnectReason::LoggedOut.is_terminal());
        assert!(DisconnectReason::SessionInvalid.is_terminal());
        assert!(!DisconnectReason::ConnectionLost.is_terminal());
        assert!(!DisconnectReason::Replaced.is_terminal());
        assert!(!DisconnectReason::ServerError("503".to_string()).is_terminal());
    }

    #[test]
    fn backend_event_serializes_with_event_tag() {
        let event = BackendEvent::Qr {
            payload: "qr-data".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["event"], "qr");
        assert_eq!(json["payload"], "qr-data");
    }

    #[test]
    fn outbound_content_exposes_stable_kind_names() {
        let content = OutboundContent::Template {
            template: "welcome".to_string(),
            params: vec!["Ada".to_string()],
        };
        assert_eq!(content.kind_str(), "template");
    }
}
