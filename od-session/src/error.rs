use od_channels::{ChannelId, ChannelKind, DisconnectReason};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("no backend configured for channel kind {0}")]
    BackendMissing(ChannelKind),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection closed while opening: {0}")]
    ClosedWhileOpening(DisconnectReason),

    #[error("channel {0} has a live session; stop it first")]
    ChannelBusy(ChannelId),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Store(format!("blocking store task failed: {e}"))
    }
}
