use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("job payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Broker(e.to_string())
    }
}

impl From<tokio::task::JoinError> for QueueError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Broker(format!("blocking broker task failed: {e}"))
    }
}
