use shared::domain::ThreadId;
use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthenticated: missing identity or credential")]
    Unauthenticated,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel is not open")]
    NotConnected,
    #[error("connection lost: maximum reconnection attempts ({attempts}) reached")]
    ReconnectExhausted { attempts: u32 },
    #[error("messaging api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("messaging api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("no thread selected")]
    NoThreadSelected,
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEnvelope(err.to_string())
    }
}

impl ClientError {
    /// Durable-write failures are the ones a caller has to report to the user.
    pub fn is_api_failure(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::Http(_))
    }
}
