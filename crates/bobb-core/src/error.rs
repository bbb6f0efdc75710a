//! Error taxonomy shared by every bobb crate

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BobbError>;

#[derive(Debug, Error)]
pub enum BobbError {
    #[error("agent '{0}' not found")]
    NotFound(String),

    #[error("agent '{0}' is already active")]
    AlreadyActive(String),

    #[error("invalid token format: expected three non-empty dot-separated segments")]
    InvalidTokenFormat,

    #[error("agent '{0}' is already online")]
    DuplicateAgent(String),

    #[error("backend for '{id}' on port {port} did not become healthy within {timeout:?}")]
    ProcessStartTimeout {
        id: String,
        port: u16,
        timeout: Duration,
    },

    #[error("presence for '{id}' did not complete its handshake within {timeout:?}")]
    PresenceTimeout { id: String, timeout: Duration },

    #[error("channel '{0}' not found or not text-based")]
    ChannelUnavailable(String),

    #[error("backend for '{0}' is unavailable")]
    BackendUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BobbError {
    /// Stable machine-readable kind, surfaced through the boundary API
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyActive(_) => "already_active",
            Self::InvalidTokenFormat => "invalid_token_format",
            Self::DuplicateAgent(_) => "duplicate_agent",
            Self::ProcessStartTimeout { .. } => "process_start_timeout",
            Self::PresenceTimeout { .. } => "presence_timeout",
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Backend(_) => "backend_error",
            Self::Transport(_) => "transport_error",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

impl From<reqwest::Error> for BobbError {
    fn from(e: reqwest::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
