//! Boundary API protocol: JSON bodies exchanged with HTTP clients

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bobb_core::{AgentEntry, AgentStatus, BobbError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Registry entry as exposed over HTTP. The token itself never leaves the
/// process; callers only learn whether one is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    pub port: u16,
    pub status: AgentStatus,
    pub has_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

impl From<AgentEntry> for AgentView {
    fn from(entry: AgentEntry) -> Self {
        Self {
            has_token: entry.token.is_some(),
            id: entry.id,
            name: entry.name,
            persona: entry.persona,
            port: entry.port,
            status: entry.status,
            network_identity: entry.network_identity,
            created_at: entry.created_at,
            activated_at: entry.activated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub persona: Option<String>,
}

/// `{token}` activates the agent; `{status}` overrides its status
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAgentRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub channel_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Agent to speak as; falls back to the primary agent
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub mention_bots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub message_id: String,
    pub sent_by: String,
    pub mentioned_bots: Vec<String>,
    pub unresolved_bots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Error returned by every handler, rendered as `{"error": {kind, message}}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        BobbError::InvalidRequest(message.into()).into()
    }
}

/// HTTP status for an error kind
pub fn status_for(err: &BobbError) -> StatusCode {
    match err {
        BobbError::NotFound(_) => StatusCode::NOT_FOUND,
        BobbError::AlreadyActive(_) | BobbError::DuplicateAgent(_) => StatusCode::CONFLICT,
        BobbError::InvalidTokenFormat | BobbError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        BobbError::ProcessStartTimeout { .. }
        | BobbError::PresenceTimeout { .. }
        | BobbError::ChannelUnavailable(_)
        | BobbError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<BobbError> for ApiError {
    fn from(err: BobbError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("API request failed: {}", err);
        }
        Self {
            status,
            body: ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.body })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&BobbError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&BobbError::AlreadyActive("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&BobbError::InvalidTokenFormat), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&BobbError::BackendUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&BobbError::Transport("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_agent_view_hides_token() {
        let entry = AgentEntry {
            id: "chef".into(),
            name: "Chef".into(),
            persona: None,
            port: 4097,
            status: AgentStatus::ReadyToStart,
            token: Some("a.b.c".into()),
            network_identity: None,
            created_at: None,
            activated_at: None,
        };
        let json = serde_json::to_string(&AgentView::from(entry)).unwrap();
        assert!(json.contains("\"has_token\":true"));
        assert!(json.contains("\"status\":\"ready_to_start\""));
        assert!(!json.contains("a.b.c"));
    }

    #[test]
    fn test_update_request_shapes() {
        let req: UpdateAgentRequest = serde_json::from_str(r#"{"token":"a.b.c"}"#).unwrap();
        assert_eq!(req.token.as_deref(), Some("a.b.c"));
        assert!(req.status.is_none());

        let req: UpdateAgentRequest = serde_json::from_str(r#"{"status":"active"}"#).unwrap();
        assert_eq!(req.status, Some(AgentStatus::Active));

        assert!(serde_json::from_str::<UpdateAgentRequest>(r#"{"status":"bogus"}"#).is_err());
    }

    #[test]
    fn test_send_request_defaults() {
        let req: SendMessageRequest =
            serde_json::from_str(r#"{"channel_id":"1","content":"hi"}"#).unwrap();
        assert!(req.bot_id.is_none());
        assert!(req.mention_bots.is_empty());
    }
}
