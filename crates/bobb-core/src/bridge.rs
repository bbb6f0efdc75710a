//! Bridge between a chat event and an agent's reasoning backend
//!
//! The backend speaks the OpenCode server API: sessions live under
//! `/session`, prompts are posted to `/session/{id}/message` and the reply is
//! a list of typed parts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{BobbError, Result};
use crate::types::HistoryEntry;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_HISTORY_ENTRY_MAX_CHARS: usize = 500;

const SESSION_TITLE: &str = "Discord Bot Session";

/// Backend tools that must stay off so the agent only reaches the outside
/// world through its own capability tools
const DISABLED_TOOLS: &[&str] = &[
    "read", "write", "edit", "bash", "glob", "grep", "patch", "webfetch",
];

/// Everything a backend needs to answer one event
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    pub author_tag: String,
    pub content: String,
    pub is_direct: bool,
    pub is_from_agent: bool,
    /// Display name of the authoring agent, when the author is a known agent
    pub author_agent_name: Option<String>,
    /// Display names of other agents explicitly referenced by the event
    pub mentioned_agents: Vec<String>,
    /// Recent channel history, oldest first
    pub history: Vec<HistoryEntry>,
    pub self_name: Option<String>,
    pub self_tag: Option<String>,
}

/// Decomposed backend reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendReply {
    /// First free-text segment, if any
    pub text: Option<String>,
    /// Capability invocations in the order the backend reported them
    pub tools_invoked: Vec<String>,
}

impl BackendReply {
    pub fn has_response(&self) -> bool {
        self.text.is_some() || !self.tools_invoked.is_empty()
    }
}

/// Seam between the connection manager and a reasoning backend
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<BackendReply>;

    async fn is_healthy(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct PromptLimits {
    pub history_limit: usize,
    pub entry_max_chars: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            entry_max_chars: DEFAULT_HISTORY_ENTRY_MAX_CHARS,
        }
    }
}

/// HTTP client for one agent's backend server
pub struct OpenCodeBridge {
    client: Client,
    base_url: String,
    session: OnceCell<String>,
    limits: PromptLimits,
}

#[derive(Deserialize)]
struct SessionInfo {
    id: String,
}

impl OpenCodeBridge {
    pub fn new(port: u16, limits: PromptLimits) -> Result<Self> {
        Self::with_base_url(format!("http://127.0.0.1:{}", port), limits)
    }

    pub fn with_base_url(base_url: impl Into<String>, limits: PromptLimits) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            session: OnceCell::new(),
            limits,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session id, created on first use and reused for the bridge's lifetime
    async fn session_id(&self) -> Result<&str> {
        let id = self
            .session
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .post(format!("{}/session", self.base_url))
                    .json(&json!({ "title": SESSION_TITLE }))
                    .send()
                    .await?;
                let info: SessionInfo = check_status(response).await?.json().await?;
                debug!("Created backend session {} at {}", info.id, self.base_url);
                Ok::<_, BobbError>(info.id)
            })
            .await?;
        Ok(id.as_str())
    }
}

#[async_trait]
impl Backend for OpenCodeBridge {
    async fn send(&self, envelope: &Envelope) -> Result<BackendReply> {
        let session_id = self.session_id().await?;
        let prompt = format_prompt(envelope, Utc::now(), self.limits);

        let tools: serde_json::Map<String, Value> = DISABLED_TOOLS
            .iter()
            .map(|t| (t.to_string(), Value::Bool(false)))
            .collect();

        let body = json!({
            "parts": [{ "type": "text", "text": prompt }],
            "tools": tools,
        });

        let response = self
            .client
            .post(format!("{}/session/{}/message", self.base_url, session_id))
            .json(&body)
            .send()
            .await?;
        let raw: Value = check_status(response).await?.json().await?;

        let reply = decompose_reply(&raw);
        debug!(
            "Backend {} replied: text={} tools={:?}",
            self.base_url,
            reply.text.is_some(),
            reply.tools_invoked
        );
        Ok(reply)
    }

    async fn is_healthy(&self) -> bool {
        match self
            .client
            .get(format!("{}/session", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("Backend {} health check returned {}", self.base_url, resp.status());
                false
            }
            Err(e) => {
                warn!("Backend {} health check failed: {}", self.base_url, e);
                false
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(BobbError::Backend(format!(
        "request failed with status {}: {}",
        status, body
    )))
}

/// Split a raw reply into the first text part and the invoked tool names
pub fn decompose_reply(raw: &Value) -> BackendReply {
    let Some(parts) = raw.get("parts").and_then(Value::as_array) else {
        return BackendReply::default();
    };

    let mut reply = BackendReply::default();
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") if reply.text.is_none() => {
                reply.text = part.get("text").and_then(Value::as_str).map(str::to_string);
            }
            Some("tool") => {
                let name = part
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                reply.tools_invoked.push(name.to_string());
            }
            _ => {}
        }
    }
    reply
}

/// Coarse relative age: `Ns ago`, `Nm ago` or `Nh ago`
pub fn format_time_ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds().max(0);
    if seconds < 60 {
        return format!("{}s ago", seconds);
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{}m ago", minutes);
    }
    format!("{}h ago", minutes / 60)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Render the structured prompt sent to the backend
pub fn format_prompt(envelope: &Envelope, now: DateTime<Utc>, limits: PromptLimits) -> String {
    let context = if envelope.is_direct {
        "Direct Message".to_string()
    } else {
        format!("Channel {}", envelope.channel_id)
    };

    let mut out = format!("[Discord {}]\n", context);

    if let Some(name) = &envelope.self_name {
        out.push_str(&format!("You are: {}", name));
        if let Some(tag) = &envelope.self_tag {
            out.push_str(&format!(" ({})", tag));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "From: {} (User ID: {})",
        envelope.author_tag, envelope.author_id
    ));
    if envelope.is_from_agent {
        out.push_str(" [BOT]");
        if let Some(name) = &envelope.author_agent_name {
            out.push_str(&format!(" (Bot Name: {})", name));
        }
    }
    out.push('\n');

    out.push_str(&format!("Channel ID: {}\n", envelope.channel_id));
    out.push_str(&format!(
        "Message ID: {} (use this as reply_to)",
        envelope.message_id
    ));
    if !envelope.mentioned_agents.is_empty() {
        out.push_str(&format!(
            "\nOther Bots Mentioned: {}",
            envelope.mentioned_agents.join(", ")
        ));
    }
    out.push_str(&format!("\nIs From Bot: {}", envelope.is_from_agent));

    let skip = envelope.history.len().saturating_sub(limits.history_limit);
    let window = &envelope.history[skip..];
    if !window.is_empty() {
        out.push_str("\n\n--- Recent Channel History ---\n");
        let lines: Vec<String> = window
            .iter()
            .map(|h| {
                format!(
                    "[{}] {}{}: {}",
                    format_time_ago(h.timestamp, now),
                    h.author,
                    if h.is_agent { " [BOT]" } else { "" },
                    truncate_chars(&h.content, limits.entry_max_chars)
                )
            })
            .collect();
        out.push_str(&lines.join("\n"));
        out.push_str("\n--- End History ---");
    }

    out.push_str("\n\n");
    out.push_str(&envelope.content);
    out
}
