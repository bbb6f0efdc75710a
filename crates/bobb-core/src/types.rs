//! Shared types for bobb-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound chat event delivered to one agent's presence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: String,
    pub channel_id: String,
    pub author_id: String,
    /// Human-readable author tag (e.g. `name#1234`)
    pub author_tag: String,
    pub author_is_agent: bool,
    /// Direct/private conversation rather than a broadcast channel
    pub is_direct: bool,
    pub content: String,
    /// Identities referenced by a mention token inside `content`
    #[serde(default)]
    pub explicit_mentions: Vec<String>,
    /// Identities the platform flagged as mentioned without a token in the
    /// content (reply pings and similar threading metadata)
    #[serde(default)]
    pub implicit_mentions: Vec<String>,
    /// Event carries the broadcast-all marker
    #[serde(default)]
    pub broadcast_all: bool,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn mentions_explicitly(&self, identity: &str) -> bool {
        self.explicit_mentions.iter().any(|m| m == identity)
    }

    /// Whether `identity` should treat this event as addressed to it.
    ///
    /// Implicit references only count when a human wrote the event. Agents
    /// must mention each other explicitly.
    pub fn addresses(&self, identity: &str) -> bool {
        if self.mentions_explicitly(identity) {
            return true;
        }
        !self.author_is_agent && self.implicit_mentions.iter().any(|m| m == identity)
    }
}

/// Outbound message sent through an agent's presence
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutgoingMessage {
    pub channel_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>, // event id to thread under
}

/// One entry of the recent channel history window handed to a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_agent: bool,
}

/// Render a platform identity as a mention token
pub fn mention_token(identity: &str) -> String {
    format!("<@{}>", identity)
}

/// Extract identities from `<@id>` / `<@!id>` mention tokens in raw content.
///
/// Role (`<@&id>`) and channel (`<#id>`) references are not identities and are skipped.
pub fn parse_mention_tokens(content: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find("<@") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('>') else {
            break;
        };
        let inner = after[..end].strip_prefix('!').unwrap_or(&after[..end]);
        if !inner.is_empty()
            && inner.chars().all(|c| c.is_ascii_digit())
            && !found.iter().any(|f| f == inner)
        {
            found.push(inner.to_string());
        }
        rest = &after[end + 1..];
    }

    found
}
