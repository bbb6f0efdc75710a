//! Seam between the connection manager and a chat platform

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bobb_core::{HistoryEntry, InboundEvent, OutgoingMessage, Result};
use tokio::sync::mpsc;

/// Credentials and naming for one agent presence
#[derive(Clone)]
pub struct AgentConnectConfig {
    pub id: String,
    pub name: String,
    pub token: String,
}

impl fmt::Debug for AgentConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConnectConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"***")
            .finish()
    }
}

/// Opens live presences on a chat platform
#[async_trait]
pub trait Transport: Send + Sync {
    /// Log in as the agent and resolve once the platform handshake completes.
    /// Every event the presence observes afterwards is pushed into `events`.
    async fn connect(
        &self,
        config: &AgentConnectConfig,
        events: mpsc::Sender<InboundEvent>,
    ) -> Result<Arc<dyn Presence>>;
}

/// One agent's live connection
#[async_trait]
pub trait Presence: Send + Sync {
    /// Platform-assigned identity of the logged-in agent
    fn identity(&self) -> &str;

    /// Human-readable tag of the logged-in agent
    fn tag(&self) -> &str;

    /// Send a message, returning the platform id of the (first) sent message
    async fn send(&self, msg: OutgoingMessage) -> Result<String>;

    async fn typing(&self, channel_id: &str) -> Result<()>;

    /// Up to `limit` messages preceding `before` in `channel_id`, oldest first
    async fn recent_history(
        &self,
        channel_id: &str,
        before: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>>;

    async fn shutdown(&self);
}
