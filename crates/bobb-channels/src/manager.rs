//! Connection manager
//!
//! Owns every agent's live presence, routes each inbound event through
//! [`routing::decide`] and forwards the work to the right backend. Events are
//! handled concurrently; the only cross-agent coordination is the claim on
//! an event id taken before escalating it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bobb_core::bridge::Envelope;
use bobb_core::types::mention_token;
use bobb_core::{Backend, BobbError, InboundEvent, OutgoingMessage, RegistryHandle, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::claims::{ClaimSet, DEFAULT_CLAIM_TTL};
use crate::routing::{self, AgentIdentity, Directory, Roles, Route};
use crate::transport::{AgentConnectConfig, Presence, Transport};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub primary_id: String,
    pub orchestrator_id: String,
    pub presence_timeout: Duration,
    pub history_limit: usize,
    pub claim_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            primary_id: "bobb".to_string(),
            orchestrator_id: "obb".to_string(),
            presence_timeout: Duration::from_secs(30),
            history_limit: bobb_core::bridge::DEFAULT_HISTORY_LIMIT,
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }
}

/// What happened to one event at one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Ignored,
    Handled,
    Escalated,
    /// Another agent already claimed the event
    ClaimLost,
    /// Backend missing or unhealthy; the event is lost
    Dropped,
}

/// Public view of an online agent
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub name: String,
    pub ready: bool,
    pub network_identity: String,
    pub tag: String,
}

/// Outbound send requested through the boundary API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    pub channel_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Agent display names or ids to mention ahead of the content
    #[serde(default, alias = "mention_bots")]
    pub mention_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub sent_by: String,
    pub mentioned: Vec<String>,
    pub unresolved: Vec<String>,
}

struct Connection {
    name: String,
    presence: Arc<dyn Presence>,
    cancel: CancellationToken,
}

enum Slot {
    Connecting,
    Online(Arc<Connection>),
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: RegistryHandle,
    config: ManagerConfig,
    slots: RwLock<HashMap<String, Slot>>,
    backends: DashMap<String, Arc<dyn Backend>>,
    claims: ClaimSet,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: RegistryHandle,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let claims = ClaimSet::new(config.claim_ttl);
        Arc::new(Self {
            transport,
            registry,
            config,
            slots: RwLock::new(HashMap::new()),
            backends: DashMap::new(),
            claims,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn register_backend(&self, agent_id: &str, backend: Arc<dyn Backend>) {
        self.backends.insert(agent_id.to_string(), backend);
    }

    pub fn remove_backend(&self, agent_id: &str) -> bool {
        self.backends.remove(agent_id).is_some()
    }

    /// Bring one agent online. Fails with `DuplicateAgent` if the id is
    /// already online or connecting, and with `PresenceTimeout` if the
    /// handshake does not finish in time; neither leaves anything behind.
    pub async fn start(self: &Arc<Self>, agent: AgentConnectConfig) -> Result<ConnectionInfo> {
        {
            let mut slots = self.slots.write().await;
            if slots.contains_key(&agent.id) {
                return Err(BobbError::DuplicateAgent(agent.id.clone()));
            }
            slots.insert(agent.id.clone(), Slot::Connecting);
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let connected = tokio::time::timeout(
            self.config.presence_timeout,
            self.transport.connect(&agent, tx),
        )
        .await;

        let presence = match connected {
            Ok(Ok(presence)) => presence,
            Ok(Err(e)) => {
                self.slots.write().await.remove(&agent.id);
                return Err(e);
            }
            Err(_) => {
                self.slots.write().await.remove(&agent.id);
                return Err(BobbError::PresenceTimeout {
                    id: agent.id.clone(),
                    timeout: self.config.presence_timeout,
                });
            }
        };

        let identity = presence.identity().to_string();
        if let Err(e) = self
            .registry
            .update_network_identity(&agent.id, &identity)
            .await
        {
            warn!("Failed to record network identity for {}: {}", agent.id, e);
        }

        let connection = Arc::new(Connection {
            name: agent.name.clone(),
            presence: presence.clone(),
            cancel: CancellationToken::new(),
        });
        self.spawn_pump(agent.id.clone(), rx, connection.cancel.clone());
        self.slots
            .write()
            .await
            .insert(agent.id.clone(), Slot::Online(connection));

        info!("[{}] online as {} ({})", agent.id, presence.tag(), identity);
        Ok(ConnectionInfo {
            id: agent.id,
            name: agent.name,
            ready: true,
            network_identity: identity,
            tag: presence.tag().to_string(),
        })
    }

    /// Feed one presence's events into concurrently running handlers
    fn spawn_pump(
        self: &Arc<Self>,
        agent_id: String,
        mut rx: mpsc::Receiver<InboundEvent>,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            let manager = manager.clone();
                            let agent_id = agent_id.clone();
                            tokio::spawn(async move {
                                manager.handle_event(&agent_id, event).await;
                            });
                        }
                        None => break,
                    }
                }
            }
            debug!("[{}] event pump stopped", agent_id);
        });
    }

    pub async fn stop(&self, agent_id: &str) -> Result<()> {
        let slot = {
            let mut slots = self.slots.write().await;
            match slots.get(agent_id) {
                Some(Slot::Online(_)) => slots.remove(agent_id),
                _ => None,
            }
        };
        match slot {
            Some(Slot::Online(connection)) => {
                connection.cancel.cancel();
                connection.presence.shutdown().await;
                info!("[{}] stopped", agent_id);
                Ok(())
            }
            _ => Err(BobbError::NotFound(agent_id.to_string())),
        }
    }

    /// Stop every presence concurrently and wait for all of them
    pub async fn stop_all(&self) {
        let connections: Vec<(String, Arc<Connection>)> = {
            let mut slots = self.slots.write().await;
            let online: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Online(_)))
                .map(|(id, _)| id.clone())
                .collect();
            online
                .into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(Slot::Online(c)) => Some((id, c)),
                    _ => None,
                })
                .collect()
        };

        info!("Stopping {} presence(s)", connections.len());
        let mut set = JoinSet::new();
        for (id, connection) in connections {
            set.spawn(async move {
                connection.cancel.cancel();
                connection.presence.shutdown().await;
                id
            });
        }
        while let Some(result) = set.join_next().await {
            match result {
                Ok(id) => debug!("[{}] stopped", id),
                Err(e) => warn!("Presence shutdown task failed: {}", e),
            }
        }
    }

    pub async fn is_online(&self, agent_id: &str) -> bool {
        matches!(
            self.slots.read().await.get(agent_id),
            Some(Slot::Online(_))
        )
    }

    pub async fn online_agents(&self) -> Vec<ConnectionInfo> {
        let slots = self.slots.read().await;
        let mut agents: Vec<ConnectionInfo> = slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Online(c) => Some(ConnectionInfo {
                    id: id.clone(),
                    name: c.name.clone(),
                    ready: true,
                    network_identity: c.presence.identity().to_string(),
                    tag: c.presence.tag().to_string(),
                }),
                Slot::Connecting => None,
            })
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    async fn connection(&self, agent_id: &str) -> Option<Arc<Connection>> {
        match self.slots.read().await.get(agent_id) {
            Some(Slot::Online(c)) => Some(c.clone()),
            _ => None,
        }
    }

    async fn directory(&self) -> Directory {
        let slots = self.slots.read().await;
        Directory {
            agents: slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Online(c) => Some(AgentIdentity {
                        id: id.clone(),
                        name: c.name.clone(),
                        identity: c.presence.identity().to_string(),
                    }),
                    Slot::Connecting => None,
                })
                .collect(),
        }
    }

    fn roles(&self) -> Roles {
        Roles {
            primary_id: self.config.primary_id.clone(),
            orchestrator_id: self.config.orchestrator_id.clone(),
        }
    }

    /// Route one event observed by `agent_id`
    pub async fn handle_event(&self, agent_id: &str, event: InboundEvent) -> RouteOutcome {
        let Some(connection) = self.connection(agent_id).await else {
            debug!("[{}] event {} for offline agent", agent_id, event.event_id);
            return RouteOutcome::Ignored;
        };
        let directory = self.directory().await;
        let route = routing::decide(
            agent_id,
            connection.presence.identity(),
            &self.roles(),
            &directory,
            &event,
        );

        match route {
            Route::Ignore(reason) => {
                debug!("[{}] ignoring event {}: {:?}", agent_id, event.event_id, reason);
                RouteOutcome::Ignored
            }
            Route::Direct => {
                info!("[{}] direct message from {}", agent_id, event.author_tag);
                self.dispatch(agent_id, &connection, &event, &directory, RouteOutcome::Handled)
                    .await
            }
            Route::Handle => {
                if agent_id == self.config.orchestrator_id
                    && !self.claims.try_claim(&event.event_id)
                {
                    debug!("[{}] event {} already claimed", agent_id, event.event_id);
                    return RouteOutcome::ClaimLost;
                }
                info!(
                    "[{}] mentioned by {}{}",
                    agent_id,
                    event.author_tag,
                    if event.author_is_agent { " [BOT]" } else { "" }
                );
                self.dispatch(agent_id, &connection, &event, &directory, RouteOutcome::Handled)
                    .await
            }
            Route::Escalate(reason) => {
                if !self.claims.try_claim(&event.event_id) {
                    debug!(
                        "[{}] escalation of {} already claimed",
                        agent_id, event.event_id
                    );
                    return RouteOutcome::ClaimLost;
                }

                let orchestrator_id = self.config.orchestrator_id.clone();
                let Some(orchestrator) = self.connection(&orchestrator_id).await else {
                    warn!(
                        "[{}] event {} needs the orchestrator ({:?}) but it is offline; handling locally",
                        agent_id, event.event_id, reason
                    );
                    return self
                        .dispatch(agent_id, &connection, &event, &directory, RouteOutcome::Handled)
                        .await;
                };

                info!(
                    "[{}] escalating event {} to {} ({:?})",
                    agent_id, event.event_id, orchestrator_id, reason
                );
                self.dispatch(
                    &orchestrator_id,
                    &orchestrator,
                    &event,
                    &directory,
                    RouteOutcome::Escalated,
                )
                .await
            }
        }
    }

    /// Forward `event` to `agent_id`'s backend, answering as that agent
    async fn dispatch(
        &self,
        agent_id: &str,
        connection: &Connection,
        event: &InboundEvent,
        directory: &Directory,
        success: RouteOutcome,
    ) -> RouteOutcome {
        let Some(backend) = self.backends.get(agent_id).map(|b| b.clone()) else {
            warn!("[{}] no backend bridge registered; dropping event {}", agent_id, event.event_id);
            return RouteOutcome::Dropped;
        };

        if let Err(e) = connection.presence.typing(&event.channel_id).await {
            debug!("[{}] typing indicator failed: {}", agent_id, e);
        }

        let history = match connection
            .presence
            .recent_history(&event.channel_id, &event.event_id, self.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                debug!("[{}] history unavailable: {}", agent_id, e);
                Vec::new()
            }
        };

        if !backend.is_healthy().await {
            warn!(
                "[{}] dropping event {}: {}",
                agent_id,
                event.event_id,
                BobbError::BackendUnavailable(agent_id.to_string())
            );
            return RouteOutcome::Dropped;
        }

        let own_identity = connection.presence.identity();
        let author_agent_name = if event.author_is_agent {
            match directory.by_identity(&event.author_id) {
                Some(agent) => Some(agent.name.clone()),
                None => self
                    .registry
                    .find_by_identity(&event.author_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|a| a.name),
            }
        } else {
            None
        };

        let envelope = Envelope {
            channel_id: event.channel_id.clone(),
            message_id: event.event_id.clone(),
            author_id: event.author_id.clone(),
            author_tag: event.author_tag.clone(),
            content: event.content.clone(),
            is_direct: event.is_direct,
            is_from_agent: event.author_is_agent,
            author_agent_name,
            mentioned_agents: event
                .explicit_mentions
                .iter()
                .filter(|m| m.as_str() != own_identity)
                .filter_map(|m| directory.by_identity(m).map(|a| a.name.clone()))
                .collect(),
            history,
            self_name: Some(connection.name.clone()),
            self_tag: Some(connection.presence.tag().to_string()),
        };

        match backend.send(&envelope).await {
            Ok(reply) => {
                if !reply.tools_invoked.is_empty() {
                    info!("[{}] backend invoked tools: {}", agent_id, reply.tools_invoked.join(", "));
                }
                if let Some(text) = &reply.text {
                    debug!("[{}] backend text response ({} chars)", agent_id, text.len());
                }
                if !reply.has_response() {
                    warn!("[{}] backend returned no tools and no text", agent_id);
                }
                success
            }
            Err(e) => {
                error!("[{}] error forwarding event {}: {}", agent_id, event.event_id, e);
                RouteOutcome::Dropped
            }
        }
    }

    /// Send through `agent_id`'s presence, falling back to the primary agent
    /// and then to any online agent. Mention targets are resolved through the
    /// registry and prepended as mention tokens.
    pub async fn send_as(&self, agent_id: Option<&str>, request: SendRequest) -> Result<SendReceipt> {
        let (sender_id, connection) = self.pick_sender(agent_id).await?;

        let mut mentioned = Vec::new();
        let mut unresolved = Vec::new();
        let mut tokens = Vec::new();
        for target in &request.mention_targets {
            match self.resolve_identity(target).await? {
                Some(identity) => {
                    tokens.push(mention_token(&identity));
                    mentioned.push(target.clone());
                }
                None => unresolved.push(target.clone()),
            }
        }

        let content = if tokens.is_empty() {
            request.content
        } else {
            format!("{} {}", tokens.join(" "), request.content)
        };

        let message_id = connection
            .presence
            .send(OutgoingMessage {
                channel_id: request.channel_id,
                content,
                reply_to: request.reply_to,
            })
            .await?;

        Ok(SendReceipt {
            message_id,
            sent_by: sender_id,
            mentioned,
            unresolved,
        })
    }

    async fn pick_sender(&self, requested: Option<&str>) -> Result<(String, Arc<Connection>)> {
        let slots = self.slots.read().await;
        let online = |id: &str| match slots.get(id) {
            Some(Slot::Online(c)) => Some((id.to_string(), c.clone())),
            _ => None,
        };

        if let Some(id) = requested {
            if let Some(found) = online(id) {
                return Ok(found);
            }
            debug!("Requested sender {} is offline, falling back", id);
        }
        if let Some(found) = online(self.config.primary_id.as_str()) {
            return Ok(found);
        }
        let mut ids: Vec<&String> = slots.keys().collect();
        ids.sort();
        ids.into_iter()
            .find_map(|id| online(id.as_str()))
            .ok_or_else(|| BobbError::Transport("no connected agent available to send".to_string()))
    }

    /// Network identity for an agent id or display name
    async fn resolve_identity(&self, target: &str) -> Result<Option<String>> {
        if let Some(identity) = self
            .registry
            .get(target)
            .await?
            .and_then(|agent| agent.network_identity)
        {
            return Ok(Some(identity));
        }

        let matches = self.registry.find_by_name(target).await?;
        let exact = matches
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(target) && a.network_identity.is_some());
        let chosen = exact.or_else(|| matches.iter().find(|a| a.network_identity.is_some()));
        Ok(chosen.and_then(|a| a.network_identity.clone()))
    }
}
