//! Discord transport using Serenity
//!
//! One serenity client per agent. `connect` resolves once the gateway sends
//! `Ready`; if the caller gives up before that, the half-started client is
//! shut down so no shard outlives the failed attempt.

use std::sync::Arc;

use async_trait::async_trait;
use bobb_core::types::parse_mention_tokens;
use bobb_core::{BobbError, HistoryEntry, InboundEvent, OutgoingMessage, Result};
use chrono::{DateTime, Utc};
use serenity::all::{
    Channel, ChannelId, ChannelType, Client, Context, CreateMessage, EventHandler, GatewayIntents,
    GetMessages, Http, Message, MessageId, Ready, ShardManager,
};
use serenity::gateway::GatewayError;
use serenity::prelude::TypeMapKey;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::{AgentConnectConfig, Presence, Transport};

/// Discord's maximum message length in characters
const DISCORD_MAX_LENGTH: usize = 2000;

pub const DEFAULT_BROADCAST_MARKER: &str = "@here";

/// Type key for the inbound event sender
struct EventSender;

impl TypeMapKey for EventSender {
    type Value = mpsc::Sender<InboundEvent>;
}

/// Type key for the one-shot handshake notifier
struct ReadySignal;

impl TypeMapKey for ReadySignal {
    type Value = Arc<Mutex<Option<oneshot::Sender<(String, String)>>>>;
}

struct DiscordHandler {
    agent_id: String,
    broadcast_marker: String,
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        let tx = {
            let data = ctx.data.read().await;
            match data.get::<EventSender>() {
                Some(tx) => tx.clone(),
                None => {
                    error!("EventSender not initialized for {}", self.agent_id);
                    return;
                }
            }
        };

        let event = build_event(RawMessage {
            event_id: msg.id.to_string(),
            channel_id: msg.channel_id.to_string(),
            author_id: msg.author.id.to_string(),
            author_tag: msg.author.tag(),
            author_is_agent: msg.author.bot,
            is_direct: msg.guild_id.is_none(),
            content: msg.content.clone(),
            platform_mentions: msg.mentions.iter().map(|u| u.id.to_string()).collect(),
            mention_everyone: msg.mention_everyone,
            timestamp: DateTime::from_timestamp(msg.timestamp.unix_timestamp(), 0)
                .unwrap_or_else(Utc::now),
            broadcast_marker: &self.broadcast_marker,
        });

        debug!(
            "[{}] event {} from {} in {}",
            self.agent_id, event.event_id, event.author_tag, event.channel_id
        );

        if let Err(e) = tx.send(event).await {
            warn!("Dropping Discord event for {}: {}", self.agent_id, e);
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            "[{}] Ready! Logged in as {} (ID: {})",
            self.agent_id,
            ready.user.tag(),
            ready.user.id
        );

        let signal = {
            let data = ctx.data.read().await;
            data.get::<ReadySignal>().cloned()
        };
        if let Some(signal) = signal {
            if let Some(tx) = signal.lock().await.take() {
                let _ = tx.send((ready.user.id.to_string(), ready.user.tag()));
            }
        }
    }
}

/// Platform-independent view of one message, used to build an [`InboundEvent`]
struct RawMessage<'a> {
    event_id: String,
    channel_id: String,
    author_id: String,
    author_tag: String,
    author_is_agent: bool,
    is_direct: bool,
    content: String,
    /// Every user the platform lists as mentioned, including reply pings
    platform_mentions: Vec<String>,
    mention_everyone: bool,
    timestamp: DateTime<Utc>,
    broadcast_marker: &'a str,
}

/// Explicit mentions come from tokens in the content; anything else the
/// platform flags as mentioned is implicit.
fn build_event(raw: RawMessage<'_>) -> InboundEvent {
    let explicit_mentions = parse_mention_tokens(&raw.content);
    let implicit_mentions = raw
        .platform_mentions
        .into_iter()
        .filter(|id| !explicit_mentions.contains(id))
        .collect();
    let broadcast_all = raw.mention_everyone || raw.content.contains(raw.broadcast_marker);

    InboundEvent {
        event_id: raw.event_id,
        channel_id: raw.channel_id,
        author_id: raw.author_id,
        author_tag: raw.author_tag,
        author_is_agent: raw.author_is_agent,
        is_direct: raw.is_direct,
        content: raw.content,
        explicit_mentions,
        implicit_mentions,
        broadcast_all,
        timestamp: raw.timestamp,
    }
}

/// Check if a serenity error represents a fatal gateway condition that should not be retried
fn is_fatal_gateway_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(gateway_err) => matches!(
            gateway_err,
            GatewayError::InvalidAuthentication
                | GatewayError::NoAuthentication
                | GatewayError::InvalidShardData
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
        ),
        _ => false,
    }
}

/// Split a message into chunks that fit Discord's 2000 character limit,
/// preferring line breaks, then word breaks, then a hard cut.
pub fn split_message(content: &str) -> Vec<String> {
    if content.chars().count() <= DISCORD_MAX_LENGTH {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut String, current_len: &mut usize| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
        *current_len = 0;
    };

    for line in content.lines() {
        let line_len = line.chars().count();

        if line_len > DISCORD_MAX_LENGTH {
            flush(&mut current, &mut current_len);
            for word in line.split_whitespace() {
                let word_len = word.chars().count();
                if word_len > DISCORD_MAX_LENGTH {
                    flush(&mut current, &mut current_len);
                    let chars: Vec<char> = word.chars().collect();
                    for piece in chars.chunks(DISCORD_MAX_LENGTH) {
                        current = piece.iter().collect();
                        current_len = piece.len();
                        if current_len == DISCORD_MAX_LENGTH {
                            flush(&mut current, &mut current_len);
                        }
                    }
                    continue;
                }
                let sep = usize::from(current_len > 0);
                if current_len + sep + word_len > DISCORD_MAX_LENGTH {
                    flush(&mut current, &mut current_len);
                }
                if current_len > 0 {
                    current.push(' ');
                    current_len += 1;
                }
                current.push_str(word);
                current_len += word_len;
            }
            continue;
        }

        let sep = usize::from(current_len > 0);
        if current_len + sep + line_len > DISCORD_MAX_LENGTH {
            flush(&mut current, &mut current_len);
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }
    flush(&mut current, &mut current_len);

    chunks
}

fn parse_snowflake(kind: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| BobbError::InvalidRequest(format!("invalid {} id '{}'", kind, raw)))
}

/// Serenity-backed [`Transport`]
pub struct DiscordTransport {
    broadcast_marker: String,
}

impl Default for DiscordTransport {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_MARKER)
    }
}

impl DiscordTransport {
    pub fn new(broadcast_marker: impl Into<String>) -> Self {
        Self {
            broadcast_marker: broadcast_marker.into(),
        }
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::DIRECT_MESSAGES
    }
}

/// Shuts a client down unless disarmed once the handshake has completed
struct PendingClient {
    shard_manager: Option<Arc<ShardManager>>,
    task: Option<JoinHandle<()>>,
}

impl PendingClient {
    fn disarm(mut self) -> Option<JoinHandle<()>> {
        self.shard_manager = None;
        self.task.take()
    }
}

impl Drop for PendingClient {
    fn drop(&mut self) {
        if let Some(shard_manager) = self.shard_manager.take() {
            let task = self.task.take();
            tokio::spawn(async move {
                shard_manager.shutdown_all().await;
                if let Some(task) = task {
                    task.abort();
                }
            });
        }
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn connect(
        &self,
        config: &AgentConnectConfig,
        events: mpsc::Sender<InboundEvent>,
    ) -> Result<Arc<dyn Presence>> {
        info!("Connecting Discord presence for {} ({})", config.name, config.id);

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = DiscordHandler {
            agent_id: config.id.clone(),
            broadcast_marker: self.broadcast_marker.clone(),
        };

        let mut client = Client::builder(&config.token, Self::intents())
            .event_handler(handler)
            .await
            .map_err(|e| {
                BobbError::Transport(format!("failed to create client for {}: {}", config.id, e))
            })?;

        {
            let mut data = client.data.write().await;
            data.insert::<EventSender>(events);
            data.insert::<ReadySignal>(Arc::new(Mutex::new(Some(ready_tx))));
        }

        let http = client.http.clone();
        let shard_manager = client.shard_manager.clone();
        let agent_id = config.id.clone();

        let task = tokio::spawn(async move {
            match client.start().await {
                Ok(()) => info!("Discord client for {} stopped cleanly", agent_id),
                Err(e) if is_fatal_gateway_error(&e) => {
                    error!("Discord fatal error for {} (will not retry): {}", agent_id, e);
                    error!(
                        "Check the bot token and intents at https://discord.com/developers/applications"
                    );
                }
                Err(e) => error!("Discord client for {} failed: {}", agent_id, e),
            }
        });

        let pending = PendingClient {
            shard_manager: Some(shard_manager.clone()),
            task: Some(task),
        };

        let (identity, tag) = ready_rx.await.map_err(|_| {
            BobbError::Transport(format!(
                "client for {} stopped before completing its handshake",
                config.id
            ))
        })?;

        let task = pending.disarm();
        Ok(Arc::new(DiscordPresence {
            agent_id: config.id.clone(),
            identity,
            tag,
            http,
            shard_manager,
            task: Mutex::new(task),
        }))
    }
}

/// A logged-in Discord bot
pub struct DiscordPresence {
    agent_id: String,
    identity: String,
    tag: String,
    http: Arc<Http>,
    shard_manager: Arc<ShardManager>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscordPresence {
    /// Resolve a channel the bot can post text into
    async fn text_channel(&self, channel_id: &str) -> Result<ChannelId> {
        let id = ChannelId::new(parse_snowflake("channel", channel_id)?);
        let channel = self
            .http
            .get_channel(id)
            .await
            .map_err(|_| BobbError::ChannelUnavailable(channel_id.to_string()))?;
        match channel {
            Channel::Private(_) => Ok(id),
            Channel::Guild(gc)
                if matches!(
                    gc.kind,
                    ChannelType::Text
                        | ChannelType::News
                        | ChannelType::PublicThread
                        | ChannelType::PrivateThread
                        | ChannelType::NewsThread
                        | ChannelType::Voice
                ) =>
            {
                Ok(id)
            }
            _ => Err(BobbError::ChannelUnavailable(channel_id.to_string())),
        }
    }
}

#[async_trait]
impl Presence for DiscordPresence {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn send(&self, msg: OutgoingMessage) -> Result<String> {
        let channel_id = self.text_channel(&msg.channel_id).await?;
        let reply_to = msg
            .reply_to
            .as_deref()
            .map(|id| parse_snowflake("message", id).map(MessageId::new))
            .transpose()?;

        let chunks = split_message(&msg.content);
        if chunks.len() > 1 {
            debug!(
                "Message split into {} chunks due to Discord's character limit",
                chunks.len()
            );
        }

        let mut first_id = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut builder = CreateMessage::new().content(chunk);
            if let (0, Some(reply_to)) = (i, reply_to) {
                builder = builder.reference_message((channel_id, reply_to));
            }

            let sent = channel_id
                .send_message(&self.http, builder)
                .await
                .map_err(|e| {
                    BobbError::Transport(format!(
                        "failed to send Discord message chunk {}: {}",
                        i + 1,
                        e
                    ))
                })?;
            first_id.get_or_insert_with(|| sent.id.to_string());
        }

        info!(
            "[{}] message sent to channel {} ({} chunk(s))",
            self.agent_id,
            channel_id,
            chunks.len()
        );
        first_id.ok_or_else(|| BobbError::InvalidRequest("empty message".to_string()))
    }

    async fn typing(&self, channel_id: &str) -> Result<()> {
        let id = ChannelId::new(parse_snowflake("channel", channel_id)?);
        id.broadcast_typing(&self.http)
            .await
            .map_err(|e| BobbError::Transport(e.to_string()))
    }

    async fn recent_history(
        &self,
        channel_id: &str,
        before: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let channel = ChannelId::new(parse_snowflake("channel", channel_id)?);
        let before = MessageId::new(parse_snowflake("message", before)?);
        let limit = u8::try_from(limit.clamp(1, 100)).unwrap_or(100);

        let messages = channel
            .messages(&self.http, GetMessages::new().before(before).limit(limit))
            .await
            .map_err(|e| BobbError::Transport(e.to_string()))?;

        // Discord returns newest first
        Ok(messages
            .into_iter()
            .rev()
            .map(|m| HistoryEntry {
                author: m.author.name.clone(),
                timestamp: DateTime::from_timestamp(m.timestamp.unix_timestamp(), 0)
                    .unwrap_or_else(Utc::now),
                is_agent: m.author.bot,
                content: m.content,
            })
            .collect())
    }

    async fn shutdown(&self) {
        info!("[{}] Disconnecting", self.agent_id);
        self.shard_manager.shutdown_all().await;
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}
