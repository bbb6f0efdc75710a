//! Single-writer registry actor
//!
//! Every operation is a message to one task that owns the store, so two
//! concurrent `create` calls can never hand out the same id or port.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{AgentEntry, AgentStatus, OrchestratorSeed, RegistryStore};
use crate::error::{BobbError, Result};
use crate::mailbox::{ActivationSignal, Mailbox};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Create {
        name: String,
        persona: Option<String>,
        reply: Reply<AgentEntry>,
    },
    Activate {
        id: String,
        token: String,
        reply: Reply<AgentEntry>,
    },
    UpdateNetworkIdentity {
        id: String,
        identity: String,
        reply: Reply<bool>,
    },
    SetStatus {
        id: String,
        status: AgentStatus,
        reply: Reply<AgentEntry>,
    },
    MarkActive {
        id: String,
        reply: Reply<AgentEntry>,
    },
    Get {
        id: String,
        reply: Reply<Option<AgentEntry>>,
    },
    List {
        status: Option<AgentStatus>,
        reply: Reply<Vec<AgentEntry>>,
    },
    FindByName {
        query: String,
        reply: Reply<Vec<AgentEntry>>,
    },
    FindByIdentity {
        identity: String,
        reply: Reply<Option<AgentEntry>>,
    },
}

/// Owner of the registry document
pub struct Registry {
    store: RegistryStore,
    mailbox: Arc<dyn Mailbox>,
    seed: Option<OrchestratorSeed>,
}

impl Registry {
    pub fn new(
        store: RegistryStore,
        mailbox: Arc<dyn Mailbox>,
        seed: Option<OrchestratorSeed>,
    ) -> Self {
        Self {
            store,
            mailbox,
            seed,
        }
    }

    /// Start the actor task and return a handle to it. The task exits once
    /// every handle has been dropped.
    pub fn spawn(self) -> RegistryHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        tokio::spawn(async move {
            info!("Registry actor started ({})", self.store.path().display());
            while let Some(cmd) = rx.recv().await {
                self.handle(cmd).await;
            }
            debug!("Registry actor stopped");
        });
        RegistryHandle { tx }
    }

    async fn handle(&self, cmd: Command) {
        match cmd {
            Command::Create {
                name,
                persona,
                reply,
            } => {
                let _ = reply.send(self.create(&name, persona).await);
            }
            Command::Activate { id, token, reply } => {
                let _ = reply.send(self.activate(&id, &token).await);
            }
            Command::UpdateNetworkIdentity {
                id,
                identity,
                reply,
            } => {
                let _ = reply.send(self.update_network_identity(&id, &identity).await);
            }
            Command::SetStatus { id, status, reply } => {
                let result = self.mutate(|data| data.set_status(&id, status)).await;
                let _ = reply.send(result);
            }
            Command::MarkActive { id, reply } => {
                let result = self.mutate(|data| data.mark_active(&id)).await;
                let _ = reply.send(result);
            }
            Command::Get { id, reply } => {
                let result = self
                    .store
                    .load()
                    .await
                    .map(|mut data| data.agents.remove(&id));
                let _ = reply.send(result);
            }
            Command::List { status, reply } => {
                let result = self.store.load().await.map(|data| match status {
                    Some(status) => data.by_status(status),
                    None => data.agents.into_values().collect(),
                });
                let _ = reply.send(result);
            }
            Command::FindByName { query, reply } => {
                let result = self.store.load().await.map(|data| data.find_by_name(&query));
                let _ = reply.send(result);
            }
            Command::FindByIdentity { identity, reply } => {
                let result = self
                    .store
                    .load()
                    .await
                    .map(|data| data.find_by_identity(&identity));
                let _ = reply.send(result);
            }
        }
    }

    /// Load, apply `f`, and persist only when `f` succeeded
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut super::RegistryData) -> Result<T>,
    ) -> Result<T> {
        let mut data = self.store.load().await?;
        let out = f(&mut data)?;
        self.store.save(&data).await?;
        Ok(out)
    }

    async fn create(&self, name: &str, persona: Option<String>) -> Result<AgentEntry> {
        let entry = self
            .mutate(|data| data.create(name, persona, Utc::now()))
            .await?;
        info!(
            "Registered agent {} ({}) on port {}",
            entry.id, entry.name, entry.port
        );
        Ok(entry)
    }

    /// Persist the ready status, then post the activation signal. If the
    /// signal cannot be written the previous entry is restored.
    async fn activate(&self, id: &str, token: &str) -> Result<AgentEntry> {
        let mut data = self.store.load().await?;
        let previous = data.agents.get(id).cloned();
        let entry = data.activate(id, token, Utc::now())?;
        self.store.save(&data).await?;

        let signal = ActivationSignal {
            agent_id: entry.id.clone(),
            name: entry.name.clone(),
            token: token.to_string(),
            port: entry.port,
            timestamp: entry.activated_at.unwrap_or_else(Utc::now),
        };
        if let Err(e) = self.mailbox.put(&signal).await {
            warn!("Activation signal for {} not written, restoring entry: {}", entry.id, e);
            if let Some(previous) = previous {
                data.agents.insert(entry.id.clone(), previous);
                if let Err(restore) = self.store.save(&data).await {
                    warn!("Failed to restore registry entry {}: {}", entry.id, restore);
                }
            }
            return Err(e);
        }
        info!("Agent {} ready to start, activation signal posted", entry.id);
        Ok(entry)
    }

    async fn update_network_identity(&self, id: &str, identity: &str) -> Result<bool> {
        let mut data = self.store.load().await?;
        if !data.set_network_identity(id, identity, self.seed.as_ref(), Utc::now()) {
            warn!("Ignoring network identity for unknown agent {}", id);
            return Ok(false);
        }
        self.store.save(&data).await?;
        debug!("Recorded network identity {} for {}", identity, id);
        Ok(true)
    }
}

/// Cloneable handle to the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn create(&self, name: &str, persona: Option<String>) -> Result<AgentEntry> {
        let name = name.to_string();
        self.request(|reply| Command::Create {
            name,
            persona,
            reply,
        })
        .await
    }

    pub async fn activate(&self, id: &str, token: &str) -> Result<AgentEntry> {
        let (id, token) = (id.to_string(), token.to_string());
        self.request(|reply| Command::Activate { id, token, reply })
            .await
    }

    pub async fn update_network_identity(&self, id: &str, identity: &str) -> Result<bool> {
        let (id, identity) = (id.to_string(), identity.to_string());
        self.request(|reply| Command::UpdateNetworkIdentity {
            id,
            identity,
            reply,
        })
        .await
    }

    pub async fn set_status(&self, id: &str, status: AgentStatus) -> Result<AgentEntry> {
        let id = id.to_string();
        self.request(|reply| Command::SetStatus { id, status, reply })
            .await
    }

    pub async fn mark_active(&self, id: &str) -> Result<AgentEntry> {
        let id = id.to_string();
        self.request(|reply| Command::MarkActive { id, reply }).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentEntry>> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<AgentEntry>> {
        self.request(|reply| Command::List {
            status: None,
            reply,
        })
        .await
    }

    pub async fn list_by_status(&self, status: AgentStatus) -> Result<Vec<AgentEntry>> {
        self.request(|reply| Command::List {
            status: Some(status),
            reply,
        })
        .await
    }

    pub async fn find_by_name(&self, query: &str) -> Result<Vec<AgentEntry>> {
        let query = query.to_string();
        self.request(|reply| Command::FindByName { query, reply })
            .await
    }

    pub async fn find_by_identity(&self, identity: &str) -> Result<Option<AgentEntry>> {
        let identity = identity.to_string();
        self.request(|reply| Command::FindByIdentity { identity, reply })
            .await
    }
}

fn stopped() -> BobbError {
    BobbError::Storage(std::io::Error::other("registry actor stopped"))
}
