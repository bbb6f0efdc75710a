//! Agent bring-up: backend process, bridge, presence, registry status

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bobb_channels::{AgentConnectConfig, ConnectionManager};
use bobb_core::{ActivationSignal, BobbError, OpenCodeBridge, PromptLimits, RegistryHandle};
use bobb_runtime::{ActivationHandler, ProcessSupervisor};
use tracing::{info, warn};

/// Everything needed to bring one agent online
#[derive(Clone)]
pub struct LaunchSpec {
    pub id: String,
    pub name: String,
    pub token: String,
    pub port: u16,
    pub cwd: PathBuf,
    /// Registry agents are marked active once online
    pub tracked: bool,
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"***")
            .field("port", &self.port)
            .field("cwd", &self.cwd)
            .field("tracked", &self.tracked)
            .finish()
    }
}

pub struct AgentLauncher {
    supervisor: Arc<ProcessSupervisor>,
    connections: Arc<ConnectionManager>,
    registry: RegistryHandle,
    agents_dir: PathBuf,
    limits: PromptLimits,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks an agent as being brought up until dropped
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlight {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl AgentLauncher {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        connections: Arc<ConnectionManager>,
        registry: RegistryHandle,
        agents_dir: PathBuf,
        limits: PromptLimits,
    ) -> Self {
        Self {
            supervisor,
            connections,
            registry,
            agents_dir,
            limits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn agent_dir(&self, id: &str) -> PathBuf {
        self.agents_dir.join(id)
    }

    /// Start the backend, register its bridge, connect the presence and mark
    /// the agent active. A failure at any step undoes the earlier ones.
    /// A second bring-up of an agent that is online or still starting is
    /// rejected without touching the first.
    pub async fn bring_up(&self, spec: LaunchSpec) -> bobb_core::Result<()> {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight, &spec.id) else {
            return Err(BobbError::DuplicateAgent(spec.id));
        };
        if self.connections.is_online(&spec.id).await {
            return Err(BobbError::DuplicateAgent(spec.id));
        }

        info!("[{}] starting backend on port {}", spec.id, spec.port);
        self.supervisor
            .start_server(&spec.id, spec.port, &spec.cwd)
            .await?;

        let bridge = match OpenCodeBridge::new(spec.port, self.limits) {
            Ok(bridge) => bridge,
            Err(e) => {
                self.supervisor.stop_server(&spec.id).await;
                return Err(e);
            }
        };
        self.connections
            .register_backend(&spec.id, Arc::new(bridge));

        let connected = self
            .connections
            .start(AgentConnectConfig {
                id: spec.id.clone(),
                name: spec.name.clone(),
                token: spec.token.clone(),
            })
            .await;
        if let Err(e) = connected {
            warn!("[{}] presence failed, rolling back: {}", spec.id, e);
            self.connections.remove_backend(&spec.id);
            self.supervisor.stop_server(&spec.id).await;
            return Err(e);
        }

        if spec.tracked {
            if let Err(e) = self.registry.mark_active(&spec.id).await {
                warn!("[{}] failed to mark active: {}", spec.id, e);
            }
        }

        info!("[{}] {} is online", spec.id, spec.name);
        Ok(())
    }

    /// Bring up every registry agent that holds a token and is ready or was
    /// active before the last shutdown. Failures are logged per agent.
    pub async fn bring_up_registered(&self) -> bobb_core::Result<usize> {
        let mut started = 0;
        for agent in self.registry.list().await? {
            if agent.status == bobb_core::AgentStatus::PendingToken {
                continue;
            }
            let Some(token) = agent.token.clone() else {
                continue;
            };
            if self.connections.is_online(&agent.id).await {
                continue;
            }
            let spec = LaunchSpec {
                cwd: self.agent_dir(&agent.id),
                id: agent.id.clone(),
                name: agent.name.clone(),
                token,
                port: agent.port,
                tracked: true,
            };
            match self.bring_up(spec).await {
                Ok(()) => started += 1,
                Err(e) => warn!("[{}] failed to start: {}", agent.id, e),
            }
        }
        Ok(started)
    }
}

#[async_trait]
impl ActivationHandler for AgentLauncher {
    async fn on_activation(&self, signal: ActivationSignal) -> bobb_core::Result<()> {
        let spec = LaunchSpec {
            cwd: self.agent_dir(&signal.agent_id),
            id: signal.agent_id,
            name: signal.name,
            token: signal.token,
            port: signal.port,
            tracked: true,
        };
        self.bring_up(spec).await
    }
}
