//! Per-agent routing decision for one inbound event
//!
//! Pure function of the event, the receiving agent and the set of agents
//! currently online. Claiming and dispatch happen in the connection manager.

use bobb_core::InboundEvent;
use bobb_core::registry::is_token_shaped;

/// An agent as seen by the router
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub identity: String,
}

/// Online agents at the moment an event is routed
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub agents: Vec<AgentIdentity>,
}

impl Directory {
    pub fn by_id(&self, id: &str) -> Option<&AgentIdentity> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn by_identity(&self, identity: &str) -> Option<&AgentIdentity> {
        self.agents.iter().find(|a| a.identity == identity)
    }
}

/// Fixed roles in the deployment
#[derive(Debug, Clone)]
pub struct Roles {
    pub primary_id: String,
    pub orchestrator_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnEvent,
    NotAddressed,
    /// Credential submissions are only accepted by the primary agent
    CredentialForPrimary,
}

/// Why an event goes to the orchestrator. Triggers are independent; any one
/// of them is enough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Escalation {
    pub mentions_orchestrator: bool,
    pub multiple_agents: bool,
    pub broadcast: bool,
}

impl Escalation {
    pub fn triggered(&self) -> bool {
        self.mentions_orchestrator || self.multiple_agents || self.broadcast
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ignore(IgnoreReason),
    /// Private conversation handled by the receiving agent
    Direct,
    /// Channel event handled by the receiving agent
    Handle,
    /// Channel event redirected to the orchestrator
    Escalate(Escalation),
}

pub fn decide(
    agent_id: &str,
    identity: &str,
    roles: &Roles,
    directory: &Directory,
    event: &InboundEvent,
) -> Route {
    if event.author_id == identity {
        return Route::Ignore(IgnoreReason::OwnEvent);
    }

    if event.is_direct {
        if agent_id != roles.primary_id && is_token_shaped(event.content.trim()) {
            return Route::Ignore(IgnoreReason::CredentialForPrimary);
        }
        return Route::Direct;
    }

    let is_orchestrator = agent_id == roles.orchestrator_id;
    let addressed = event.addresses(identity) || (is_orchestrator && event.broadcast_all);
    if !addressed {
        return Route::Ignore(IgnoreReason::NotAddressed);
    }

    if is_orchestrator {
        return Route::Handle;
    }

    let orchestrator_identity = directory
        .by_id(&roles.orchestrator_id)
        .map(|a| a.identity.as_str());

    // The orchestrator tagging agents is delegation, never another escalation
    if orchestrator_identity == Some(event.author_id.as_str()) {
        return Route::Handle;
    }

    let ordinary_mentioned = directory
        .agents
        .iter()
        .filter(|a| a.id != roles.orchestrator_id)
        .filter(|a| event.mentions_explicitly(&a.identity))
        .count();

    let escalation = Escalation {
        mentions_orchestrator: orchestrator_identity.is_some_and(|o| event.mentions_explicitly(o)),
        multiple_agents: ordinary_mentioned > 1,
        broadcast: event.broadcast_all,
    };

    if escalation.triggered() {
        Route::Escalate(escalation)
    } else {
        Route::Handle
    }
}
