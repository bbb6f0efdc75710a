//! Agent registry: identity, port assignment and activation state
//!
//! The registry is one JSON document rewritten wholesale on every mutation.
//! All access goes through a single actor task (see [`actor`]) so mutations
//! made by this process are serialized; nothing protects the file against a
//! second process writing it concurrently.

pub mod actor;
pub mod slug;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BobbError, Result};

pub use actor::{Registry, RegistryHandle};
pub use slug::{is_token_shaped, slugify};
pub use store::RegistryStore;

/// Activation state of an agent. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    PendingToken,
    ReadyToStart,
    Active,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::PendingToken => "pending_token",
            Self::ReadyToStart => "ready_to_start",
            Self::Active => "active",
        })
    }
}

impl FromStr for AgentStatus {
    type Err = BobbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending_token" => Ok(Self::PendingToken),
            "ready_to_start" => Ok(Self::ReadyToStart),
            "active" => Ok(Self::Active),
            other => Err(BobbError::InvalidRequest(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

/// One registered agent
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    pub port: u16,
    pub status: AgentStatus,
    #[serde(default)]
    pub token: Option<String>,
    /// Platform-assigned identity, known after the first successful connection
    #[serde(
        default,
        alias = "discord_user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.port)
            .field("status", &self.status)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("network_identity", &self.network_identity)
            .finish()
    }
}

/// Minimal entry synthesized for the orchestrator the first time it reports
/// its network identity without having been created through the registry
#[derive(Debug, Clone)]
pub struct OrchestratorSeed {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub port: u16,
}

impl Default for OrchestratorSeed {
    fn default() -> Self {
        Self {
            id: "obb".to_string(),
            name: "OBB".to_string(),
            persona: "Orchestration Bot - manages multi-bot interactions".to_string(),
            port: 4095,
        }
    }
}

/// The persisted registry document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryData {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    pub next_port: u16,
}

impl RegistryData {
    pub fn new(first_port: u16) -> Self {
        Self {
            agents: BTreeMap::new(),
            next_port: first_port,
        }
    }

    /// Register a new agent with a unique slug id and the next free port
    pub fn create(
        &mut self,
        name: &str,
        persona: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentEntry> {
        let id = slug::unique_slug(name, |candidate| self.agents.contains_key(candidate));

        let port = self.next_port;
        self.next_port = port
            .checked_add(1)
            .ok_or_else(|| BobbError::InvalidRequest("port space exhausted".to_string()))?;

        let entry = AgentEntry {
            id: id.clone(),
            name: name.to_string(),
            persona,
            port,
            status: AgentStatus::PendingToken,
            token: None,
            network_identity: None,
            created_at: Some(now),
            activated_at: None,
        };
        self.agents.insert(id, entry.clone());
        Ok(entry)
    }

    /// Attach a token and move the agent to `ready_to_start`
    pub fn activate(&mut self, id: &str, token: &str, now: DateTime<Utc>) -> Result<AgentEntry> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| BobbError::NotFound(id.to_string()))?;

        if agent.status == AgentStatus::Active {
            return Err(BobbError::AlreadyActive(id.to_string()));
        }
        if !is_token_shaped(token) {
            return Err(BobbError::InvalidTokenFormat);
        }

        agent.token = Some(token.to_string());
        agent.status = AgentStatus::ReadyToStart;
        agent.activated_at = Some(now);
        Ok(agent.clone())
    }

    /// Record the platform identity. Returns false for unknown ids, except the
    /// orchestrator described by `seed`, which gets a minimal active entry.
    pub fn set_network_identity(
        &mut self,
        id: &str,
        identity: &str,
        seed: Option<&OrchestratorSeed>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.network_identity = Some(identity.to_string());
            return true;
        }

        match seed {
            Some(seed) if seed.id == id => {
                self.agents.insert(
                    id.to_string(),
                    AgentEntry {
                        id: id.to_string(),
                        name: seed.name.clone(),
                        persona: Some(seed.persona.clone()),
                        port: seed.port,
                        status: AgentStatus::Active,
                        token: None,
                        network_identity: Some(identity.to_string()),
                        created_at: Some(now),
                        activated_at: None,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Status override; any transition is allowed
    pub fn set_status(&mut self, id: &str, status: AgentStatus) -> Result<AgentEntry> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| BobbError::NotFound(id.to_string()))?;
        agent.status = status;
        Ok(agent.clone())
    }

    /// Forward-only promotion to `active`
    pub fn mark_active(&mut self, id: &str) -> Result<AgentEntry> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| BobbError::NotFound(id.to_string()))?;
        if agent.status < AgentStatus::Active {
            agent.status = AgentStatus::Active;
        }
        Ok(agent.clone())
    }

    /// Case-insensitive substring match on display names
    pub fn find_by_name(&self, query: &str) -> Vec<AgentEntry> {
        let query = query.to_lowercase();
        self.agents
            .values()
            .filter(|a| a.name.to_lowercase().contains(&query))
            .cloned()
            .collect()
    }

    pub fn by_status(&self, status: AgentStatus) -> Vec<AgentEntry> {
        self.agents
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    pub fn find_by_identity(&self, identity: &str) -> Option<AgentEntry> {
        self.agents
            .values()
            .find(|a| a.network_identity.as_deref() == Some(identity))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> RegistryData {
        RegistryData::new(4097)
    }

    #[test]
    fn test_create_assigns_slug_and_port() {
        let mut reg = data();
        let entry = reg.create("Chef Bot", Some("friendly chef".into()), Utc::now()).unwrap();
        assert_eq!(entry.id, "chef-bot");
        assert_eq!(entry.port, 4097);
        assert_eq!(entry.status, AgentStatus::PendingToken);
        assert!(entry.token.is_none());
        assert_eq!(reg.next_port, 4098);
    }

    #[test]
    fn test_create_collision_appends_counter() {
        let mut reg = data();
        let first = reg.create("Chef Bot", None, Utc::now()).unwrap();
        let second = reg.create("Chef Bot", Some("v2".into()), Utc::now()).unwrap();
        let third = reg.create("chef  bot!", None, Utc::now()).unwrap();
        assert_eq!(first.id, "chef-bot");
        assert_eq!(second.id, "chef-bot-2");
        assert_eq!(second.port, 4098);
        assert_eq!(third.id, "chef-bot-3");
    }

    #[test]
    fn test_ports_strictly_increase() {
        let mut reg = data();
        let mut last = 0;
        for name in ["a", "b", "a", "", "!!!", "a"] {
            let entry = reg.create(name, None, Utc::now()).unwrap();
            assert!(entry.port > last);
            last = entry.port;
        }
    }

    #[test]
    fn test_activate_errors() {
        let mut reg = data();
        reg.create("Chef Bot", None, Utc::now()).unwrap();

        assert!(matches!(
            reg.activate("nope", "a.b.c", Utc::now()),
            Err(BobbError::NotFound(_))
        ));
        assert!(matches!(
            reg.activate("chef-bot", "nodots", Utc::now()),
            Err(BobbError::InvalidTokenFormat)
        ));

        reg.set_status("chef-bot", AgentStatus::Active).unwrap();
        assert!(matches!(
            reg.activate("chef-bot", "a.b.c", Utc::now()),
            Err(BobbError::AlreadyActive(_))
        ));
    }

    #[test]
    fn test_activate_success() {
        let mut reg = data();
        reg.create("Chef Bot", None, Utc::now()).unwrap();
        let entry = reg.activate("chef-bot", "x.y.z", Utc::now()).unwrap();
        assert_eq!(entry.status, AgentStatus::ReadyToStart);
        assert_eq!(entry.token.as_deref(), Some("x.y.z"));
        assert!(entry.activated_at.is_some());
    }

    #[test]
    fn test_network_identity_bootstrap_only_for_orchestrator() {
        let mut reg = data();
        let seed = OrchestratorSeed::default();

        assert!(!reg.set_network_identity("ghost", "1", Some(&seed), Utc::now()));
        assert!(reg.agents.is_empty());

        assert!(reg.set_network_identity("obb", "2", Some(&seed), Utc::now()));
        let obb = &reg.agents["obb"];
        assert_eq!(obb.status, AgentStatus::Active);
        assert_eq!(obb.port, 4095);
        assert_eq!(obb.network_identity.as_deref(), Some("2"));
        assert_eq!(reg.find_by_identity("2").map(|a| a.id), Some("obb".to_string()));
    }

    #[test]
    fn test_mark_active_never_moves_backward() {
        let mut reg = data();
        reg.create("A", None, Utc::now()).unwrap();
        assert_eq!(reg.mark_active("a").unwrap().status, AgentStatus::Active);
        assert_eq!(reg.mark_active("a").unwrap().status, AgentStatus::Active);
    }

    #[test]
    fn test_find_by_name_case_insensitive() {
        let mut reg = data();
        reg.create("Weather Bot", None, Utc::now()).unwrap();
        reg.create("News Bot", None, Utc::now()).unwrap();
        assert_eq!(reg.find_by_name("WEATHER").len(), 1);
        assert_eq!(reg.find_by_name("bot").len(), 2);
        assert!(reg.find_by_name("chef").is_empty());
    }

    #[test]
    fn test_legacy_field_name_is_accepted() {
        let json = r#"{
            "agents": {
                "wobb": {"id":"wobb","name":"WoBB","port":4097,"status":"active","token":"a.b.c","discord_user_id":"123"}
            },
            "next_port": 4098
        }"#;
        let reg: RegistryData = serde_json::from_str(json).unwrap();
        assert_eq!(reg.agents["wobb"].network_identity.as_deref(), Some("123"));
    }

    #[test]
    fn test_debug_masks_token() {
        let mut reg = data();
        reg.create("A", None, Utc::now()).unwrap();
        let entry = reg.activate("a", "secret.token.value", Utc::now()).unwrap();
        let dbg = format!("{:?}", entry);
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [
            AgentStatus::PendingToken,
            AgentStatus::ReadyToStart,
            AgentStatus::Active,
        ] {
            assert_eq!(status.to_string().parse::<AgentStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<AgentStatus>().is_err());
    }
}
