//! bobb-core - shared model of the agent supervisor
//!
//! This crate provides:
//! - Chat event and outbound message types
//! - The agent registry (single-writer actor over a JSON document)
//! - The activation mailbox handing activated agents to the runtime
//! - The bridge that turns a chat event into a backend prompt

pub mod bridge;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod types;

pub use bridge::{Backend, BackendReply, Envelope, OpenCodeBridge, PromptLimits};
pub use error::{BobbError, Result};
pub use mailbox::{ActivationSignal, DirMailbox, Mailbox};
pub use registry::{
    AgentEntry, AgentStatus, OrchestratorSeed, Registry, RegistryHandle, RegistryStore,
};
pub use types::{HistoryEntry, InboundEvent, OutgoingMessage};
