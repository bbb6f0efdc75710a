//! Agent presences and event routing for bobb
//!
//! This crate provides the transport abstraction, the Discord presence,
//! the per-event routing decision and the connection manager that ties
//! presences to their backends.

pub mod claims;
pub mod discord;
pub mod manager;
pub mod routing;
pub mod transport;

// Re-export main types
pub use claims::ClaimSet;
pub use discord::DiscordTransport;
pub use manager::{
    ConnectionInfo, ConnectionManager, ManagerConfig, RouteOutcome, SendReceipt, SendRequest,
};
pub use routing::{Route, decide};
pub use transport::{AgentConnectConfig, Presence, Transport};
