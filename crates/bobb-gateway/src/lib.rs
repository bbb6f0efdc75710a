//! bobb-gateway - HTTP boundary API for the bobb supervisor
//!
//! Thin JSON wrappers over the agent registry and the connection manager:
//! registry CRUD, token activation, status correction and send-as-agent.

pub mod protocol;
pub mod server;

pub use server::{GatewayServer, GatewayState};
