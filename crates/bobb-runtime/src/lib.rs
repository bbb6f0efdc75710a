//! bobb-runtime - process supervision and activation intake
//!
//! This crate provides:
//! - `ProcessSupervisor`, which owns one reasoning-backend child per agent
//! - `ActivationWatcher`, which turns mailbox signals into bring-up requests

pub mod activation;
pub mod supervisor;

pub use activation::{ActivationHandler, ActivationWatcher};
pub use supervisor::{ProcessState, ProcessSupervisor, ServerInfo, SupervisorConfig};
