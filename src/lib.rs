//! Run a command on exactly one replica of a workload.
//!
//! Replicas compete for a shared lease through a [`store::CoordinationStore`].
//! The [`election::ElectionEngine`] that holds the lease reports
//! [`election::LeadershipEvent::Gained`]; the [`orchestrator::Orchestrator`]
//! then publishes the replica's endpoint and starts the command under a scope
//! that is cancelled as soon as leadership is lost.

pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod record;
pub mod registrar;
pub mod store;
pub mod supervisor;

pub use election::{ElectionConfig, ElectionEngine, Leadership, LeadershipEvent};
pub use error::{Result, RunError};
pub use orchestrator::Orchestrator;
