//! gitopsd - Serialized clone/fetch queues per repository
//!
//! Accepts clone and fetch requests for many local repositories, runs them
//! one at a time per repository (in arrival order) and independently across
//! repositories, authenticates SSH transfers through a shared SSH agent
//! binding, and reports progress and outcomes to subscribers.
//!
//! # Architecture
//!
//! - **registry**: `OperationRegistry` and the per-repository
//!   `RepositoryOperationContext` queue
//! - **operation**: Clone and Fetch operations and their outcomes
//! - **git**: repository identity, remotes, handles and the libgit2 transport
//! - **agent**: SSH agent connector and binding lifecycle
//! - **dispatch**: decoding inbound requests into operations
//! - **notify**: operation events, sinks and the broadcast channel
//! - **config**: ~/.config/gitopsd/config.yaml
//! - **metrics**: Prometheus counters and gauges

// Core modules
pub mod error;
pub mod git;
pub mod operation;
pub mod registry;

// Collaborators
pub mod agent;
pub mod dispatch;
pub mod notify;

// Ambient
pub mod config;
pub mod logging;
pub mod metrics;

// Re-exports
pub use error::{GitOpsError, Result};
