//! Repository operation registry
//!
//! Maps each repository identity to its `RepositoryOperationContext`, which
//! serializes clone and fetch operations for that repository. Contexts for
//! different repositories run independently.

mod context;
mod observer;
mod service;

pub use context::{ContextSnapshot, ContextStatus, LastOutcome, RepositoryOperationContext};
pub use observer::RepositoryObserver;
pub use service::OperationRegistry;
