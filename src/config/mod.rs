//! Configuration system
//!
//! Loads ~/.config/gitopsd/config.yaml with support for:
//! - Default remote for fetch requests
//! - Event channel sizing
//! - SSH agent socket and bind timeout
//! - Bare or non-bare clones

mod service_config;
pub mod validation;

pub use service_config::{AgentConfig, CloneConfig, ServiceConfig};
pub use validation::{validate_config, validate_config_result, ValidationError};
