//! Configuration validation
//!
//! Checks a `ServiceConfig` before the registry starts:
//! - Default remote name is usable
//! - Event channel can hold at least one event
//! - Agent socket path, when given, is absolute

use super::service_config::ServiceConfig;
use crate::GitOpsError;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a gitopsd configuration
pub fn validate_config(config: &ServiceConfig) -> ValidationResult {
    let mut errors = Vec::new();

    let remote = config.default_remote.trim();
    if remote.is_empty() {
        errors.push(ValidationError::new(
            "default_remote",
            "Remote name must not be empty",
        ));
    } else if remote.contains(char::is_whitespace) || remote.contains('/') {
        errors.push(ValidationError::new(
            "default_remote",
            format!("Invalid remote name: {}", config.default_remote),
        ));
    }

    if config.event_channel_capacity == 0 {
        errors.push(ValidationError::new(
            "event_channel_capacity",
            "Must be at least 1",
        ));
    }

    if let Some(socket) = &config.agent.socket {
        if !socket.is_absolute() {
            errors.push(ValidationError::new(
                "agent.socket",
                format!("Socket path must be absolute: {}", socket.display()),
            ));
        }
    }

    if config.agent.enabled && config.agent.bind_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "agent.bind_timeout_secs",
            "Must be at least 1 when the agent is enabled",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and return a single error listing every problem
pub fn validate_config_result(config: &ServiceConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        GitOpsError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&ServiceConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_remote_and_zero_capacity() {
        let mut config = ServiceConfig::default();
        config.default_remote = "  ".to_string();
        config.event_channel_capacity = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "default_remote");
        assert_eq!(errors[1].field, "event_channel_capacity");
    }

    #[test]
    fn test_relative_socket_rejected() {
        let mut config = ServiceConfig::default();
        config.agent.socket = Some(PathBuf::from("agent.sock"));

        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("agent.socket"));
    }

    #[test]
    fn test_zero_timeout_only_matters_when_enabled() {
        let mut config = ServiceConfig::default();
        config.agent.bind_timeout_secs = 0;
        assert!(validate_config(&config).is_err());

        config.agent.enabled = false;
        assert!(validate_config(&config).is_ok());
    }
}
