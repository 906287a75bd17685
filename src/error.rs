//! Error types for gitopsd
//!
//! Defines one error enum covering request validation, authentication,
//! transport and ambient (config, I/O) failures. Uses thiserror for ergonomic
//! error handling.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for gitopsd operations
pub type Result<T> = std::result::Result<T, GitOpsError>;

/// Error type for gitopsd operations
#[derive(Error, Debug)]
pub enum GitOpsError {
    /// Request rejected before it was queued (bad URI, bad remote config)
    #[error("Invalid request: {0}")]
    RequestInvalid(String),

    /// No usable SSH identity for an operation that needs one
    #[error("Authentication unavailable: {0}")]
    AuthenticationUnavailable(String),

    /// Identity query while no agent is bound
    #[error("SSH agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Network or protocol failure during clone/fetch
    #[error("Transport error: {0}")]
    Transport(String),

    /// Clone target already holds a repository
    #[error("Repository already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Operation needs a repository that has not been materialized yet
    #[error("Repository not ready at {}", .0.display())]
    RepositoryNotReady(PathBuf),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Git2 library errors
    #[error("Git library error: {0}")]
    Git2(#[from] git2::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a failed operation, as reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RequestInvalid,
    AuthenticationUnavailable,
    Transport,
    AlreadyExists,
    RepositoryNotReady,
    Internal,
}

impl FailureKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RequestInvalid => "request_invalid",
            FailureKind::AuthenticationUnavailable => "authentication_unavailable",
            FailureKind::Transport => "transport",
            FailureKind::AlreadyExists => "already_exists",
            FailureKind::RepositoryNotReady => "repository_not_ready",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GitOpsError {
    /// Classify this error for outcome reporting
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GitOpsError::RequestInvalid(_) => FailureKind::RequestInvalid,
            GitOpsError::AuthenticationUnavailable(_) => FailureKind::AuthenticationUnavailable,
            // An identity query failing mid-operation means the operation
            // could not authenticate
            GitOpsError::AgentUnavailable(_) => FailureKind::AuthenticationUnavailable,
            GitOpsError::Transport(_) => FailureKind::Transport,
            GitOpsError::Git2(e) if e.code() == git2::ErrorCode::Auth => {
                FailureKind::AuthenticationUnavailable
            }
            GitOpsError::Git2(_) => FailureKind::Transport,
            GitOpsError::AlreadyExists(_) => FailureKind::AlreadyExists,
            GitOpsError::RepositoryNotReady(_) => FailureKind::RepositoryNotReady,
            GitOpsError::Config(_) => FailureKind::RequestInvalid,
            GitOpsError::Io(_) => FailureKind::Internal,
            GitOpsError::Json(_) => FailureKind::Internal,
            GitOpsError::Yaml(_) => FailureKind::Internal,
            GitOpsError::Other(_) => FailureKind::Internal,
        }
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            GitOpsError::RequestInvalid("bad".into()).failure_kind(),
            FailureKind::RequestInvalid
        );
        assert_eq!(
            GitOpsError::AgentUnavailable("gone".into()).failure_kind(),
            FailureKind::AuthenticationUnavailable
        );
        assert_eq!(
            GitOpsError::AlreadyExists(PathBuf::from("/r1")).failure_kind(),
            FailureKind::AlreadyExists
        );
        assert_eq!(
            GitOpsError::Git2(git2::Error::from_str("connection reset")).failure_kind(),
            FailureKind::Transport
        );
    }

    #[test]
    fn test_git2_auth_error_is_authentication() {
        let err = git2::Error::new(
            git2::ErrorCode::Auth,
            git2::ErrorClass::Ssh,
            "authentication required",
        );
        assert_eq!(
            GitOpsError::Git2(err).failure_kind(),
            FailureKind::AuthenticationUnavailable
        );
    }

    #[test]
    fn test_error_display() {
        let err = GitOpsError::RepositoryNotReady(PathBuf::from("/srv/r2"));
        assert_eq!(err.to_string(), "Repository not ready at /srv/r2");
        assert_eq!(FailureKind::Transport.to_string(), "transport");
    }
}
