//! Operation outcomes

use crate::error::FailureKind;
use crate::GitOpsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// What a successful operation produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationSuccess {
    Cloned {
        /// The new repository's git directory
        git_dir: PathBuf,
    },
    Fetched {
        remote: String,
        updated_refs: Vec<String>,
    },
}

impl fmt::Display for OperationSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationSuccess::Cloned { git_dir } => write!(f, "cloned into {}", git_dir.display()),
            OperationSuccess::Fetched {
                remote,
                updated_refs,
            } if updated_refs.is_empty() => write!(f, "fetched {}, already up to date", remote),
            OperationSuccess::Fetched {
                remote,
                updated_refs,
            } => write!(f, "fetched {}, {} refs updated", remote, updated_refs.len()),
        }
    }
}

/// Why an operation failed; cloneable so it can travel in events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl OperationFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&GitOpsError> for OperationFailure {
    fn from(error: &GitOpsError) -> Self {
        Self::new(error.failure_kind(), error.to_string())
    }
}

impl From<GitOpsError> for OperationFailure {
    fn from(error: GitOpsError) -> Self {
        Self::from(&error)
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Final result of running one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success(OperationSuccess),
    Failure(OperationFailure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn failure(&self) -> Option<&OperationFailure> {
        match self {
            Outcome::Failure(failure) => Some(failure),
            Outcome::Success(_) => None,
        }
    }

    /// Label used in logs and metrics
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "succeeded",
            Outcome::Failure(_) => "failed",
        }
    }
}

impl From<crate::Result<OperationSuccess>> for Outcome {
    fn from(result: crate::Result<OperationSuccess>) -> Self {
        match result {
            Ok(success) => Outcome::Success(success),
            Err(e) => Outcome::Failure(OperationFailure::from(&e)),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(success) => write!(f, "{}", success),
            Outcome::Failure(failure) => write!(f, "failed ({})", failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_result() {
        let ok: Outcome = Ok(OperationSuccess::Fetched {
            remote: "origin".to_string(),
            updated_refs: vec!["refs/remotes/origin/main".to_string()],
        })
        .into();
        assert!(ok.is_success());
        assert_eq!(ok.to_string(), "fetched origin, 1 refs updated");

        let failed: Outcome = Err(GitOpsError::AlreadyExists(PathBuf::from("/r1"))).into();
        assert_eq!(failed.failure().unwrap().kind, FailureKind::AlreadyExists);
        assert_eq!(failed.status(), "failed");
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = Outcome::Failure(OperationFailure::new(
            FailureKind::Transport,
            "connection reset",
        ));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"failure\""));
        assert!(json.contains("\"transport\""));
    }
}
