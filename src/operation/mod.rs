//! Operations: immutable descriptions of one clone or fetch
//!
//! The queue treats every operation the same way: validate before it is
//! queued, then `run` it and look at the `Outcome`. Variant-specific
//! preconditions live here.

mod outcome;

pub use outcome::{OperationFailure, OperationSuccess, Outcome};

use crate::git::{RemoteConfiguration, RemoteUri, TransferProgress};
use crate::registry::RepositoryOperationContext;
use crate::{GitOpsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, increasing operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Clone,
    Fetch,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Clone => "clone",
            OperationKind::Fetch => "fetch",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clone `source_uri` into `target_path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOperation {
    source_uri: RemoteUri,
    target_path: PathBuf,
}

impl CloneOperation {
    pub fn new(source_uri: RemoteUri, target_path: impl Into<PathBuf>) -> Self {
        Self {
            source_uri,
            target_path: target_path.into(),
        }
    }

    pub fn source_uri(&self) -> &RemoteUri {
        &self.source_uri
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    fn run(
        &self,
        context: &RepositoryOperationContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<OperationSuccess> {
        let target = self.target_path.as_path();
        if target_is_occupied(target)? {
            return Err(GitOpsError::AlreadyExists(target.to_path_buf()));
        }

        let auth = context.auth();
        let handle = context
            .transport()
            .clone_repository(&self.source_uri, target, &auth, progress)?;

        let git_dir = handle.git_dir().to_path_buf();
        context.bind_repository(handle);
        Ok(OperationSuccess::Cloned { git_dir })
    }
}

/// A clone target must be missing or an empty directory
fn target_is_occupied(target: &Path) -> Result<bool> {
    if crate::git::RepositoryHandle::discover_at(target)?.is_some() {
        return Ok(true);
    }
    if target.is_dir() {
        return Ok(std::fs::read_dir(target)?.next().is_some());
    }
    Ok(target.exists())
}

/// Which remote a fetch talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSelector {
    /// Configuration resolved when the request was accepted
    Resolved(RemoteConfiguration),
    /// Resolved from the repository config when the fetch starts; used when
    /// the repository is not materialized yet (a clone is still queued)
    Named(String),
}

/// Fetch one remote into an existing repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOperation {
    remote: RemoteSelector,
}

impl FetchOperation {
    pub fn new(remote: RemoteConfiguration) -> Self {
        Self {
            remote: RemoteSelector::Resolved(remote),
        }
    }

    /// Fetch the named remote, resolving it at run time
    pub fn named(remote: impl Into<String>) -> Self {
        Self {
            remote: RemoteSelector::Named(remote.into()),
        }
    }

    pub fn remote(&self) -> &RemoteSelector {
        &self.remote
    }

    fn remote_name(&self) -> &str {
        match &self.remote {
            RemoteSelector::Resolved(remote) => remote.name(),
            RemoteSelector::Named(name) => name,
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.remote {
            RemoteSelector::Resolved(remote) => remote.validate(),
            RemoteSelector::Named(name) if name.trim().is_empty() => Err(
                GitOpsError::RequestInvalid("remote name must not be empty".to_string()),
            ),
            RemoteSelector::Named(_) => Ok(()),
        }
    }

    fn run(
        &self,
        context: &RepositoryOperationContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<OperationSuccess> {
        let repository = context
            .repository()
            .ok_or_else(|| GitOpsError::RepositoryNotReady(context.identity().path().to_path_buf()))?;

        // Bad config fails here, before any network traffic
        let remote = match &self.remote {
            RemoteSelector::Resolved(remote) => remote.clone(),
            RemoteSelector::Named(name) => repository.remote(name)?,
        };
        remote.validate()?;

        let auth = context.auth();
        let summary = context
            .transport()
            .fetch(&repository, &remote, &auth, progress)?;

        Ok(OperationSuccess::Fetched {
            remote: remote.name().to_string(),
            updated_refs: summary.updated_refs,
        })
    }
}

/// One unit of work against a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Clone(CloneOperation),
    Fetch(FetchOperation),
}

impl Operation {
    pub fn clone_from(source_uri: RemoteUri, target_path: impl Into<PathBuf>) -> Self {
        Operation::Clone(CloneOperation::new(source_uri, target_path))
    }

    pub fn fetch(remote: RemoteConfiguration) -> Self {
        Operation::Fetch(FetchOperation::new(remote))
    }

    pub fn fetch_named(remote: impl Into<String>) -> Self {
        Operation::Fetch(FetchOperation::named(remote))
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Clone(_) => OperationKind::Clone,
            Operation::Fetch(_) => OperationKind::Fetch,
        }
    }

    /// Short human-readable summary
    pub fn describe(&self) -> String {
        match self {
            Operation::Clone(op) => format!(
                "clone {} into {}",
                op.source_uri,
                op.target_path.display()
            ),
            Operation::Fetch(op) => format!("fetch {}", op.remote_name()),
        }
    }

    /// Checks that must pass before the operation may be queued
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Clone(op) if op.target_path.as_os_str().is_empty() => Err(
                GitOpsError::RequestInvalid("clone target must not be empty".to_string()),
            ),
            Operation::Clone(_) => Ok(()),
            Operation::Fetch(op) => op.validate(),
        }
    }

    /// Perform the work against `context`, reporting transfer progress
    pub fn run(
        &self,
        context: &RepositoryOperationContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Outcome {
        let result = match self {
            Operation::Clone(op) => op.run(context, progress),
            Operation::Fetch(op) => op.run(context, progress),
        };
        Outcome::from(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_ids_increase() {
        let a = OperationId::next();
        let b = OperationId::next();
        assert!(b > a);
        assert_eq!(format!("{}", OperationId(7)), "op-7");
    }

    #[test]
    fn test_fetch_without_uri_fails_validation() {
        let op = Operation::fetch(RemoteConfiguration::new("origin"));
        assert!(matches!(op.validate(), Err(GitOpsError::RequestInvalid(_))));
        assert!(Operation::fetch_named("origin").validate().is_ok());
        assert!(Operation::fetch_named("  ").validate().is_err());
    }

    #[test]
    fn test_describe() {
        let uri = RemoteUri::parse("https://example/repo.git").unwrap();
        let clone = Operation::clone_from(uri.clone(), "/r1");
        assert_eq!(clone.kind(), OperationKind::Clone);
        assert_eq!(clone.describe(), "clone https://example/repo.git into /r1");

        let fetch = Operation::fetch(RemoteConfiguration::origin(uri));
        assert_eq!(fetch.kind(), OperationKind::Fetch);
        assert_eq!(fetch.describe(), "fetch origin");
    }

    #[test]
    fn test_target_occupancy() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(!target_is_occupied(&temp.path().join("fresh")).unwrap());
        assert!(!target_is_occupied(temp.path()).unwrap());

        std::fs::write(temp.path().join("leftover"), b"partial").unwrap();
        assert!(target_is_occupied(temp.path()).unwrap());
    }
}
