//! Clone/fetch transport
//!
//! The queue only needs to know that a transfer can be run, succeeds or
//! fails, and reports progress along the way. `Transport` is that seam;
//! `Git2Transport` is the libgit2-backed implementation.

use super::handle::RepositoryHandle;
use super::remote::{RemoteConfiguration, RemoteUri};
use crate::agent::AuthContext;
use crate::{GitOpsError, Result};
use git2::{Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, RemoteCallbacks};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::Path;

/// How many times the agent may be asked for a key before the remote is
/// considered to have rejected every identity
const MAX_AGENT_ATTEMPTS: u32 = 1;

/// Object transfer counters reported during clone/fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub received_objects: usize,
    pub total_objects: usize,
    pub indexed_objects: usize,
    pub received_bytes: usize,
}

impl TransferProgress {
    /// Whole-percent completion of the object download
    pub fn percent(&self) -> u8 {
        if self.total_objects == 0 {
            return 0;
        }
        ((self.received_objects.min(self.total_objects) * 100) / self.total_objects) as u8
    }
}

impl From<&git2::Progress<'_>> for TransferProgress {
    fn from(stats: &git2::Progress<'_>) -> Self {
        Self {
            received_objects: stats.received_objects(),
            total_objects: stats.total_objects(),
            indexed_objects: stats.indexed_objects(),
            received_bytes: stats.received_bytes(),
        }
    }
}

/// Result of a successful fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Remote-tracking refs that moved
    pub updated_refs: Vec<String>,
    pub received_objects: usize,
    pub received_bytes: usize,
}

/// Network side of clone and fetch
///
/// Implementations run on a blocking worker and may take as long as the
/// transfer takes. Authentication material comes only from `auth`.
pub trait Transport: Send + Sync {
    /// Clone `source` into `target`, returning the new repository
    fn clone_repository(
        &self,
        source: &RemoteUri,
        target: &Path,
        auth: &AuthContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<RepositoryHandle>;

    /// Fetch `remote` into `repository`, updating remote-tracking refs
    fn fetch(
        &self,
        repository: &RepositoryHandle,
        remote: &RemoteConfiguration,
        auth: &AuthContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<FetchSummary>;
}

/// libgit2 transport
#[derive(Debug, Clone, Default)]
pub struct Git2Transport {
    bare: bool,
}

impl Git2Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce bare clones
    pub fn with_bare(mut self, bare: bool) -> Self {
        self.bare = bare;
        self
    }

    /// Callbacks wiring credentials to the agent snapshot and progress to the caller
    ///
    /// Any authentication problem is stashed in `denial` so the resulting
    /// libgit2 error can be reported as an authentication failure.
    fn create_callbacks<'a>(
        auth: &'a AuthContext,
        denial: &'a RefCell<Option<GitOpsError>>,
        progress: &'a mut dyn FnMut(TransferProgress),
    ) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let mut agent_attempts = 0u32;

        callbacks.credentials(move |url, username_from_url, allowed_types| {
            tracing::debug!(url, ?allowed_types, "Git credentials callback invoked");
            let username = username_from_url.unwrap_or("git");

            if allowed_types.contains(CredentialType::USERNAME) {
                return Cred::username(username);
            }

            if allowed_types.contains(CredentialType::SSH_KEY) {
                agent_attempts += 1;
                if agent_attempts > MAX_AGENT_ATTEMPTS {
                    let message = format!("{} rejected every identity offered by the SSH agent", url);
                    denial.replace(Some(GitOpsError::AuthenticationUnavailable(message.clone())));
                    return Err(auth_error(&message));
                }

                // The snapshot may have gone stale; a failing handle is a
                // normal authentication failure, not a reason to wait
                match auth.identities() {
                    Ok(identities) if !identities.is_empty() => {
                        tracing::debug!(count = identities.len(), "Offering SSH agent identities");
                        return Cred::ssh_key_from_agent(username);
                    }
                    Ok(_) => {
                        let message = "SSH agent offers no identities".to_string();
                        denial.replace(Some(GitOpsError::AuthenticationUnavailable(message.clone())));
                        return Err(auth_error(&message));
                    }
                    Err(e) => {
                        let message = e.to_string();
                        denial.replace(Some(e));
                        return Err(auth_error(&message));
                    }
                }
            }

            if allowed_types.contains(CredentialType::DEFAULT) {
                return Cred::default();
            }

            let message = format!("{} requires credentials the SSH agent cannot provide", url);
            denial.replace(Some(GitOpsError::AuthenticationUnavailable(message.clone())));
            Err(auth_error(&message))
        });

        callbacks.transfer_progress(move |stats| {
            progress(TransferProgress::from(&stats));
            true
        });

        callbacks
    }
}

fn auth_error(message: &str) -> git2::Error {
    git2::Error::new(ErrorCode::Auth, ErrorClass::Ssh, message)
}

/// Map a libgit2 failure, preferring an authentication problem recorded by the callbacks
fn classify(error: git2::Error, denial: &RefCell<Option<GitOpsError>>) -> GitOpsError {
    match denial.borrow_mut().take() {
        Some(GitOpsError::AuthenticationUnavailable(msg)) => {
            GitOpsError::AuthenticationUnavailable(msg)
        }
        Some(other) => GitOpsError::AuthenticationUnavailable(other.to_string()),
        None if error.code() == ErrorCode::Auth => {
            GitOpsError::AuthenticationUnavailable(error.message().to_string())
        }
        None => GitOpsError::Transport(error.message().to_string()),
    }
}

impl Transport for Git2Transport {
    fn clone_repository(
        &self,
        source: &RemoteUri,
        target: &Path,
        auth: &AuthContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<RepositoryHandle> {
        tracing::info!(
            url = %source,
            path = %target.display(),
            bare = self.bare,
            "Cloning repository"
        );

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let denial = RefCell::new(None);
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(Self::create_callbacks(auth, &denial, progress));

        let mut builder = git2::build::RepoBuilder::new();
        builder.bare(self.bare).fetch_options(fetch_options);

        let repo = builder
            .clone(&source.to_private_string(), target)
            .map_err(|e| classify(e, &denial))?;

        tracing::info!(path = %target.display(), "Repository cloned successfully");
        Ok(RepositoryHandle::from_repository(&repo))
    }

    fn fetch(
        &self,
        repository: &RepositoryHandle,
        remote: &RemoteConfiguration,
        auth: &AuthContext,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<FetchSummary> {
        remote.validate()?;
        let uri = &remote.uris()[0];
        let refspecs = remote.effective_fetch_refspecs();

        tracing::debug!(
            repository = %repository.git_dir().display(),
            remote = remote.name(),
            url = %uri,
            "Fetching updates from remote"
        );

        let repo = repository.open_repository()?;
        // Anonymous remote: the configuration captured at enqueue time is
        // what gets fetched, even if the on-disk config changed since
        let mut git_remote = repo.remote_anonymous(&uri.to_private_string())?;

        let denial = RefCell::new(None);
        let updated = RefCell::new(Vec::new());
        let result = {
            let mut callbacks = Self::create_callbacks(auth, &denial, progress);
            callbacks.update_tips(|refname, _old, _new| {
                updated.borrow_mut().push(refname.to_string());
                true
            });
            let mut fetch_options = FetchOptions::new();
            fetch_options.remote_callbacks(callbacks);

            let reflog = format!("fetch: {}", remote.name());
            git_remote.fetch(refspecs.as_slice(), Some(&mut fetch_options), Some(&reflog))
        };
        result.map_err(|e| classify(e, &denial))?;

        let stats = git_remote.stats();
        let summary = FetchSummary {
            updated_refs: updated.into_inner(),
            received_objects: stats.received_objects(),
            received_bytes: stats.received_bytes(),
        };

        tracing::debug!(
            remote = remote.name(),
            updated = summary.updated_refs.len(),
            "Fetch completed successfully"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let mut progress = TransferProgress::default();
        assert_eq!(progress.percent(), 0);

        progress.total_objects = 200;
        progress.received_objects = 50;
        assert_eq!(progress.percent(), 25);

        progress.received_objects = 200;
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_classify_prefers_recorded_denial() {
        let denial = RefCell::new(Some(GitOpsError::AgentUnavailable(
            "no SSH agent is bound".to_string(),
        )));
        let err = classify(git2::Error::from_str("callback error"), &denial);
        assert!(matches!(err, GitOpsError::AuthenticationUnavailable(_)));
        assert!(denial.borrow().is_none());
    }

    #[test]
    fn test_classify_transport_error() {
        let denial = RefCell::new(None);
        let err = classify(git2::Error::from_str("connection reset by peer"), &denial);
        assert!(matches!(err, GitOpsError::Transport(ref m) if m.contains("connection reset")));
    }
}
