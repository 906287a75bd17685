//! Inbound request decoding
//!
//! Turns `OperationRequest`s (from the CLI or a YAML batch file) into queued
//! operations. Requests that cannot become an operation are reported as
//! events and never reach a queue.

use crate::git::{RemoteUri, RepositoryIdentity};
use crate::notify::{EventDetail, OperationEvent};
use crate::operation::{Operation, OperationId};
use crate::registry::OperationRegistry;
use crate::{GitOpsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Requested action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[serde(alias = "git.CLONE", alias = "clone")]
    Clone,
    #[serde(alias = "git.FETCH", alias = "fetch")]
    Fetch,
}

impl FromStr for Action {
    type Err = GitOpsError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        let name = name.strip_prefix("git.").unwrap_or(name);
        match name.to_ascii_uppercase().as_str() {
            "CLONE" => Ok(Action::Clone),
            "FETCH" => Ok(Action::Fetch),
            _ => Err(GitOpsError::RequestInvalid(format!("Unknown action: {}", s))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Clone => f.write_str("CLONE"),
            Action::Fetch => f.write_str("FETCH"),
        }
    }
}

/// One clone or fetch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub action: Action,

    /// Repository directory (the clone target for CLONE)
    #[serde(alias = "repositoryPath", alias = "gitdir")]
    pub repository_path: PathBuf,

    /// Required for CLONE
    #[serde(
        default,
        alias = "sourceURI",
        alias = "source-uri",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_uri: Option<String>,

    /// FETCH remote; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl OperationRequest {
    pub fn clone_request(source_uri: impl Into<String>, repository_path: impl Into<PathBuf>) -> Self {
        Self {
            action: Action::Clone,
            repository_path: repository_path.into(),
            source_uri: Some(source_uri.into()),
            remote: None,
        }
    }

    pub fn fetch_request(repository_path: impl Into<PathBuf>, remote: Option<String>) -> Self {
        Self {
            action: Action::Fetch,
            repository_path: repository_path.into(),
            source_uri: None,
            remote,
        }
    }
}

/// Parse a YAML list of requests
pub fn load_requests(yaml: &str) -> Result<Vec<OperationRequest>> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Read and parse a YAML request file
pub fn load_requests_file(path: impl AsRef<Path>) -> Result<Vec<OperationRequest>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    load_requests(&content)
}

/// Routes requests to repository contexts
pub struct RequestDispatcher {
    registry: Arc<OperationRegistry>,
}

impl RequestDispatcher {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Decode `request` and queue the resulting operation
    ///
    /// A FETCH against a repository that is already bound resolves its
    /// remote now; otherwise (a clone is still queued) the remote is looked
    /// up when the fetch starts.
    pub fn dispatch(&self, request: &OperationRequest) -> Result<OperationId> {
        let identity = RepositoryIdentity::new(&request.repository_path)?;
        let context = self.registry.get_or_create(&identity);
        debug!(repository = %identity, action = %request.action, "Dispatching request");

        let operation = match request.action {
            Action::Clone => {
                let input = request.source_uri.as_deref().unwrap_or_default();
                match RemoteUri::parse(input) {
                    Ok(uri) => Operation::clone_from(uri, identity.path()),
                    Err(e) => {
                        self.report(
                            &identity,
                            EventDetail::InvalidUri {
                                input: input.to_string(),
                                reason: e.to_string(),
                            },
                        );
                        return Err(e);
                    }
                }
            }
            Action::Fetch => {
                let name = request
                    .remote
                    .clone()
                    .unwrap_or_else(|| self.registry.config().default_remote.clone());
                match context.repository() {
                    Some(repository) => match repository.remote(&name) {
                        Ok(remote) => Operation::fetch(remote),
                        Err(e) => {
                            self.report(
                                &identity,
                                EventDetail::InvalidRemoteConfiguration {
                                    remote: name,
                                    reason: e.to_string(),
                                },
                            );
                            return Err(e);
                        }
                    },
                    None => Operation::fetch_named(name),
                }
            }
        };

        context.enqueue(operation)
    }

    /// Dispatch every request, keeping going past failures
    pub fn dispatch_all(&self, requests: &[OperationRequest]) -> Vec<Result<OperationId>> {
        requests.iter().map(|request| self.dispatch(request)).collect()
    }

    fn report(&self, identity: &RepositoryIdentity, detail: EventDetail) {
        self.registry
            .notifier()
            .report(OperationEvent::new(identity.clone(), detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DisabledAgentConnector;
    use crate::config::ServiceConfig;
    use crate::git::Git2Transport;
    use tempfile::TempDir;

    fn dispatcher() -> RequestDispatcher {
        let mut config = ServiceConfig::default();
        config.agent.enabled = false;
        let registry = OperationRegistry::new(
            config,
            Arc::new(Git2Transport::new()),
            Arc::new(DisabledAgentConnector),
        )
        .unwrap();
        RequestDispatcher::new(Arc::new(registry))
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!("git.CLONE".parse::<Action>().unwrap(), Action::Clone);
        assert_eq!("fetch".parse::<Action>().unwrap(), Action::Fetch);
        assert!("git.PUSH".parse::<Action>().is_err());
    }

    #[test]
    fn test_load_requests() {
        let yaml = r#"
- action: CLONE
  repository_path: /tmp/r1
  source_uri: git@example.com:org/r1.git
- action: git.FETCH
  repositoryPath: /tmp/r1
  remote: upstream
"#;
        let requests = load_requests(yaml).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0],
            OperationRequest::clone_request("git@example.com:org/r1.git", "/tmp/r1")
        );
        assert_eq!(requests[1].action, Action::Fetch);
        assert_eq!(requests[1].remote.as_deref(), Some("upstream"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let yaml = "- action: PUSH\n  repository_path: /tmp/r1\n";
        assert!(load_requests(yaml).is_err());
    }

    #[tokio::test]
    async fn test_invalid_clone_uri_reported_not_queued() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher();
        let mut events = dispatcher.registry().subscribe();

        let request = OperationRequest::clone_request("ftp://", temp.path().join("r1"));
        assert!(dispatcher.dispatch(&request).is_err());

        let event = events.recv().await.unwrap();
        assert!(matches!(event.detail, EventDetail::InvalidUri { .. }));
        let context = dispatcher
            .registry()
            .get(&RepositoryIdentity::new(temp.path().join("r1")).unwrap())
            .unwrap();
        assert!(context.is_idle());
        assert_eq!(context.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_fetch_unknown_remote_reported() {
        let temp = TempDir::new().unwrap();
        git2::Repository::init(temp.path()).unwrap();
        let dispatcher = dispatcher();
        let mut events = dispatcher.registry().subscribe();

        let request = OperationRequest::fetch_request(temp.path(), None);
        assert!(matches!(
            dispatcher.dispatch(&request),
            Err(GitOpsError::RequestInvalid(_))
        ));

        let event = events.recv().await.unwrap();
        match event.detail {
            EventDetail::InvalidRemoteConfiguration { remote, .. } => assert_eq!(remote, "origin"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
