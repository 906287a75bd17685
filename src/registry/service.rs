//! Process-wide registry of repository contexts

use super::context::Services;
use super::{RepositoryObserver, RepositoryOperationContext};
use crate::agent::{AgentConnector, CredentialAgentConnector, DisabledAgentConnector};
use crate::config::{validate_config_result, AgentConfig, ServiceConfig};
use crate::git::{Git2Transport, RemoteUri, RepositoryHandle, RepositoryIdentity, Transport};
use crate::metrics;
use crate::notify::{NotificationSink, Notifier, OperationEvent};
use crate::operation::{Operation, OperationId};
use crate::{GitOpsError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Owns every repository context, the agent connector and the notifier
///
/// Contexts are created on first use and live as long as the registry.
pub struct OperationRegistry {
    contexts: Mutex<HashMap<RepositoryIdentity, Arc<RepositoryOperationContext>>>,
    services: Arc<Services>,
    config: ServiceConfig,
}

impl OperationRegistry {
    /// Create a registry on the current tokio runtime
    ///
    /// # Errors
    /// Fails when the config is invalid or no runtime is running.
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        agent_connector: Arc<dyn AgentConnector>,
    ) -> Result<Self> {
        validate_config_result(&config)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            GitOpsError::Config(format!("operation registry needs a tokio runtime: {}", e))
        })?;

        let agent = Arc::new(
            CredentialAgentConnector::new(agent_connector, runtime.clone())
                .with_bind_timeout(config.agent.bind_timeout()),
        );
        let notifier = Arc::new(Notifier::new(config.event_channel_capacity));

        info!(
            default_remote = %config.default_remote,
            agent_enabled = config.agent.enabled,
            "Operation registry ready"
        );

        Ok(Self {
            contexts: Mutex::new(HashMap::new()),
            services: Arc::new(Services {
                transport,
                agent,
                notifier,
                runtime,
            }),
            config,
        })
    }

    /// Registry using libgit2 and the agent the config points at
    pub fn with_defaults(config: ServiceConfig) -> Result<Self> {
        let transport = Arc::new(Git2Transport::new().with_bare(config.clone.bare));
        let connector = default_connector(&config.agent);
        Self::new(config, transport, connector)
    }

    /// The context for `identity`, creating it on first use
    ///
    /// Concurrent callers naming the same identity get the same context.
    /// Also asks for the agent binding if there is none yet.
    pub fn get_or_create(&self, identity: &RepositoryIdentity) -> Arc<RepositoryOperationContext> {
        let context = match self.get(identity) {
            Some(existing) => existing,
            None => self.create(identity),
        };
        if self.config.agent.enabled {
            self.services.agent.bind();
        }
        context
    }

    fn create(&self, identity: &RepositoryIdentity) -> Arc<RepositoryOperationContext> {
        // Probe the disk before taking the map lock
        let repository = match RepositoryHandle::discover_at(identity.path()) {
            Ok(repository) => repository,
            Err(e) => {
                warn!(repository = %identity, error = %e, "Could not open existing repository");
                None
            }
        };

        let mut created = false;
        let (context, count) = {
            let mut contexts = self.lock_contexts();
            let context = contexts
                .entry(identity.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(RepositoryOperationContext::new(
                        identity.clone(),
                        repository,
                        Arc::clone(&self.services),
                    ))
                })
                .clone();
            (context, contexts.len())
        };

        if created {
            metrics::set_contexts(count);
            debug!(
                repository = %identity,
                bound = context.repository().is_some(),
                "Created operation context"
            );
        }
        context
    }

    pub fn get(&self, identity: &RepositoryIdentity) -> Option<Arc<RepositoryOperationContext>> {
        self.lock_contexts().get(identity).cloned()
    }

    /// All contexts, ordered by identity
    pub fn contexts(&self) -> Vec<Arc<RepositoryOperationContext>> {
        let mut contexts: Vec<_> = self.lock_contexts().values().cloned().collect();
        contexts.sort_by(|a, b| a.identity().cmp(b.identity()));
        contexts
    }

    pub fn len(&self) -> usize {
        self.lock_contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contexts whose repository has a remote fetching from `uri`
    ///
    /// Repositories whose remote config cannot be read are skipped with a
    /// warning; unbound contexts are skipped silently.
    pub fn contexts_referencing_remote(&self, uri: &RemoteUri) -> Vec<Arc<RepositoryOperationContext>> {
        self.contexts()
            .into_iter()
            .filter(|context| {
                let Some(repository) = context.repository() else {
                    return false;
                };
                match repository.remotes() {
                    Ok(remotes) => remotes.iter().any(|remote| remote.references(uri)),
                    Err(e) => {
                        warn!(
                            repository = %context.identity(),
                            error = %e,
                            "Skipping repository with unreadable remote config"
                        );
                        false
                    }
                }
            })
            .collect()
    }

    /// Attach `observer` to the context for `identity`, replacing any previous one
    pub fn attach_observer(
        &self,
        identity: &RepositoryIdentity,
        observer: &Arc<dyn RepositoryObserver>,
    ) -> Arc<RepositoryOperationContext> {
        let context = self.get_or_create(identity);
        context.set_observer(observer);
        context
    }

    /// Queue `operation` on the context for `identity`
    pub fn submit(&self, identity: &RepositoryIdentity, operation: Operation) -> Result<OperationId> {
        self.get_or_create(identity).enqueue(operation)
    }

    pub fn connector(&self) -> &Arc<CredentialAgentConnector> {
        &self.services.agent
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.services.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.services.notifier.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.services.notifier.add_sink(sink);
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Resolve once every known context is idle
    pub async fn wait_all_idle(&self) {
        loop {
            let contexts = self.contexts();
            join_all(contexts.iter().map(|context| context.wait_idle())).await;

            // Work may have been queued while we waited
            if self.contexts().iter().all(|context| context.is_idle()) {
                return;
            }
        }
    }

    fn lock_contexts(
        &self,
    ) -> MutexGuard<'_, HashMap<RepositoryIdentity, Arc<RepositoryOperationContext>>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn default_connector(config: &AgentConfig) -> Arc<dyn AgentConnector> {
    #[cfg(unix)]
    {
        if config.enabled {
            return Arc::new(crate::agent::SshAgentConnector::new(config.socket_path()));
        }
    }
    #[cfg(not(unix))]
    let _ = config;

    Arc::new(DisabledAgentConnector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> OperationRegistry {
        let mut config = ServiceConfig::default();
        config.agent.enabled = false;
        OperationRegistry::new(
            config,
            Arc::new(Git2Transport::new()),
            Arc::new(DisabledAgentConnector),
        )
        .unwrap()
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = OperationRegistry::new(
            ServiceConfig::default(),
            Arc::new(Git2Transport::new()),
            Arc::new(DisabledAgentConnector),
        );
        assert!(matches!(result, Err(GitOpsError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ServiceConfig::default();
        config.event_channel_capacity = 0;
        let result = OperationRegistry::new(
            config,
            Arc::new(Git2Transport::new()),
            Arc::new(DisabledAgentConnector),
        );
        assert!(matches!(result, Err(GitOpsError::Config(_))));
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_context() {
        let temp = TempDir::new().unwrap();
        let registry = registry();

        let a = registry.get_or_create(&RepositoryIdentity::new(temp.path()).unwrap());
        let b = registry.get_or_create(&RepositoryIdentity::new(temp.path().join(".")).unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(a.repository().is_none());
    }

    #[tokio::test]
    async fn test_existing_repository_bound_on_creation() {
        let temp = TempDir::new().unwrap();
        git2::Repository::init(temp.path()).unwrap();
        let registry = registry();

        let context = registry.get_or_create(&RepositoryIdentity::new(temp.path()).unwrap());
        assert!(context.repository().is_some());
    }

    #[tokio::test]
    async fn test_wait_all_idle_with_no_contexts() {
        registry().wait_all_idle().await;
    }
}
