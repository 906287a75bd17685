//! SSH identity agent binding
//!
//! The agent is an external process reached through a connect handshake.
//! At most one binding exists per process; it is swapped atomically on
//! connect/disconnect and read by operations as a snapshot.
//!
//! # Lifecycle
//!
//! - `bind()` starts a handshake in the background and returns immediately
//! - `on_connected(handle)` stores the new binding
//! - `on_disconnected()` drops it; operations that already captured the
//!   binding keep using it and fail normally if it stops answering
//!
//! # Example
//!
//! ```ignore
//! use gitopsd::agent::{CredentialAgentConnector, SshAgentConnector};
//! use std::sync::Arc;
//!
//! let connector = Arc::new(CredentialAgentConnector::new(
//!     Arc::new(SshAgentConnector::from_env()),
//!     tokio::runtime::Handle::current(),
//! ));
//! connector.bind();
//! if connector.wait_bound(std::time::Duration::from_secs(5)).await {
//!     println!("{:?}", connector.current_identities()?);
//! }
//! ```

#[cfg(unix)]
mod ssh_agent;

#[cfg(unix)]
pub use ssh_agent::{SshAgentConnector, SshAgentHandle};

use crate::{metrics, GitOpsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One identity offered by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Key algorithm, e.g. `ssh-ed25519`
    pub key_type: String,
    /// Public key in SSH wire format
    pub key_blob: Vec<u8>,
    /// `SHA256:...` as printed by `ssh-keygen -l`
    pub fingerprint: String,
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, self.fingerprint)
    }
}

/// A live connection to an agent
///
/// Called from transport workers, so queries block.
pub trait AgentHandle: Send + Sync + fmt::Debug {
    /// List the identities the agent can sign with
    ///
    /// Returns `AgentUnavailable` when the agent has gone away.
    fn identities(&self) -> Result<Vec<AgentIdentity>>;
}

/// Performs the connect handshake with an agent
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn AgentHandle>>;
}

/// Connector used when agent support is switched off
#[derive(Debug, Default)]
pub struct DisabledAgentConnector;

#[async_trait]
impl AgentConnector for DisabledAgentConnector {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn connect(&self) -> Result<Arc<dyn AgentHandle>> {
        Err(GitOpsError::AgentUnavailable(
            "SSH agent support is disabled".to_string(),
        ))
    }
}

/// The current binding to an agent
#[derive(Debug)]
pub struct AgentBinding {
    handle: Arc<dyn AgentHandle>,
    bound_at: DateTime<Utc>,
    generation: u64,
}

impl AgentBinding {
    pub fn identities(&self) -> Result<Vec<AgentIdentity>> {
        self.handle.identities()
    }

    pub fn bound_at(&self) -> DateTime<Utc> {
        self.bound_at
    }

    /// Increments with every successful bind
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Binding snapshot captured by one operation
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    binding: Option<Arc<AgentBinding>>,
}

impl AuthContext {
    /// A context with no agent
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Identities for authenticating a transfer
    ///
    /// Any problem reaching the agent is an authentication failure for the
    /// operation holding this snapshot.
    pub fn identities(&self) -> Result<Vec<AgentIdentity>> {
        let binding = self.binding.as_ref().ok_or_else(|| {
            GitOpsError::AuthenticationUnavailable("no SSH agent is bound".to_string())
        })?;
        binding
            .identities()
            .map_err(|e| GitOpsError::AuthenticationUnavailable(e.to_string()))
    }
}

/// Where the binding stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    /// A handshake is in flight
    Pending,
    Bound,
}

/// Handshake limit when none is configured
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide owner of the agent binding
///
/// The watch channel holding [`BindState`] is also the handshake guard:
/// every transition is a single `send_if_modified`/`send_replace`, so
/// "pending" is never observed apart from the state it belongs to.
pub struct CredentialAgentConnector {
    connector: Arc<dyn AgentConnector>,
    binding: RwLock<Option<Arc<AgentBinding>>>,
    generation: AtomicU64,
    state: watch::Sender<BindState>,
    bind_timeout: Duration,
    runtime: tokio::runtime::Handle,
}

impl CredentialAgentConnector {
    pub fn new(connector: Arc<dyn AgentConnector>, runtime: tokio::runtime::Handle) -> Self {
        let (state, _) = watch::channel(BindState::Unbound);
        Self {
            connector,
            binding: RwLock::new(None),
            generation: AtomicU64::new(0),
            state,
            bind_timeout: DEFAULT_BIND_TIMEOUT,
            runtime,
        }
    }

    /// Give up on a handshake that has not answered within `timeout`
    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout = timeout;
        self
    }

    pub fn bind_timeout(&self) -> Duration {
        self.bind_timeout
    }

    /// Start a handshake unless already bound or one is in flight
    ///
    /// Never waits for the handshake; callers that need the result use
    /// [`wait_bound`](Self::wait_bound).
    pub fn bind(self: &Arc<Self>) {
        let started = self.state.send_if_modified(|state| {
            let start = *state == BindState::Unbound;
            if start {
                *state = BindState::Pending;
            }
            start
        });
        if !started {
            debug!(state = ?self.state(), "SSH agent bound or handshake already pending");
            return;
        }

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let connected = match tokio::time::timeout(this.bind_timeout, this.connector.connect())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(GitOpsError::AgentUnavailable(format!(
                    "handshake did not finish within {:?}",
                    this.bind_timeout
                ))),
            };

            match connected {
                Ok(handle) => {
                    // Pending until the binding is stored, so no second handshake starts
                    let binding = this.on_connected(handle);
                    // Listing identities blocks on the agent socket
                    let listed = tokio::task::spawn_blocking(move || binding.identities()).await;
                    match listed {
                        Ok(Ok(identities)) => info!(
                            count = identities.len(),
                            identities = ?identities.iter().map(ToString::to_string).collect::<Vec<_>>(),
                            "SSH agent identities"
                        ),
                        Ok(Err(e)) => warn!(error = %e, "Bound SSH agent could not list identities"),
                        Err(e) => warn!(error = %e, "Identity listing task failed"),
                    }
                }
                Err(e) => {
                    warn!(
                        agent = this.connector.name(),
                        error = %e,
                        "SSH agent bind failed; authentication unavailable"
                    );
                    // Settling to Unbound is what allows the next bind()
                    this.state.send_if_modified(|state| {
                        let settle = *state == BindState::Pending;
                        if settle {
                            *state = BindState::Unbound;
                        }
                        settle
                    });
                }
            }
        });
        info!(agent = self.connector.name(), "Asked for SSH agent binding");
    }

    /// Store a freshly connected handle
    pub fn on_connected(&self, handle: Arc<dyn AgentHandle>) -> Arc<AgentBinding> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let binding = Arc::new(AgentBinding {
            handle,
            bound_at: Utc::now(),
            generation,
        });
        {
            let mut slot = self.binding.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(Arc::clone(&binding));
        }
        self.state.send_replace(BindState::Bound);
        metrics::set_agent_bound(true);
        info!(generation, "SSH agent bound");
        binding
    }

    /// Drop the binding; in-flight operations are left alone
    pub fn on_disconnected(&self) {
        let previous = {
            let mut slot = self.binding.write().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        self.state.send_replace(BindState::Unbound);
        metrics::set_agent_bound(false);
        match previous {
            Some(binding) => info!(
                generation = binding.generation,
                "SSH agent disconnected; losing binding"
            ),
            None => debug!("SSH agent disconnect with no binding"),
        }
    }

    /// Clear the binding only if it is still the given generation
    fn on_disconnected_generation(&self, generation: u64) {
        let current = self.binding().map(|b| b.generation);
        if current == Some(generation) {
            self.on_disconnected();
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding().is_some()
    }

    /// Current binding, possibly stale by the time it is used
    pub fn binding(&self) -> Option<Arc<AgentBinding>> {
        self.binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Capture the binding for one operation
    pub fn snapshot(&self) -> AuthContext {
        AuthContext {
            binding: self.binding(),
        }
    }

    /// Identities offered by the bound agent
    pub fn current_identities(&self) -> Result<Vec<AgentIdentity>> {
        let binding = self
            .binding()
            .ok_or_else(|| GitOpsError::AgentUnavailable("no SSH agent is bound".to_string()))?;

        match binding.identities() {
            Ok(identities) => Ok(identities),
            Err(GitOpsError::AgentUnavailable(msg)) => {
                // The agent went away without telling us
                self.on_disconnected_generation(binding.generation);
                Err(GitOpsError::AgentUnavailable(msg))
            }
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> BindState {
        *self.state.borrow()
    }

    /// Wait up to `timeout` for a binding; true if bound
    pub async fn wait_bound(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let bound = tokio::time::timeout(timeout, rx.wait_for(|s| *s == BindState::Bound)).await;
        matches!(bound, Ok(Ok(_)))
    }

    /// Wait up to `timeout` for an in-flight handshake to finish either way;
    /// true if bound afterwards
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| *s != BindState::Pending)).await;
        self.is_bound()
    }
}

impl fmt::Debug for CredentialAgentConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialAgentConnector")
            .field("agent", &self.connector.name())
            .field("bound", &self.is_bound())
            .field("state", &self.state())
            .finish()
    }
}
