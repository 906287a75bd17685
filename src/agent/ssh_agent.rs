//! OpenSSH agent client
//!
//! Lists identities through `russh_keys`' agent client. Signing itself is
//! done by libssh2 against the same socket.

use super::{AgentConnector, AgentHandle, AgentIdentity};
use crate::{GitOpsError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to the agent listening on a Unix socket
#[derive(Debug, Clone)]
pub struct SshAgentConnector {
    socket: Option<PathBuf>,
}

impl SshAgentConnector {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }

    /// Use the socket named by `SSH_AUTH_SOCK`
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from))
    }

    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }
}

#[async_trait]
impl AgentConnector for SshAgentConnector {
    fn name(&self) -> &str {
        "ssh-agent"
    }

    async fn connect(&self) -> Result<Arc<dyn AgentHandle>> {
        let socket = self.socket.clone().ok_or_else(|| {
            GitOpsError::AgentUnavailable("SSH_AUTH_SOCK is not set".to_string())
        })?;

        // One full round trip proves the peer really is an agent
        let identities = list_identities(&socket).await?;
        tracing::debug!(
            socket = %socket.display(),
            identities = identities.len(),
            "SSH agent handshake complete"
        );

        Ok(Arc::new(SshAgentHandle {
            socket,
            runtime: tokio::runtime::Handle::current(),
        }))
    }
}

/// Bound agent; every query opens a fresh connection
#[derive(Debug, Clone)]
pub struct SshAgentHandle {
    socket: PathBuf,
    runtime: tokio::runtime::Handle,
}

impl SshAgentHandle {
    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

impl AgentHandle for SshAgentHandle {
    /// Must be called off the async worker threads (transport workers and
    /// `spawn_blocking` tasks qualify)
    fn identities(&self) -> Result<Vec<AgentIdentity>> {
        self.runtime
            .block_on(tokio::time::timeout(
                QUERY_TIMEOUT,
                list_identities(&self.socket),
            ))
            .map_err(|_| {
                GitOpsError::AgentUnavailable(format!(
                    "{}: no answer within {:?}",
                    self.socket.display(),
                    QUERY_TIMEOUT
                ))
            })?
    }
}

async fn list_identities(socket: &Path) -> Result<Vec<AgentIdentity>> {
    let mut client = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| unavailable(socket, e))?;
    let keys = client
        .request_identities()
        .await
        .map_err(|e| unavailable(socket, e))?;
    Ok(keys.iter().map(identity_of).collect())
}

fn identity_of(key: &PublicKey) -> AgentIdentity {
    let key_blob = key.public_key_bytes();
    AgentIdentity {
        key_type: key.name().to_string(),
        fingerprint: fingerprint_of(&key_blob),
        key_blob,
    }
}

/// `SHA256:<base64>` as printed by `ssh-keygen -l`
fn fingerprint_of(key_blob: &[u8]) -> String {
    let hash = Sha256::digest(key_blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

fn unavailable(socket: &Path, error: impl std::fmt::Display) -> GitOpsError {
    GitOpsError::AgentUnavailable(format!("{}: {}", socket.display(), error))
}
