//! Operation notifications
//!
//! Every user-visible event (rejected request, operation start, progress,
//! outcome) goes through the `Notifier`, which logs it, fans it out to the
//! registered `NotificationSink`s and publishes it on a broadcast channel
//! for subscribers.

use crate::error::{panic_message, FailureKind};
use crate::git::{RepositoryIdentity, TransferProgress};
use crate::operation::{OperationFailure, OperationId, OperationKind, OperationSuccess};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Default event channel capacity (1000 events)
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDetail {
    /// A clone request carried an unparsable source URI
    InvalidUri { input: String, reason: String },

    /// A fetch request named a remote whose config could not be resolved
    InvalidRemoteConfiguration { remote: String, reason: String },

    /// An operation failed validation and was not queued
    RequestRejected {
        kind: OperationKind,
        failure: OperationFailure,
    },

    Started {
        operation_id: OperationId,
        kind: OperationKind,
        description: String,
    },

    Progress {
        operation_id: OperationId,
        kind: OperationKind,
        progress: TransferProgress,
    },

    Succeeded {
        operation_id: OperationId,
        kind: OperationKind,
        success: OperationSuccess,
        elapsed_ms: u64,
    },

    Failed {
        operation_id: OperationId,
        kind: OperationKind,
        failure: OperationFailure,
        elapsed_ms: u64,
    },
}

/// An event about one repository
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationEvent {
    pub at: DateTime<Utc>,
    pub repository: RepositoryIdentity,
    pub detail: EventDetail,
}

impl OperationEvent {
    pub fn new(repository: RepositoryIdentity, detail: EventDetail) -> Self {
        Self {
            at: Utc::now(),
            repository,
            detail,
        }
    }

    /// Operation this event belongs to, if it was queued
    pub fn operation_id(&self) -> Option<OperationId> {
        match &self.detail {
            EventDetail::Started { operation_id, .. }
            | EventDetail::Progress { operation_id, .. }
            | EventDetail::Succeeded { operation_id, .. }
            | EventDetail::Failed { operation_id, .. } => Some(*operation_id),
            EventDetail::InvalidUri { .. }
            | EventDetail::InvalidRemoteConfiguration { .. }
            | EventDetail::RequestRejected { .. } => None,
        }
    }

    /// True for rejections and failed operations
    pub fn is_failure(&self) -> bool {
        !matches!(
            self.detail,
            EventDetail::Started { .. }
                | EventDetail::Progress { .. }
                | EventDetail::Succeeded { .. }
        )
    }

    /// Failure classification, when this event reports one
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.detail {
            EventDetail::InvalidUri { .. } | EventDetail::InvalidRemoteConfiguration { .. } => {
                Some(FailureKind::RequestInvalid)
            }
            EventDetail::RequestRejected { failure, .. } | EventDetail::Failed { failure, .. } => {
                Some(failure.kind)
            }
            _ => None,
        }
    }
}

impl fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repo = &self.repository;
        match &self.detail {
            EventDetail::InvalidUri { input, reason } => {
                write!(f, "[{}] invalid uri '{}': {}", repo, input, reason)
            }
            EventDetail::InvalidRemoteConfiguration { remote, reason } => {
                write!(f, "[{}] bad config for remote '{}': {}", repo, remote, reason)
            }
            EventDetail::RequestRejected { kind, failure } => {
                write!(f, "[{}] {} rejected: {}", repo, kind, failure)
            }
            EventDetail::Started {
                operation_id,
                description,
                ..
            } => write!(f, "[{}] {} started: {}", repo, operation_id, description),
            EventDetail::Progress {
                operation_id,
                progress,
                ..
            } => write!(
                f,
                "[{}] {} {}% ({}/{} objects)",
                repo,
                operation_id,
                progress.percent(),
                progress.received_objects,
                progress.total_objects
            ),
            EventDetail::Succeeded {
                operation_id,
                success,
                elapsed_ms,
                ..
            } => write!(f, "[{}] {} {} in {}ms", repo, operation_id, success, elapsed_ms),
            EventDetail::Failed {
                operation_id,
                failure,
                elapsed_ms,
                ..
            } => write!(
                f,
                "[{}] {} failed after {}ms: {}",
                repo, operation_id, elapsed_ms, failure
            ),
        }
    }
}

/// Receives every reported event
pub trait NotificationSink: Send + Sync {
    fn report(&self, event: &OperationEvent);
}

/// Logs, fans out and broadcasts events
pub struct Notifier {
    sender: broadcast::Sender<OperationEvent>,
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl Notifier {
    /// `capacity` must be non-zero
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.push(sink);
    }

    /// Subscribe to events reported from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.sender.subscribe()
    }

    pub fn report(&self, event: OperationEvent) {
        log_event(&event);

        let sinks: Vec<_> = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        // One misbehaving sink must not starve the rest or the caller
        for sink in sinks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.report(&event))) {
                tracing::warn!(
                    repository = %event.repository,
                    panic = %panic_message(payload.as_ref()),
                    "Notification sink panicked"
                );
            }
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

fn log_event(event: &OperationEvent) {
    let repository = &event.repository;
    match &event.detail {
        EventDetail::InvalidUri { input, reason } => {
            tracing::warn!(%repository, input = %input, reason = %reason, "Invalid uri")
        }
        EventDetail::InvalidRemoteConfiguration { remote, reason } => {
            tracing::warn!(%repository, remote = %remote, reason = %reason, "Bad remote config")
        }
        EventDetail::RequestRejected { kind, failure } => {
            tracing::warn!(%repository, %kind, failure = %failure, "Operation rejected")
        }
        EventDetail::Started {
            operation_id,
            kind,
            description,
        } => tracing::info!(%repository, %operation_id, %kind, description = %description, "Operation started"),
        EventDetail::Progress {
            operation_id,
            progress,
            ..
        } => tracing::debug!(
            %repository,
            %operation_id,
            percent = progress.percent(),
            received = progress.received_objects,
            total = progress.total_objects,
            "Operation progress"
        ),
        EventDetail::Succeeded {
            operation_id,
            kind,
            success,
            elapsed_ms,
        } => tracing::info!(%repository, %operation_id, %kind, elapsed_ms, result = %success, "Operation succeeded"),
        EventDetail::Failed {
            operation_id,
            kind,
            failure,
            elapsed_ms,
        } => tracing::warn!(%repository, %operation_id, %kind, elapsed_ms, failure = %failure, "Operation failed"),
    }
}
