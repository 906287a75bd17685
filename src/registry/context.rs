//! Per-repository operation context
//!
//! One context exists per repository identity. It owns the repository handle
//! slot and a FIFO queue of operations, and drains that queue on a single
//! blocking worker so that no two operations ever run against the same
//! repository at once.
//!
//! # State machine
//!
//! ```text
//!            enqueue (idle)
//!   Idle ───────────────────▶ Running{op}
//!    ▲                           │  │ outcome, queue non-empty
//!    │ outcome, queue empty      │  └──────▶ Running{next}
//!    └───────────────────────────┘
//! ```
//!
//! Queue pops and state transitions happen under the context lock; the
//! operation body runs without it.

use super::RepositoryObserver;
use crate::agent::{AuthContext, CredentialAgentConnector};
use crate::error::{panic_message, FailureKind};
use crate::git::{RepositoryHandle, RepositoryIdentity, TransferProgress, Transport};
use crate::metrics;
use crate::notify::{EventDetail, Notifier, OperationEvent};
use crate::operation::{Operation, OperationFailure, OperationId, OperationKind, Outcome};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Shared collaborators every context needs
pub(crate) struct Services {
    pub transport: Arc<dyn Transport>,
    pub agent: Arc<CredentialAgentConnector>,
    pub notifier: Arc<Notifier>,
    pub runtime: tokio::runtime::Handle,
}

/// Whether the context is currently running something
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContextStatus {
    Idle,
    Running {
        operation_id: OperationId,
        kind: OperationKind,
    },
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextStatus::Idle => f.write_str("idle"),
            ContextStatus::Running { operation_id, kind } => {
                write!(f, "running {} ({})", operation_id, kind)
            }
        }
    }
}

/// The most recent finished operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastOutcome {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
}

/// Point-in-time view of a context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSnapshot {
    pub identity: RepositoryIdentity,
    pub repository: Option<RepositoryHandle>,
    pub status: ContextStatus,
    /// Operations waiting behind the running one
    pub queue_depth: usize,
    pub last_outcome: Option<LastOutcome>,
}

struct QueuedOperation {
    id: OperationId,
    operation: Operation,
    queued_at: Instant,
}

struct ContextState {
    repository: Option<RepositoryHandle>,
    queue: VecDeque<QueuedOperation>,
    active: Option<(OperationId, OperationKind)>,
    observer: Option<Weak<dyn RepositoryObserver>>,
    last_outcome: Option<LastOutcome>,
}

impl ContextState {
    fn status(&self) -> ContextStatus {
        match self.active {
            Some((operation_id, kind)) => ContextStatus::Running { operation_id, kind },
            None => ContextStatus::Idle,
        }
    }
}

/// Serialized operation queue for one repository
pub struct RepositoryOperationContext {
    identity: RepositoryIdentity,
    state: Mutex<ContextState>,
    status: watch::Sender<ContextStatus>,
    services: Arc<Services>,
}

impl RepositoryOperationContext {
    pub(crate) fn new(
        identity: RepositoryIdentity,
        repository: Option<RepositoryHandle>,
        services: Arc<Services>,
    ) -> Self {
        let (status, _) = watch::channel(ContextStatus::Idle);
        Self {
            identity,
            state: Mutex::new(ContextState {
                repository,
                queue: VecDeque::new(),
                active: None,
                observer: None,
                last_outcome: None,
            }),
            status,
            services,
        }
    }

    pub fn identity(&self) -> &RepositoryIdentity {
        &self.identity
    }

    /// The bound repository; `None` until a clone completes
    pub fn repository(&self) -> Option<RepositoryHandle> {
        self.lock_state().repository.clone()
    }

    /// Queue an operation behind any already waiting
    ///
    /// Invalid operations are reported and returned as errors; the queue is
    /// left as it was.
    pub fn enqueue(self: &Arc<Self>, operation: Operation) -> Result<OperationId> {
        let kind = operation.kind();
        if let Err(e) = operation.validate() {
            metrics::record_operation(kind.as_str(), "rejected");
            self.report(EventDetail::RequestRejected {
                kind,
                failure: OperationFailure::from(&e),
            });
            return Err(e);
        }

        let id = OperationId::next();
        let queued = QueuedOperation {
            id,
            operation,
            queued_at: Instant::now(),
        };

        let first = {
            let mut state = self.lock_state();
            let first = if state.active.is_none() {
                state.active = Some((id, kind));
                self.status.send_replace(state.status());
                Some(queued)
            } else {
                state.queue.push_back(queued);
                None
            };
            metrics::set_queue_depth(&self.identity.to_string(), state.queue.len());
            first
        };

        match first {
            Some(queued) => {
                debug!(repository = %self.identity, operation_id = %id, %kind, "Starting worker");
                let this = Arc::clone(self);
                self.services
                    .runtime
                    .spawn_blocking(move || this.drain(queued));
            }
            None => debug!(repository = %self.identity, operation_id = %id, %kind, "Queued behind running operation"),
        }
        Ok(id)
    }

    /// Worker loop: run, record, take the next one, until the queue is empty
    fn drain(self: Arc<Self>, first: QueuedOperation) {
        let mut next = Some(first);
        while let Some(queued) = next {
            let id = queued.id;
            let kind = queued.operation.kind();
            let outcome = self.execute(queued);
            next = self.finish(id, kind, outcome);
        }
        trace!(repository = %self.identity, "Worker exiting");
    }

    fn execute(&self, queued: QueuedOperation) -> Outcome {
        let id = queued.id;
        let kind = queued.operation.kind();
        trace!(
            repository = %self.identity,
            operation_id = %id,
            waited_ms = queued.queued_at.elapsed().as_millis() as u64,
            "Operation dequeued"
        );
        self.report(EventDetail::Started {
            operation_id: id,
            kind,
            description: queued.operation.describe(),
        });

        let started = Instant::now();
        let mut last_percent: Option<u8> = None;
        let mut progress = |transfer: TransferProgress| {
            let percent = transfer.percent();
            if last_percent.map_or(true, |last| percent > last) {
                last_percent = Some(percent);
                self.report(EventDetail::Progress {
                    operation_id: id,
                    kind,
                    progress: transfer,
                });
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            queued.operation.run(self, &mut progress)
        }))
        .unwrap_or_else(|payload| {
            Outcome::Failure(OperationFailure::new(
                FailureKind::Internal,
                format!("operation panicked: {}", panic_message(payload.as_ref())),
            ))
        });

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        metrics::record_operation(kind.as_str(), outcome.status());
        metrics::record_duration(kind.as_str(), elapsed.as_secs_f64());

        let detail = match &outcome {
            Outcome::Success(success) => EventDetail::Succeeded {
                operation_id: id,
                kind,
                success: success.clone(),
                elapsed_ms,
            },
            Outcome::Failure(failure) => EventDetail::Failed {
                operation_id: id,
                kind,
                failure: failure.clone(),
                elapsed_ms,
            },
        };
        self.report(detail);
        outcome
    }

    /// Record an outcome and move to the next queued operation, if any
    fn finish(
        &self,
        id: OperationId,
        kind: OperationKind,
        outcome: Outcome,
    ) -> Option<QueuedOperation> {
        let observer = {
            let mut state = self.lock_state();
            state.last_outcome = Some(LastOutcome {
                operation_id: id,
                kind,
                outcome,
                finished_at: Utc::now(),
            });
            state.observer.as_ref().and_then(Weak::upgrade)
        };

        // Before the transition, so waiters see the observer already notified.
        // A panicking observer must not keep the context Running.
        if let Some(observer) = observer {
            trace!(repository = %self.identity, observer = %observer.label(), "Notifying observer");
            let snapshot = self.snapshot();
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| observer.outcome_recorded(&snapshot)))
            {
                warn!(
                    repository = %self.identity,
                    observer = %observer.label(),
                    panic = %panic_message(payload.as_ref()),
                    "Observer panicked"
                );
            }
        }

        let mut state = self.lock_state();
        let next = state.queue.pop_front();
        state.active = next.as_ref().map(|q| (q.id, q.operation.kind()));
        self.status.send_replace(state.status());
        metrics::set_queue_depth(&self.identity.to_string(), state.queue.len());
        next
    }

    fn report(&self, detail: EventDetail) {
        self.services
            .notifier
            .report(OperationEvent::new(self.identity.clone(), detail));
    }

    /// Attach `observer`, replacing any previous one
    pub fn set_observer(&self, observer: &Arc<dyn RepositoryObserver>) {
        debug!(repository = %self.identity, observer = %observer.label(), "Observer attached");
        self.lock_state().observer = Some(Arc::downgrade(observer));
    }

    pub fn clear_observer(&self) {
        self.lock_state().observer = None;
    }

    /// The attached observer, if it is still alive
    pub fn observer(&self) -> Option<Arc<dyn RepositoryObserver>> {
        self.lock_state().observer.as_ref().and_then(Weak::upgrade)
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.lock_state();
        ContextSnapshot {
            identity: self.identity.clone(),
            repository: state.repository.clone(),
            status: state.status(),
            queue_depth: state.queue.len(),
            last_outcome: state.last_outcome.clone(),
        }
    }

    /// Operations waiting behind the running one
    pub fn queue_depth(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.lock_state().active.is_none()
    }

    pub fn status(&self) -> ContextStatus {
        *self.status.borrow()
    }

    pub fn last_outcome(&self) -> Option<LastOutcome> {
        self.lock_state().last_outcome.clone()
    }

    /// Resolve once the queue has drained
    pub async fn wait_idle(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|status| *status == ContextStatus::Idle).await;
    }

    // Called by operations while they run

    pub(crate) fn auth(&self) -> AuthContext {
        self.services.agent.snapshot()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.services.transport.as_ref()
    }

    pub(crate) fn bind_repository(&self, handle: RepositoryHandle) {
        debug!(
            repository = %self.identity,
            git_dir = %handle.git_dir().display(),
            "Repository bound"
        );
        self.lock_state().repository = Some(handle);
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        // State stays consistent across a panic; operation bodies never hold it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for RepositoryOperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("RepositoryOperationContext")
            .field("identity", &self.identity)
            .field("status", &state.status())
            .field("queue_depth", &state.queue.len())
            .field("bound", &state.repository.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DisabledAgentConnector;
    use crate::git::{FetchSummary, RemoteConfiguration, RemoteUri};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records the order operations ran in and checks nothing overlaps
    #[derive(Default)]
    struct SequenceTransport {
        running: AtomicUsize,
        overlapped: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl SequenceTransport {
        fn step(&self, label: String) {
            if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(10));
            self.order.lock().unwrap().push(label);
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Transport for SequenceTransport {
        fn clone_repository(
            &self,
            source: &RemoteUri,
            target: &Path,
            _auth: &AuthContext,
            progress: &mut dyn FnMut(TransferProgress),
        ) -> Result<RepositoryHandle> {
            for received in [0, 5, 5, 10] {
                progress(TransferProgress {
                    received_objects: received,
                    total_objects: 10,
                    ..Default::default()
                });
            }
            self.step(format!("clone {}", source));
            let repo = git2::Repository::init(target)?;
            Ok(RepositoryHandle::from_repository(&repo))
        }

        fn fetch(
            &self,
            _repository: &RepositoryHandle,
            remote: &RemoteConfiguration,
            _auth: &AuthContext,
            _progress: &mut dyn FnMut(TransferProgress),
        ) -> Result<FetchSummary> {
            if remote.name() == "explode" {
                panic!("transport blew up");
            }
            self.step(format!("fetch {}", remote.name()));
            Ok(FetchSummary::default())
        }
    }

    fn services(transport: Arc<dyn Transport>) -> Arc<Services> {
        let runtime = tokio::runtime::Handle::current();
        Arc::new(Services {
            transport,
            agent: Arc::new(CredentialAgentConnector::new(
                Arc::new(DisabledAgentConnector),
                runtime.clone(),
            )),
            notifier: Arc::new(Notifier::default()),
            runtime,
        })
    }

    fn remote(name: &str) -> RemoteConfiguration {
        RemoteConfiguration::new(name).with_uri(RemoteUri::parse("https://example/r.git").unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_runs_in_order_without_overlap() {
        let temp = tempfile::TempDir::new().unwrap();
        let target = temp.path().join("repo");
        let transport = Arc::new(SequenceTransport::default());
        let context = Arc::new(RepositoryOperationContext::new(
            RepositoryIdentity::new(&target).unwrap(),
            None,
            services(transport.clone()),
        ));

        let uri = RemoteUri::parse("https://example/r.git").unwrap();
        let first = context
            .enqueue(Operation::clone_from(uri, &target))
            .unwrap();
        let second = context.enqueue(Operation::fetch(remote("a"))).unwrap();
        let third = context.enqueue(Operation::fetch(remote("b"))).unwrap();
        assert!(first < second && second < third);

        context.wait_idle().await;
        assert!(context.is_idle());
        assert_eq!(
            *transport.order.lock().unwrap(),
            vec!["clone https://example/r.git", "fetch a", "fetch b"]
        );
        assert_eq!(transport.overlapped.load(Ordering::SeqCst), 0);

        let snapshot = context.snapshot();
        assert!(snapshot.repository.is_some());
        assert_eq!(snapshot.status, ContextStatus::Idle);
        assert_eq!(snapshot.last_outcome.unwrap().operation_id, third);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_operation_never_queued() {
        let temp = tempfile::TempDir::new().unwrap();
        let services = services(Arc::new(SequenceTransport::default()));
        let mut events = services.notifier.subscribe();
        let context = Arc::new(RepositoryOperationContext::new(
            RepositoryIdentity::new(temp.path()).unwrap(),
            None,
            services,
        ));

        let result = context.enqueue(Operation::fetch(RemoteConfiguration::new("origin")));
        assert!(result.is_err());
        assert_eq!(context.queue_depth(), 0);
        assert!(context.is_idle());

        let event = events.recv().await.unwrap();
        assert!(matches!(event.detail, EventDetail::RequestRejected { .. }));
        assert_eq!(event.failure_kind(), Some(FailureKind::RequestInvalid));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_operation_does_not_wedge_context() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = git2::Repository::init(temp.path()).unwrap();
        let context = Arc::new(RepositoryOperationContext::new(
            RepositoryIdentity::new(temp.path()).unwrap(),
            Some(RepositoryHandle::from_repository(&repo)),
            services(Arc::new(SequenceTransport::default())),
        ));

        context.enqueue(Operation::fetch(remote("explode"))).unwrap();
        let after = context.enqueue(Operation::fetch(remote("origin"))).unwrap();
        context.wait_idle().await;

        let last = context.last_outcome().unwrap();
        assert_eq!(last.operation_id, after);
        assert!(last.outcome.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_reported_when_percent_advances() {
        let temp = tempfile::TempDir::new().unwrap();
        let target = temp.path().join("repo");
        let services = services(Arc::new(SequenceTransport::default()));
        let mut events = services.notifier.subscribe();
        let context = Arc::new(RepositoryOperationContext::new(
            RepositoryIdentity::new(&target).unwrap(),
            None,
            services,
        ));

        let uri = RemoteUri::parse("https://example/r.git").unwrap();
        context.enqueue(Operation::clone_from(uri, &target)).unwrap();
        context.wait_idle().await;

        let mut percents = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventDetail::Progress { progress, .. } = event.detail {
                percents.push(progress.percent());
            }
        }
        // 0, 50, 100; the repeated 50% is dropped
        assert_eq!(percents, vec![0, 50, 100]);
    }

    struct Counting {
        seen: AtomicUsize,
    }

    impl RepositoryObserver for Counting {
        fn outcome_recorded(&self, _snapshot: &ContextSnapshot) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_observer_is_held_weakly() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = git2::Repository::init(temp.path()).unwrap();
        let context = Arc::new(RepositoryOperationContext::new(
            RepositoryIdentity::new(temp.path()).unwrap(),
            Some(RepositoryHandle::from_repository(&repo)),
            services(Arc::new(SequenceTransport::default())),
        ));

        let counting = Arc::new(Counting {
            seen: AtomicUsize::new(0),
        });
        let observer: Arc<dyn RepositoryObserver> = counting.clone();
        context.set_observer(&observer);
        assert!(context.observer().is_some());

        context.enqueue(Operation::fetch(remote("origin"))).unwrap();
        context.wait_idle().await;
        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);

        drop(observer);
        drop(counting);
        assert!(context.observer().is_none());

        // No observer: outcomes are still recorded
        context.enqueue(Operation::fetch(remote("origin"))).unwrap();
        context.wait_idle().await;
        assert!(context.last_outcome().unwrap().outcome.is_success());
    }

    struct Panicking;

    impl RepositoryObserver for Panicking {
        fn outcome_recorded(&self, _snapshot: &ContextSnapshot) {
            panic!("observer blew up");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_observer_does_not_wedge_context() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = git2::Repository::init(temp.path()).unwrap();
        let context = Arc::new(RepositoryOperationContext::new(
            RepositoryIdentity::new(temp.path()).unwrap(),
            Some(RepositoryHandle::from_repository(&repo)),
            services(Arc::new(SequenceTransport::default())),
        ));
        let observer: Arc<dyn RepositoryObserver> = Arc::new(Panicking);
        context.set_observer(&observer);

        context.enqueue(Operation::fetch(remote("a"))).unwrap();
        let second = context.enqueue(Operation::fetch(remote("b"))).unwrap();
        tokio::time::timeout(Duration::from_secs(10), context.wait_idle())
            .await
            .expect("context stuck in Running");

        assert_eq!(context.queue_depth(), 0);
        assert_eq!(context.last_outcome().unwrap().operation_id, second);
    }
}
