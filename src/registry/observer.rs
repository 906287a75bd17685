//! Observers attached to a repository context

use super::ContextSnapshot;

/// Something watching one repository, e.g. a status view
///
/// Contexts hold observers weakly; dropping the last `Arc` detaches it.
/// Observers read context state by pulling (`snapshot`, `repository`).
pub trait RepositoryObserver: Send + Sync {
    /// Name used in logs
    fn label(&self) -> String {
        "observer".to_string()
    }

    /// Called after each operation outcome is recorded, outside the context lock
    fn outcome_recorded(&self, _snapshot: &ContextSnapshot) {}
}
