//! Git plumbing: repository identity, handles, remotes and the transport
//!
//! Handles cloning and fetching with SSH agent authentication support.

mod handle;
mod identity;
mod remote;
mod transport;

pub use handle::RepositoryHandle;
pub use identity::RepositoryIdentity;
pub use remote::{default_fetch_refspec, RemoteConfiguration, RemoteUri, DEFAULT_REMOTE_NAME};
pub use transport::{FetchSummary, Git2Transport, TransferProgress, Transport};
