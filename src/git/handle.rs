//! Lightweight, shareable reference to an initialized repository

use super::remote::RemoteConfiguration;
use crate::Result;
use git2::{ErrorCode, Repository};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Handle to an on-disk repository
///
/// `git2::Repository` is not `Sync`, so contexts hand out this path-based
/// handle instead and open the repository where it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryHandle {
    git_dir: PathBuf,
    work_dir: Option<PathBuf>,
}

impl RepositoryHandle {
    /// Open the repository at `path`, failing if there is none
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::open(path.as_ref())?;
        Ok(Self::from_repository(&repo))
    }

    /// Open the repository at `path` if one is initialized there
    ///
    /// Returns `Ok(None)` for a missing or empty directory.
    pub fn discover_at(path: impl AsRef<Path>) -> Result<Option<Self>> {
        match Repository::open(path.as_ref()) {
            Ok(repo) => Ok(Some(Self::from_repository(&repo))),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_repository(repo: &Repository) -> Self {
        Self {
            git_dir: strip_trailing_separator(repo.path()),
            work_dir: repo.workdir().map(strip_trailing_separator),
        }
    }

    /// The `.git` directory (or the repository itself when bare)
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.work_dir.is_none()
    }

    pub fn open_repository(&self) -> Result<Repository> {
        Ok(Repository::open(&self.git_dir)?)
    }

    /// Resolve one named remote from the persisted config
    pub fn remote(&self, name: &str) -> Result<RemoteConfiguration> {
        let repo = self.open_repository()?;
        RemoteConfiguration::from_repository(&repo, name)
    }

    /// Resolve all remotes from the persisted config
    pub fn remotes(&self) -> Result<Vec<RemoteConfiguration>> {
        let repo = self.open_repository()?;
        RemoteConfiguration::all_from_repository(&repo)
    }

    /// Short name of HEAD, if it points at a commit
    pub fn head_shorthand(&self) -> Result<Option<String>> {
        let repo = self.open_repository()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(head.shorthand().map(str::to_string))
    }
}

/// libgit2 reports directories with a trailing '/'
fn strip_trailing_separator(path: &Path) -> PathBuf {
    path.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_missing_and_empty() {
        let temp = TempDir::new().unwrap();
        assert!(RepositoryHandle::discover_at(temp.path().join("missing"))
            .unwrap()
            .is_none());
        assert!(RepositoryHandle::discover_at(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_discover_initialized() {
        let temp = TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();

        let handle = RepositoryHandle::discover_at(temp.path()).unwrap().unwrap();
        assert!(handle.git_dir().ends_with(".git"));
        assert!(!handle.is_bare());
        assert_eq!(handle.head_shorthand().unwrap(), None);
    }

    #[test]
    fn test_bare_repository() {
        let temp = TempDir::new().unwrap();
        Repository::init_bare(temp.path()).unwrap();

        let handle = RepositoryHandle::open(temp.path()).unwrap();
        assert!(handle.is_bare());
        assert!(handle.remotes().unwrap().is_empty());
    }
}
