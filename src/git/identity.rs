//! Repository identity: the canonical directory a repository lives in

use crate::{GitOpsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Canonical on-disk location of a repository
///
/// Two paths naming the same directory (relative vs absolute, `..` segments,
/// symlinked parents, trailing separators) produce equal identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryIdentity(PathBuf);

impl RepositoryIdentity {
    /// Resolve a path into an identity
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(GitOpsError::RequestInvalid(
                "repository path must not be empty".to_string(),
            ));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let normalized = normalize(&absolute);

        Ok(Self(resolve_existing_prefix(&normalized)))
    }

    /// The directory path
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Canonicalize the longest existing ancestor and re-append the rest
///
/// A clone target usually does not exist yet, and neither may several of
/// its parents; the identity must not change once they are created.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc, name| acc.join(name));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Lexically remove `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for RepositoryIdentity {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_equivalent_paths_resolve_to_same_identity() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("r1");
        std::fs::create_dir(&repo).unwrap();

        let plain = RepositoryIdentity::new(&repo).unwrap();
        let dotted = RepositoryIdentity::new(temp.path().join("r1/./")).unwrap();
        let parent = RepositoryIdentity::new(temp.path().join("other/../r1")).unwrap();

        assert_eq!(plain, dotted);
        assert_eq!(plain, parent);
    }

    #[test]
    fn test_missing_directory_keeps_name() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("not-cloned-yet");

        let identity = RepositoryIdentity::new(&target).unwrap();
        assert!(identity.path().ends_with("not-cloned-yet"));
        assert!(identity.path().is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_ancestor_resolves_before_and_after_creation() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let target = link.join("nested").join("repo");
        let before = RepositoryIdentity::new(&target).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        let after = RepositoryIdentity::new(&target).unwrap();

        assert_eq!(before, after);
        assert!(before.path().starts_with(real.canonicalize().unwrap()));
    }

    #[test]
    fn test_empty_path_rejected() {
        let err = RepositoryIdentity::new("").unwrap_err();
        assert!(matches!(err, GitOpsError::RequestInvalid(_)));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }
}
