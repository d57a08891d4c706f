//! Request-scoped clone directories.
//!
//! Every load gets its own directory under the workspace root, named
//! `{owner}__{name}-{uuid}`, so concurrent loads of the same repository
//! never share a path. With `delete` set, the directory is removed when
//! the [`Workspace`] is dropped: on success, on error, and when the
//! owning task is aborted.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use git2vec_core::models::RepoDescriptor;
use git2vec_core::{Error, Result};

#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    delete: bool,
}

impl Workspace {
    /// Reserve a fresh, unique path for `repo` under `root`. The directory
    /// itself is not created; `git clone` creates it.
    pub fn create(root: &Path, repo: &RepoDescriptor, delete: bool) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;
        let dir_name = format!(
            "{}__{}-{}",
            sanitize(repo.owner()),
            sanitize(repo.name()),
            Uuid::new_v4().simple()
        );
        Ok(Self {
            path: root.join(dir_name),
            delete,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove whatever a failed attempt left behind, keeping the reservation.
    pub fn reset(&self) -> Result<()> {
        remove_dir(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.delete {
            return;
        }
        match remove_dir(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "workspace removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove workspace"),
        }
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Remove `root` if it exists and holds nothing. Returns whether it was removed.
pub fn remove_if_empty(root: &Path) -> bool {
    let empty = match std::fs::read_dir(root) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return false,
    };
    empty && std::fs::remove_dir(root).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn repo(full_name: &str) -> RepoDescriptor {
        RepoDescriptor {
            url: format!("https://github.com/{}", full_name),
            full_name: full_name.to_string(),
            branch: "main".to_string(),
            stars: 0,
            forks: 0,
            created_at: Utc::now(),
            updated_at: None,
            language: None,
            size_kb: 1,
        }
    }

    #[test]
    fn test_paths_are_unique_per_invocation() {
        let tmp = TempDir::new().unwrap();
        let a = Workspace::create(tmp.path(), &repo("octo/hello"), true).unwrap();
        let b = Workspace::create(tmp.path(), &repo("octo/hello"), true).unwrap();
        assert_ne!(a.path(), b.path());
        let name = a.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("octo__hello-"));
    }

    #[test]
    fn test_drop_removes_when_delete_set() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let ws = Workspace::create(tmp.path(), &repo("a/b"), true).unwrap();
            std::fs::create_dir_all(ws.path().join("src")).unwrap();
            std::fs::write(ws.path().join("src/lib.rs"), "fn x() {}").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_keeps_when_delete_unset() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let ws = Workspace::create(tmp.path(), &repo("a/b"), false).unwrap();
            std::fs::create_dir_all(ws.path()).unwrap();
            ws.path().to_path_buf()
        };
        assert!(path.exists());
    }

    #[test]
    fn test_remove_if_empty() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repodata");
        std::fs::create_dir_all(&root).unwrap();
        assert!(remove_if_empty(&root));
        assert!(!root.exists());

        std::fs::create_dir_all(root.join("leftover")).unwrap();
        assert!(!remove_if_empty(&root));
        assert!(!remove_if_empty(&tmp.path().join("missing")));
    }
}
