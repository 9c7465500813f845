//! Per-repository mutual exclusion.
//!
//! Merges into trunk and ownership-manifest writes are the only operations
//! that need true exclusion, and only against the same repository. Each
//! repository path maps to its own async mutex; unrelated repositories never
//! contend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Registry of per-repository async locks. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `repo`, waiting for any current holder.
    pub async fn acquire(&self, repo: &Path) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(repo);
        lock.lock_owned().await
    }

    fn lock_for(&self, repo: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = std::fs::canonicalize(repo).unwrap_or_else(|_| repo.to_path_buf());
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn is_free(locks: &RepoLocks, repo: &Path) -> bool {
        tokio::time::timeout(Duration::from_millis(50), locks.acquire(repo))
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_same_repo_is_exclusive() {
        let locks = RepoLocks::new();
        let repo = Path::new("/tmp/repo-lock-test-a");
        let held = locks.acquire(repo).await;
        assert!(!is_free(&locks, repo).await);
        drop(held);
        assert!(is_free(&locks, repo).await);
    }

    #[tokio::test]
    async fn test_different_repos_do_not_contend() {
        let locks = RepoLocks::new();
        let _a = locks.acquire(Path::new("/tmp/repo-lock-test-a")).await;
        assert!(is_free(&locks, Path::new("/tmp/repo-lock-test-b")).await);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let locks = RepoLocks::new();
        let other = locks.clone();
        let repo = Path::new("/tmp/repo-lock-test-c");
        let _held = locks.acquire(repo).await;
        assert!(!is_free(&other, repo).await);
    }
}
