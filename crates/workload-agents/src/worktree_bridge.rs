//! Worktree Bridge: git worktree isolation for workloads
//!
//! Each workload runs in its own worktree on its own branch. Path and branch
//! are pure functions of the workload id, so `ensure` is idempotent and the
//! filesystem is the only source of truth for whether a worktree exists.

use std::path::{Path, PathBuf};

use coordination::git::GitRunner;
use coordination::workload::{branch_name_for, Workload, WorkloadId};
use coordination::{CoordinationError, CoordinationResult};
use tracing::{debug, info, warn};

/// Info about a registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    /// None for a detached HEAD.
    pub branch: Option<String>,
}

/// Provisions and retires per-workload worktrees of one clone.
#[derive(Debug, Clone)]
pub struct WorktreeController {
    clone: PathBuf,
    base_dir: PathBuf,
    default_branch: String,
    git: GitRunner,
}

impl WorktreeController {
    pub fn new(clone: impl Into<PathBuf>, base_dir: impl Into<PathBuf>, git: GitRunner) -> Self {
        Self {
            clone: clone.into(),
            base_dir: base_dir.into(),
            default_branch: "main".to_string(),
            git,
        }
    }

    /// Verify the clone is a repository and create the base directory.
    pub async fn open(
        clone: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        git: GitRunner,
    ) -> CoordinationResult<Self> {
        let controller = Self::new(clone, base_dir, git);
        controller.git.ensure_repository(&controller.clone).await?;
        tokio::fs::create_dir_all(&controller.base_dir).await?;
        Ok(controller)
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    pub fn clone_path(&self) -> &Path {
        &self.clone
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    /// Deterministic worktree path for a workload.
    pub fn path_for(&self, id: &WorkloadId) -> PathBuf {
        self.base_dir.join(id.to_string())
    }

    /// Whether the workload's worktree is present on disk. Never cached.
    pub fn exists(&self, id: &WorkloadId) -> bool {
        self.path_for(id).join(".git").exists()
    }

    /// Trunk: the branch checked out in the clone, or the configured default.
    pub async fn trunk(&self) -> String {
        match self.git.current_branch(&self.clone).await {
            Ok(branch) if !branch.is_empty() => branch,
            Ok(_) | Err(_) => {
                debug!(clone = %self.clone.display(), default = %self.default_branch, "Clone HEAD detached, using default branch");
                self.default_branch.clone()
            }
        }
    }

    /// Return the workload's worktree, creating it from the trunk tip if absent.
    ///
    /// An existing worktree is returned untouched: no re-branching, no reset.
    pub async fn ensure(&self, workload: &Workload) -> CoordinationResult<PathBuf> {
        let path = self.path_for(&workload.id);
        if self.exists(&workload.id) {
            debug!(workload_id = %workload.id, path = %path.display(), "Reusing existing worktree");
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;
        // Drop registrations whose directories vanished so `worktree add` can reuse the path.
        self.git.run(&self.clone, &["worktree", "prune"]).await?;

        let path_arg = path.display().to_string();
        let branch = branch_name_for(&workload.id);

        if self.git.branch_exists(&self.clone, &branch).await? {
            // Directory lost but branch kept (e.g. after cancel): keep its commits.
            warn!(workload_id = %workload.id, %branch, "Worktree missing, re-attaching existing branch");
            self.git
                .run_with_retry(&self.clone, &["worktree", "add", &path_arg, &branch])
                .await?;
        } else {
            let trunk = self.trunk().await;
            self.git
                .run_with_retry(
                    &self.clone,
                    &["worktree", "add", "-b", &branch, &path_arg, &trunk],
                )
                .await?;
        }

        info!(workload_id = %workload.id, path = %path.display(), %branch, "Created worktree");
        Ok(path)
    }

    /// Remove the worktree and delete its branch. Safe to call repeatedly.
    pub async fn remove(&self, workload: &Workload) -> CoordinationResult<()> {
        let path = self.path_for(&workload.id);
        let branch = branch_name_for(&workload.id);

        if path.exists() {
            let path_arg = path.display().to_string();
            let output = self
                .git
                .output(&self.clone, &["worktree", "remove", "--force", &path_arg])
                .await?;
            if !output.success() {
                if path.exists() {
                    return Err(CoordinationError::git("worktree remove", output.combined()));
                }
                debug!(workload_id = %workload.id, "worktree remove reported: {}", output.combined());
            }
        }
        self.git.run(&self.clone, &["worktree", "prune"]).await?;

        if self.git.branch_exists(&self.clone, &branch).await? {
            let output = self.git.output(&self.clone, &["branch", "-d", &branch]).await?;
            if !output.success() {
                warn!(workload_id = %workload.id, %branch, "git branch -d failed: {}", output.combined());
            }
        }

        info!(workload_id = %workload.id, "Removed worktree");
        Ok(())
    }

    /// List registered worktrees (the clone itself included).
    pub async fn list(&self) -> CoordinationResult<Vec<WorktreeInfo>> {
        let stdout = self
            .git
            .run(&self.clone, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_porcelain(&stdout))
    }
}

fn parse_porcelain(stdout: &str) -> Vec<WorktreeInfo> {
    let mut infos = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                infos.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
            });
        } else if let Some(info) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                info.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                info.branch = Some(branch.to_string());
            }
        }
    }

    if let Some(info) = current {
        infos.push(info);
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_git_repo(path: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(path)
                .output()
                .expect("git setup failed");
        }
        std::fs::write(path.join("README.md"), "hello").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(path)
            .output()
            .unwrap();
    }

    #[test]
    fn test_path_is_derived_from_id() {
        let controller = WorktreeController::new("/tmp/repo", "/tmp/test-wt", GitRunner::new());
        let workload = Workload::new("Ada", "t", "d");
        assert_eq!(
            controller.path_for(&workload.id),
            PathBuf::from(format!("/tmp/test-wt/{}", workload.id))
        );
    }

    #[test]
    fn test_parse_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /wt/1\nHEAD def\ndetached\n";
        let infos = parse_porcelain(out);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].branch.as_deref(), Some("main"));
        assert_eq!(infos[1].head.as_deref(), Some("def"));
        assert_eq!(infos[1].branch, None);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let repo = tempfile::tempdir().unwrap();
        let wt_base = tempfile::tempdir().unwrap();
        init_git_repo(repo.path());

        let controller = WorktreeController::open(repo.path(), wt_base.path(), GitRunner::new())
            .await
            .expect("controller");
        let workload = Workload::new("Ada", "t", "d");

        let first = controller.ensure(&workload).await.unwrap();
        assert!(controller.exists(&workload.id));
        std::fs::write(first.join("scratch.txt"), "in progress").unwrap();
        let head = controller.git().head_commit(&first).await.unwrap();

        let second = controller.ensure(&workload).await.unwrap();
        assert_eq!(first, second);
        assert!(second.join("scratch.txt").exists(), "worktree must not be reset");
        assert_eq!(controller.git().head_commit(&second).await.unwrap(), head);

        let list = controller.list().await.unwrap();
        assert!(list.iter().any(|w| w.branch.as_deref() == Some(workload.branch.as_str())));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let repo = tempfile::tempdir().unwrap();
        let wt_base = tempfile::tempdir().unwrap();
        init_git_repo(repo.path());

        let controller = WorktreeController::open(repo.path(), wt_base.path(), GitRunner::new())
            .await
            .unwrap();
        let workload = Workload::new("Ada", "t", "d");
        controller.ensure(&workload).await.unwrap();

        controller.remove(&workload).await.unwrap();
        assert!(!controller.exists(&workload.id));
        assert!(!controller
            .git()
            .branch_exists(repo.path(), &workload.branch)
            .await
            .unwrap());

        controller.remove(&workload).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_reattaches_surviving_branch() {
        let repo = tempfile::tempdir().unwrap();
        let wt_base = tempfile::tempdir().unwrap();
        init_git_repo(repo.path());

        let controller = WorktreeController::open(repo.path(), wt_base.path(), GitRunner::new())
            .await
            .unwrap();
        let workload = Workload::new("Ada", "t", "d");
        let path = controller.ensure(&workload).await.unwrap();

        std::fs::write(path.join("work.txt"), "done").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "work"]] {
            Command::new("git").args(&args).current_dir(&path).output().unwrap();
        }
        let committed = controller.git().head_commit(&path).await.unwrap();

        std::fs::remove_dir_all(&path).unwrap();
        assert!(!controller.exists(&workload.id));

        let again = controller.ensure(&workload).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(controller.git().head_commit(&again).await.unwrap(), committed);
    }

    #[tokio::test]
    async fn test_trunk_follows_clone_head() {
        let repo = tempfile::tempdir().unwrap();
        init_git_repo(repo.path());
        let controller = WorktreeController::new(repo.path(), repo.path().join("wt"), GitRunner::new())
            .with_default_branch("develop");
        assert_eq!(controller.trunk().await, "main");

        Command::new("git")
            .args(["checkout", "--detach"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert_eq!(controller.trunk().await, "develop");
    }
}
