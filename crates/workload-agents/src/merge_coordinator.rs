//! Merge-on-stop.
//!
//! When an agent signals it is done, its branch is merged into trunk in the
//! shared clone while holding the clone's repo lock. A clean merge retires the
//! worktree and pushes trunk; a conflict aborts the merge, leaves trunk
//! untouched and tells the agent to rebase, up to the retry budget.

use std::path::Path;
use std::sync::Arc;

use coordination::git::GitRunner;
use coordination::merge::{ConflictReport, MergeAttempt, MergeCycle, StopDecision};
use coordination::repo_lock::RepoLocks;
use coordination::workload::Workload;
use coordination::CoordinationResult;
use tracing::{debug, info, warn};

use crate::engine::AgentIdentity;
use crate::worktree_bridge::WorktreeController;

const MERGE_COMMITTER_NAME: &str = "team-agent";
const MERGE_COMMITTER_EMAIL: &str = "noreply@team-agent";

pub struct MergeCoordinator {
    worktrees: Arc<WorktreeController>,
    /// Runner for the trunk merge itself, bounded by the merge timeout.
    merge_git: GitRunner,
    locks: RepoLocks,
    email_domain: String,
}

impl MergeCoordinator {
    pub fn new(worktrees: Arc<WorktreeController>, merge_git: GitRunner, locks: RepoLocks) -> Self {
        Self {
            worktrees,
            merge_git,
            locks,
            email_domain: "team-agent".to_string(),
        }
    }

    pub fn with_email_domain(mut self, domain: impl Into<String>) -> Self {
        self.email_domain = domain.into();
        self
    }

    fn git(&self) -> &GitRunner {
        self.worktrees.git()
    }

    /// Handle a stop-intent: merge, then confirm the stop or ask the agent to
    /// continue.
    pub async fn on_stop_intent(
        &self,
        cycle: &mut MergeCycle,
        workload: &Workload,
    ) -> CoordinationResult<StopDecision> {
        cycle.request_stop()?;

        let clone = self.worktrees.clone_path().to_path_buf();
        let _repo_guard = self.locks.acquire(&clone).await;
        cycle.begin_merge()?;

        let attempt = self.attempt(workload, cycle.trunk()).await;
        let merged = attempt == MergeAttempt::Merged;
        let decision = cycle.complete(attempt)?;

        if merged {
            if let Err(e) = self.worktrees.remove(workload).await {
                warn!(workload_id = %workload.id, "Failed to remove merged worktree: {e}");
            }
            if let Err(e) = self.git().run_with_retry(&clone, &["push"]).await {
                warn!(workload_id = %workload.id, "Failed to push trunk after merge: {e}");
            }
        }

        Ok(decision)
    }

    /// One merge attempt of the workload branch into `trunk`. Leaves trunk
    /// clean whatever the outcome.
    pub async fn attempt(&self, workload: &Workload, trunk: &str) -> MergeAttempt {
        if !self.worktrees.exists(&workload.id) {
            info!(workload_id = %workload.id, "Worktree already gone, nothing to merge");
            return MergeAttempt::NothingToMerge;
        }

        let worktree = self.worktrees.path_for(&workload.id);
        if let Err(e) = self.auto_commit(workload, &worktree).await {
            warn!(workload_id = %workload.id, "Auto-commit failed, merging committed work only: {e}");
        }

        let clone = self.worktrees.clone_path();
        let name_arg = format!("user.name={MERGE_COMMITTER_NAME}");
        let email_arg = format!("user.email={MERGE_COMMITTER_EMAIL}");
        let result = self
            .merge_git
            .output(
                clone,
                &[
                    "-c",
                    &name_arg,
                    "-c",
                    &email_arg,
                    "merge",
                    &workload.branch,
                    "--no-edit",
                ],
            )
            .await;

        match result {
            Ok(output) if output.success() => {
                info!(workload_id = %workload.id, branch = %workload.branch, %trunk, "Merged into trunk");
                MergeAttempt::Merged
            }
            Ok(output) => {
                let detail = output.combined();
                let files = self.conflicted_files(clone).await;
                self.abort_merge(clone).await;
                if !files.is_empty() || detail.contains("CONFLICT") {
                    warn!(workload_id = %workload.id, files = ?files, "Merge conflict");
                    MergeAttempt::Conflict(ConflictReport { files, detail })
                } else {
                    warn!(workload_id = %workload.id, "Merge failed: {detail}");
                    MergeAttempt::Failed { cause: detail }
                }
            }
            Err(e) => {
                self.abort_merge(clone).await;
                warn!(workload_id = %workload.id, "Merge failed: {e}");
                MergeAttempt::Failed {
                    cause: e.to_string(),
                }
            }
        }
    }

    /// Commit anything the agent left uncommitted, under the agent's identity.
    async fn auto_commit(&self, workload: &Workload, worktree: &Path) -> CoordinationResult<()> {
        self.git().run(worktree, &["add", "-A"]).await?;
        if !self.git().has_uncommitted_changes(worktree).await? {
            return Ok(());
        }

        let identity = AgentIdentity::for_agent(&workload.agent, &self.email_domain);
        let name_arg = format!("user.name={}", identity.name);
        let email_arg = format!("user.email={}", identity.email);
        let message = format!("Workload {}: auto-commit changes", workload.short_id());
        self.git()
            .run(
                worktree,
                &["-c", &name_arg, "-c", &email_arg, "commit", "-m", &message],
            )
            .await?;
        debug!(workload_id = %workload.id, "Auto-committed pending changes");
        Ok(())
    }

    async fn conflicted_files(&self, clone: &Path) -> Vec<String> {
        match self
            .git()
            .run(clone, &["diff", "--name-only", "--diff-filter=U"])
            .await
        {
            Ok(stdout) => stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn abort_merge(&self, clone: &Path) {
        let aborted = matches!(
            self.git().output(clone, &["merge", "--abort"]).await,
            Ok(output) if output.success()
        );
        if !aborted {
            if let Err(e) = self.git().run(clone, &["reset", "--merge"]).await {
                warn!(clone = %clone.display(), "Failed to reset clone after merge: {e}");
            }
        }
    }
}
