//! Repository ownership guard
//!
//! Commit-and-compare protocol against the manifest inside the shared
//! repository, the only resource every environment is guaranteed to see.
//!
//! ```text
//! no manifest                         → claim (write, commit, push)   → ok
//! manifest == caller                  →                                 ok
//! manifest is prod, caller differs    → hard refuse                   → locked
//! manifest non-prod, caller is prod   → force-rewrite + push          → ok | locked(diff)
//! manifest non-prod, caller non-prod  → refuse                        → locked
//! ```
//!
//! Checks against one repository are serialized so two callers can never
//! both observe "unclaimed" and both write a claim.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::manifest::{
    read_manifest, write_manifest, OwnershipManifest, MANIFEST_DIR, PRODUCTION_ENV,
};
use crate::error::{CoordinationError, CoordinationResult};
use crate::git::GitRunner;
use crate::repo_lock::RepoLocks;

/// Identity of the environment/project asking to use a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub env: String,
    pub project_id: String,
    pub project_name: String,
}

impl CallerIdentity {
    pub fn new(
        env: impl Into<String>,
        project_id: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            env: env.into(),
            project_id: project_id.into(),
            project_name: project_name.into(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.env == PRODUCTION_ENV
    }

    /// The manifest this caller would commit for itself.
    pub fn expected_manifest(&self) -> OwnershipManifest {
        OwnershipManifest::new(&self.env, &self.project_id, &self.project_name)
    }
}

/// How a passing check was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipStatus {
    /// Manifest already names the caller.
    Valid,
    /// Repository was unclaimed; the caller's claim was committed and pushed.
    Claimed,
    /// Production caller overwrote a non-production claim and pushed it.
    Corrected,
}

/// Result of an ownership check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OwnershipVerdict {
    Ok { status: OwnershipStatus },
    Locked { reason: String },
}

impl OwnershipVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Locked { reason } => Some(reason),
        }
    }
}

/// Derived, per-project lockdown state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownState {
    pub locked: bool,
    pub reason: Option<String>,
}

const MANIFEST_COMMITTER_NAME: &str = "team-agent";
const MANIFEST_COMMITTER_EMAIL: &str = "noreply@team-agent";

/// Claim state of a repository as seen before a project is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "claim", rename_all = "snake_case")]
pub enum ClaimInspection {
    Unclaimed,
    ClaimedProd { manifest: OwnershipManifest, reason: String },
    ClaimedOther { manifest: OwnershipManifest, reason: String },
}

/// Validates and enforces which environment owns a repository.
pub struct RepoOwnershipGuard {
    identity: CallerIdentity,
    repo: PathBuf,
    git: GitRunner,
    locks: RepoLocks,
    lockdown: RwLock<LockdownState>,
}

impl RepoOwnershipGuard {
    pub fn new(identity: CallerIdentity, repo: impl AsRef<Path>, git: GitRunner) -> Self {
        Self {
            identity,
            repo: repo.as_ref().to_path_buf(),
            git,
            locks: RepoLocks::new(),
            lockdown: RwLock::new(LockdownState::default()),
        }
    }

    /// Share a lock registry with other guards in the same process.
    pub fn with_locks(mut self, locks: RepoLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Current lockdown state.
    pub fn lockdown(&self) -> LockdownState {
        self.lockdown
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Refuse if the project is locked. Does not re-validate.
    pub fn ensure_unlocked(&self) -> CoordinationResult<()> {
        let state = self.lockdown();
        if state.locked {
            return Err(CoordinationError::locked(
                state.reason.unwrap_or_else(|| "ownership check failed".to_string()),
            ));
        }
        Ok(())
    }

    /// Gate used before a workload starts: refuse while locked, otherwise
    /// re-validate and surface a new lockdown as an error.
    pub async fn gate(&self, pull: bool) -> CoordinationResult<OwnershipStatus> {
        self.ensure_unlocked()?;
        match self.check(pull).await {
            OwnershipVerdict::Ok { status } => Ok(status),
            OwnershipVerdict::Locked { reason } => Err(CoordinationError::locked(reason)),
        }
    }

    /// Explicit refresh: pull, then re-validate. Clears lockdown on success.
    pub async fn refresh(&self) -> OwnershipVerdict {
        self.check(true).await
    }

    /// Validate ownership of the repository and update lockdown state.
    pub async fn check(&self, pull: bool) -> OwnershipVerdict {
        let _repo_guard = self.locks.acquire(&self.repo).await;

        if pull {
            if let Err(e) = self
                .git
                .run_with_retry(&self.repo, &["pull", "--ff-only"])
                .await
            {
                warn!(repo = %self.repo.display(), "git pull failed, validating local copy: {e}");
            }
        }

        let verdict = self.evaluate().await;
        self.record(&verdict);
        verdict
    }

    /// Claim state for project creation. Does not write anything.
    pub async fn inspect(&self) -> CoordinationResult<ClaimInspection> {
        let Some(manifest) = read_manifest(&self.repo).await? else {
            return Ok(ClaimInspection::Unclaimed);
        };
        if manifest.is_production() {
            let reason = format!(
                "This repository is owned by production project '{}'. Choose a different repository.",
                manifest.project_name
            );
            return Ok(ClaimInspection::ClaimedProd { manifest, reason });
        }
        let reason = format!("This repository is owned by {}.", manifest.describe_owner());
        Ok(ClaimInspection::ClaimedOther { manifest, reason })
    }

    async fn evaluate(&self) -> OwnershipVerdict {
        let expected = self.identity.expected_manifest();

        let actual = match read_manifest(&self.repo).await {
            Ok(actual) => actual,
            Err(e) => {
                return OwnershipVerdict::Locked {
                    reason: format!("Ownership manifest unreadable: {e}"),
                }
            }
        };

        let Some(actual) = actual else {
            return match self.commit_manifest(&expected, "chore: claim repository ownership").await {
                Ok(()) => {
                    info!(env = %self.identity.env, project = %self.identity.project_id, "Claimed unowned repository");
                    OwnershipVerdict::Ok {
                        status: OwnershipStatus::Claimed,
                    }
                }
                Err(e) => OwnershipVerdict::Locked {
                    reason: format!("Failed to claim unowned repository: {e}"),
                },
            };
        };

        if actual.same_owner(&expected) {
            return OwnershipVerdict::Ok {
                status: OwnershipStatus::Valid,
            };
        }

        if actual.is_production() {
            return OwnershipVerdict::Locked {
                reason: format!(
                    "Repository is owned by production {}. Production claims can only be \
                     changed by their owner; resolve this outside the app.",
                    actual.describe_owner()
                ),
            };
        }

        if self.identity.is_production() {
            return match self
                .commit_manifest(&expected, "fix: correct manifest ownership")
                .await
            {
                Ok(()) => {
                    warn!(
                        previous_env = %actual.env,
                        previous_project = %actual.project_id,
                        "Corrected repository ownership manifest"
                    );
                    OwnershipVerdict::Ok {
                        status: OwnershipStatus::Corrected,
                    }
                }
                Err(e) => {
                    let diff = OwnershipManifest::diff(&expected, &actual);
                    OwnershipVerdict::Locked {
                        reason: format!(
                            "Manifest mismatch and the corrected manifest could not be pushed ({e}). \
                             Expected vs actual:\n  {}",
                            diff.join("\n  ")
                        ),
                    }
                }
            };
        }

        OwnershipVerdict::Locked {
            reason: format!(
                "Manifest belongs to {}, not this project. Fix the repo manually or \
                 create a new project with a different repo.",
                actual.describe_owner()
            ),
        }
    }

    /// Write, commit and push `manifest`. On any failure the local commit is
    /// rolled back so the clone keeps matching its remote.
    async fn commit_manifest(
        &self,
        manifest: &OwnershipManifest,
        message: &str,
    ) -> CoordinationResult<()> {
        let previous_head = self.git.head_commit(&self.repo).await.ok();

        let result = self.write_commit_push(manifest, message).await;
        if result.is_err() {
            if let Some(head) = previous_head {
                if let Err(e) = self.git.run(&self.repo, &["reset", "--hard", &head]).await {
                    warn!(repo = %self.repo.display(), "Failed to roll back manifest commit: {e}");
                }
            }
        }
        result
    }

    async fn write_commit_push(
        &self,
        manifest: &OwnershipManifest,
        message: &str,
    ) -> CoordinationResult<()> {
        write_manifest(&self.repo, manifest).await?;

        let manifest_dir = format!("{MANIFEST_DIR}/");
        self.git.run(&self.repo, &["add", &manifest_dir]).await?;

        let name = format!("user.name={MANIFEST_COMMITTER_NAME}");
        let email = format!("user.email={MANIFEST_COMMITTER_EMAIL}");
        let commit = self
            .git
            .output(&self.repo, &["-c", &name, "-c", &email, "commit", "-m", message])
            .await?;
        if !commit.success() && !commit.combined().contains("nothing to commit") {
            return Err(CoordinationError::git("commit", commit.combined()));
        }

        self.git.run_with_retry(&self.repo, &["push"]).await?;
        Ok(())
    }

    fn record(&self, verdict: &OwnershipVerdict) {
        let mut state = self
            .lockdown
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match verdict {
            OwnershipVerdict::Ok { .. } => {
                if state.locked {
                    info!(project = %self.identity.project_id, "Lockdown cleared");
                }
                *state = LockdownState::default();
            }
            OwnershipVerdict::Locked { reason } => {
                warn!(project = %self.identity.project_id, %reason, "Project locked");
                *state = LockdownState {
                    locked: true,
                    reason: Some(reason.clone()),
                };
            }
        }
    }
}
