//! Merge-on-stop state machine.
//!
//! The agent engine calling back at "stop" time is modelled as an explicit
//! transition function: a stop-intent drives the cycle into `Merging`, and
//! the merge result decides between confirming the stop and continuing the
//! same session with an injected message describing the conflict.
//!
//! ```text
//! Working ──stop-intent──▶ RequestingStop ──▶ Merging ──┬─▶ Merged           (confirm stop)
//!    ▲                                                  ├─▶ Conflict         (continue, retries ≤ max)
//!    └──────────────── next turn ◀──────────────────────┘
//!                                                       └─▶ NeedsAttention   (confirm stop, worktree kept)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoordinationError;

/// Conflict cycles granted before a workload needs a human.
pub const DEFAULT_MAX_MERGE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    /// Agent turn in progress.
    Working,
    RequestingStop,
    Merging,
    Merged,
    Conflict,
    NeedsAttention,
}

impl MergePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::NeedsAttention)
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Working => "working",
            Self::RequestingStop => "requesting_stop",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Conflict => "conflict",
            Self::NeedsAttention => "needs_attention",
        };
        f.write_str(name)
    }
}

/// Files and raw git output from a conflicting merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub files: Vec<String>,
    pub detail: String,
}

/// What a single merge attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged,
    /// Worktree was already gone; nothing left to merge.
    NothingToMerge,
    Conflict(ConflictReport),
    /// Non-conflict failure (timeout, git error) after operation-level retries.
    Failed { cause: String },
}

/// Final outcome of a merge cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeResolution {
    Merged,
    NothingToMerge,
    Exhausted { retries: u32 },
    Failed { cause: String },
}

impl MergeResolution {
    /// Whether the branch landed on trunk (or there was nothing to land).
    pub fn landed(&self) -> bool {
        matches!(self, Self::Merged | Self::NothingToMerge)
    }
}

/// Answer given to the engine's stop-intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopDecision {
    ConfirmStop(MergeResolution),
    Continue { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalMergeTransition {
    pub from: MergePhase,
    pub to: MergePhase,
}

impl fmt::Display for IllegalMergeTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal merge transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalMergeTransition {}

impl From<IllegalMergeTransition> for CoordinationError {
    fn from(e: IllegalMergeTransition) -> Self {
        CoordinationError::InvalidStateTransition {
            from: e.from.to_string(),
            to: e.to.to_string(),
        }
    }
}

/// Merge/retry state for one run cycle of one workload.
#[derive(Debug, Clone)]
pub struct MergeCycle {
    phase: MergePhase,
    retries: u32,
    max_retries: u32,
    branch: String,
    trunk: String,
}

impl MergeCycle {
    pub fn new(branch: impl Into<String>, trunk: impl Into<String>, max_retries: u32) -> Self {
        Self {
            phase: MergePhase::Working,
            retries: 0,
            max_retries,
            branch: branch.into(),
            trunk: trunk.into(),
        }
    }

    pub fn phase(&self) -> MergePhase {
        self.phase
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Stop-intent received from the engine.
    pub fn request_stop(&mut self) -> Result<(), IllegalMergeTransition> {
        self.advance(MergePhase::RequestingStop, |from| {
            matches!(from, MergePhase::Working | MergePhase::Conflict)
        })
    }

    /// Merge lock acquired, merge about to run.
    pub fn begin_merge(&mut self) -> Result<(), IllegalMergeTransition> {
        self.advance(MergePhase::Merging, |from| from == MergePhase::RequestingStop)
    }

    /// Apply the merge result and decide whether the session may stop.
    pub fn complete(
        &mut self,
        attempt: MergeAttempt,
    ) -> Result<StopDecision, IllegalMergeTransition> {
        if self.phase != MergePhase::Merging {
            return Err(IllegalMergeTransition {
                from: self.phase,
                to: MergePhase::Merged,
            });
        }

        let decision = match attempt {
            MergeAttempt::Merged => {
                self.phase = MergePhase::Merged;
                StopDecision::ConfirmStop(MergeResolution::Merged)
            }
            MergeAttempt::NothingToMerge => {
                self.phase = MergePhase::Merged;
                StopDecision::ConfirmStop(MergeResolution::NothingToMerge)
            }
            MergeAttempt::Conflict(report) => {
                self.retries += 1;
                if self.retries <= self.max_retries {
                    self.phase = MergePhase::Conflict;
                    StopDecision::Continue {
                        message: conflict_message(
                            &self.branch,
                            &self.trunk,
                            self.retries,
                            self.max_retries,
                            &report,
                        ),
                    }
                } else {
                    self.phase = MergePhase::NeedsAttention;
                    StopDecision::ConfirmStop(MergeResolution::Exhausted {
                        retries: self.retries,
                    })
                }
            }
            MergeAttempt::Failed { cause } => {
                self.phase = MergePhase::NeedsAttention;
                StopDecision::ConfirmStop(MergeResolution::Failed { cause })
            }
        };

        tracing::debug!(branch = %self.branch, phase = %self.phase, retries = self.retries, "Merge cycle advanced");
        Ok(decision)
    }

    fn advance(
        &mut self,
        to: MergePhase,
        allowed: impl Fn(MergePhase) -> bool,
    ) -> Result<(), IllegalMergeTransition> {
        if !allowed(self.phase) {
            return Err(IllegalMergeTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

/// System message injected into the session after a conflicting merge.
pub fn conflict_message(
    branch: &str,
    trunk: &str,
    attempt: u32,
    max_retries: u32,
    report: &ConflictReport,
) -> String {
    let mut message = format!(
        "Your branch '{branch}' has merge conflicts with {trunk} \
         (attempt {attempt} of {max_retries}). The merge was aborted; {trunk} is unchanged.\n"
    );
    if !report.files.is_empty() {
        message.push_str("\nConflicting files:\n");
        for file in &report.files {
            message.push_str(&format!("- {file}\n"));
        }
    }
    if !report.detail.is_empty() {
        message.push_str(&format!("\nGit output:\n{}\n", report.detail));
    }
    message.push_str(&format!(
        "\nPlease rebase onto {trunk} and resolve the conflicts:\n\n\
         1. Run: git rebase {trunk}\n\
         2. Resolve any conflicts in the affected files\n\
         3. Run: git rebase --continue\n\
         4. Then finish your task as normal."
    ));
    message
}
