//! Workload coordination library
//!
//! Deterministic, engine-agnostic building blocks for running agent
//! workloads against a shared git repository:
//!
//! - **Ownership**: the committed `.team-agent/manifest.json` claim and the
//!   guard that validates it, auto-corrects it, or locks the project down.
//! - **Workloads**: the workload record and its status state machine.
//! - **Merge**: the merge-on-stop state machine with its bounded conflict
//!   retry budget.
//! - **Approval**: permission keys, rule matching, and persisted approvals for
//!   agent tool calls.
//! - **Git**: an async git runner with timeouts and retry/backoff, plus a
//!   per-repository lock registry.
//! - **Events**: outbound event types and a broadcast bus.

#![allow(clippy::uninlined_format_args)]

pub mod approval;
pub mod error;
pub mod events;
pub mod git;
pub mod merge;
pub mod ownership;
pub mod repo_lock;
pub mod resilience;
pub mod workload;

pub use approval::{
    ApprovalDecision, ApprovalStore, JsonApprovalStore, SessionApprovals, ToolApprovalRequest,
    ToolVerdict,
};
pub use error::{CoordinationError, CoordinationResult};
pub use events::{EventBus, SharedEventBus, WorkloadEvent};
pub use git::{GitOutput, GitRunner};
pub use merge::{
    ConflictReport, MergeAttempt, MergeCycle, MergePhase, MergeResolution, StopDecision,
    DEFAULT_MAX_MERGE_RETRIES,
};
pub use ownership::{
    CallerIdentity, LockdownState, OwnershipManifest, OwnershipStatus, OwnershipVerdict,
    RepoOwnershipGuard,
};
pub use repo_lock::RepoLocks;
pub use resilience::RetryPolicy;
pub use workload::{PermissionMode, Workload, WorkloadId, WorkloadStatus};
