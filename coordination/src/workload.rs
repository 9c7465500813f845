//! Workload record and status state machine
//!
//! ```text
//! assigned → running
//! running → needs_attention | completed | cancelled
//! needs_attention → running   (resume)
//! completed → running         (resume, new worktree cycle)
//! ```
//!
//! Any other edge is rejected with [`IllegalTransition`]; records are never
//! deleted, terminal states are kept for audit and resume.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinationError;

/// Workload identifier.
pub type WorkloadId = Uuid;

/// Branch prefix for workload branches.
pub const BRANCH_PREFIX: &str = "workload/";

/// Deterministic branch name for a workload.
pub fn branch_name_for(id: &WorkloadId) -> String {
    format!("{BRANCH_PREFIX}{id}")
}

/// Lifecycle status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Assigned,
    Running,
    NeedsAttention,
    Completed,
    Cancelled,
}

impl WorkloadStatus {
    /// Statuses a human may resume from.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::NeedsAttention | Self::Completed)
    }

    /// Whether a live session may exist in this status.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::NeedsAttention => write!(f, "needs_attention"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How the agent engine treats file edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMode {
    /// Every tool call not already approved is put to a human.
    #[default]
    #[serde(rename = "standard")]
    Standard,
    /// File edits inside the worktree are approved without asking.
    #[serde(rename = "accept-edits")]
    AcceptEdits,
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::AcceptEdits => write!(f, "accept-edits"),
        }
    }
}

fn is_legal_transition(from: WorkloadStatus, to: WorkloadStatus) -> bool {
    use WorkloadStatus::*;

    matches!(
        (from, to),
        (Assigned, Running)
            | (Running, NeedsAttention)
            | (Running, Completed)
            | (Running, Cancelled)
            | (NeedsAttention, Running)
            | (Completed, Running)
    )
}

/// A single recorded status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkloadStatus,
    pub to: WorkloadStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: WorkloadStatus,
    pub to: WorkloadStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal workload transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

impl From<IllegalTransition> for CoordinationError {
    fn from(e: IllegalTransition) -> Self {
        CoordinationError::InvalidStateTransition {
            from: e.from.to_string(),
            to: e.to.to_string(),
        }
    }
}

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    /// Display name of the owning agent.
    pub agent: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    /// Chat room the workload's status is published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Main chat the dispatching message came from; summaries go here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_chat_id: Option<String>,
    pub status: WorkloadStatus,
    pub permission_mode: PermissionMode,
    pub branch: String,
    /// Opaque, owned by the agent engine. Stable across suspend/resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub merge_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

impl Workload {
    pub fn new(
        agent: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            agent: agent.into(),
            title: title.into(),
            description: description.into(),
            background: None,
            room_id: None,
            main_chat_id: None,
            status: WorkloadStatus::Assigned,
            permission_mode: PermissionMode::default(),
            branch: branch_name_for(&id),
            session_id: None,
            merge_retries: 0,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    pub fn with_chat(mut self, room_id: impl Into<String>, main_chat_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self.main_chat_id = Some(main_chat_id.into());
        self
    }

    /// First 8 characters of the id, for logs.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Attempt a status transition, recording it on success.
    pub fn transition(
        &mut self,
        to: WorkloadStatus,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.status, to) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }

        tracing::debug!(
            workload_id = %self.id,
            from = %self.status,
            to = %to,
            "Workload transition"
        );

        let now = Utc::now();
        self.transitions.push(TransitionRecord {
            from: self.status,
            to,
            at: now,
            reason: reason.map(String::from),
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Start a fresh run cycle: the merge retry budget is per cycle.
    pub fn begin_cycle(&mut self) {
        self.merge_retries = 0;
    }

    /// Record the engine's session id. The first id wins; a differing id on a
    /// later report is refused so the identifier stays stable.
    pub fn record_session_id(&mut self, session_id: &str) -> bool {
        match &self.session_id {
            None => {
                self.session_id = Some(session_id.to_string());
                self.updated_at = Utc::now();
                true
            }
            Some(existing) => existing == session_id,
        }
    }
}
