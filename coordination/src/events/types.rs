//! Outbound workload events
//!
//! Everything the orchestration core tells the chat transport: status
//! changes, tool approval prompts, progress heartbeats, relayed agent output,
//! summaries, and lockdown changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ToolApprovalRequest;
use crate::merge::MergeResolution;
use crate::workload::{WorkloadId, WorkloadStatus};

/// All events published by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadEvent {
    /// A workload was created and assigned to an agent
    WorkloadAssigned {
        workload_id: WorkloadId,
        agent: String,
        title: String,
        branch: String,
        timestamp: DateTime<Utc>,
    },

    /// A workload changed status
    StatusChanged {
        workload_id: WorkloadId,
        from: WorkloadStatus,
        to: WorkloadStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A tool call is waiting for a human decision
    ToolApprovalRequested {
        request: ToolApprovalRequest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A pending tool call was decided (by a human, a timeout, or cancellation)
    ToolApprovalResolved {
        workload_id: WorkloadId,
        request_id: String,
        allowed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Heartbeat while an agent turn is in progress
    TurnProgress {
        workload_id: WorkloadId,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    /// Text produced by the agent, relayed to the workload chat
    AgentMessage {
        workload_id: WorkloadId,
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// A merge cycle finished
    MergeFinished {
        workload_id: WorkloadId,
        branch: String,
        trunk: String,
        resolution: MergeResolution,
        timestamp: DateTime<Utc>,
    },

    /// Human-readable summary posted to the main chat on finalization
    WorkloadSummary {
        workload_id: WorkloadId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        main_chat_id: Option<String>,
        agent: String,
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// The agent session died or was killed outside the normal stop path
    SessionAbnormalExit {
        workload_id: WorkloadId,
        reason: String,
        transcript_tail: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Project lockdown state changed
    LockdownChanged {
        locked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl WorkloadEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkloadEvent::WorkloadAssigned { timestamp, .. } => *timestamp,
            WorkloadEvent::StatusChanged { timestamp, .. } => *timestamp,
            WorkloadEvent::ToolApprovalRequested { timestamp, .. } => *timestamp,
            WorkloadEvent::ToolApprovalResolved { timestamp, .. } => *timestamp,
            WorkloadEvent::TurnProgress { timestamp, .. } => *timestamp,
            WorkloadEvent::AgentMessage { timestamp, .. } => *timestamp,
            WorkloadEvent::MergeFinished { timestamp, .. } => *timestamp,
            WorkloadEvent::WorkloadSummary { timestamp, .. } => *timestamp,
            WorkloadEvent::SessionAbnormalExit { timestamp, .. } => *timestamp,
            WorkloadEvent::LockdownChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkloadEvent::WorkloadAssigned { .. } => "workload_assigned",
            WorkloadEvent::StatusChanged { .. } => "status_changed",
            WorkloadEvent::ToolApprovalRequested { .. } => "tool_approval_requested",
            WorkloadEvent::ToolApprovalResolved { .. } => "tool_approval_resolved",
            WorkloadEvent::TurnProgress { .. } => "turn_progress",
            WorkloadEvent::AgentMessage { .. } => "agent_message",
            WorkloadEvent::MergeFinished { .. } => "merge_finished",
            WorkloadEvent::WorkloadSummary { .. } => "workload_summary",
            WorkloadEvent::SessionAbnormalExit { .. } => "session_abnormal_exit",
            WorkloadEvent::LockdownChanged { .. } => "lockdown_changed",
        }
    }

    /// Get the workload ID if this event is workload-scoped
    pub fn workload_id(&self) -> Option<WorkloadId> {
        match self {
            WorkloadEvent::WorkloadAssigned { workload_id, .. }
            | WorkloadEvent::StatusChanged { workload_id, .. }
            | WorkloadEvent::ToolApprovalResolved { workload_id, .. }
            | WorkloadEvent::TurnProgress { workload_id, .. }
            | WorkloadEvent::AgentMessage { workload_id, .. }
            | WorkloadEvent::MergeFinished { workload_id, .. }
            | WorkloadEvent::WorkloadSummary { workload_id, .. }
            | WorkloadEvent::SessionAbnormalExit { workload_id, .. } => Some(*workload_id),
            WorkloadEvent::ToolApprovalRequested { request, .. } => Some(request.workload_id),
            WorkloadEvent::LockdownChanged { .. } => None,
        }
    }

    pub fn status_changed(
        workload_id: WorkloadId,
        from: WorkloadStatus,
        to: WorkloadStatus,
        reason: Option<&str>,
    ) -> Self {
        WorkloadEvent::StatusChanged {
            workload_id,
            from,
            to,
            reason: reason.map(String::from),
            timestamp: Utc::now(),
        }
    }
}
