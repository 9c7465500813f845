use coordination::workload::{IllegalTransition, WorkloadId, WorkloadStatus};
use coordination::CoordinationError;

use crate::engine::EngineError;

/// Errors surfaced by the workload runtime.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("Agent engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Workload not found: {0}")]
    NotFound(WorkloadId),

    #[error("Workload {0} already has a live session")]
    SessionActive(WorkloadId),

    #[error("No live session for workload {0}")]
    NoLiveSession(WorkloadId),

    #[error("Workload {id} cannot be resumed from status {status}")]
    NotResumable { id: WorkloadId, status: WorkloadStatus },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("No pending tool approval {request_id} for workload {workload_id}")]
    NoPendingApproval {
        workload_id: WorkloadId,
        request_id: String,
    },

    #[error("Chat transport error: {0}")]
    Transport(String),

    #[error("Manager is shutting down")]
    ShuttingDown,
}

impl WorkloadError {
    /// Ownership lockdown refused the operation.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Coordination(e) if e.is_locked())
    }
}

pub type WorkloadResult<T> = Result<T, WorkloadError>;
