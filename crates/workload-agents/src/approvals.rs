//! Per-session tool approval broker.
//!
//! Resolution order for a tool call: accept-edits shortcut, session grants,
//! project store, then a human. Pending requests are keyed by request id and
//! answered at most once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use coordination::approval::{
    is_edit_tool, original_content, permission_key, summarize_input, ApprovalDecision,
    ApprovalStore, SessionApprovals, ToolApprovalRequest, ToolVerdict,
};
use coordination::workload::{PermissionMode, WorkloadId};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{WorkloadError, WorkloadResult};

/// A request registered with the broker and awaiting a decision.
pub struct PendingApproval {
    pub request: ToolApprovalRequest,
    receiver: oneshot::Receiver<ApprovalDecision>,
}

pub struct ApprovalBroker {
    workload_id: WorkloadId,
    mode: PermissionMode,
    worktree: PathBuf,
    store: Arc<dyn ApprovalStore>,
    session: Mutex<SessionApprovals>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    timeout: Option<Duration>,
}

impl ApprovalBroker {
    pub fn new(
        workload_id: WorkloadId,
        mode: PermissionMode,
        worktree: impl Into<PathBuf>,
        store: Arc<dyn ApprovalStore>,
    ) -> Self {
        Self {
            workload_id,
            mode,
            worktree: worktree.into(),
            store,
            session: Mutex::new(SessionApprovals::new()),
            pending: Mutex::new(HashMap::new()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workload_id(&self) -> WorkloadId {
        self.workload_id
    }

    /// Allow without asking when an earlier grant covers the call.
    pub async fn preapproved(&self, tool_name: &str, input: &Value) -> Option<ToolVerdict> {
        if self.mode == PermissionMode::AcceptEdits && is_edit_tool(tool_name) {
            debug!(workload_id = %self.workload_id, tool_name, "Edit auto-approved (accept-edits)");
            return Some(ToolVerdict::Allow);
        }

        let key = permission_key(tool_name, input);
        let session_allows = self
            .session
            .lock()
            .map(|s| s.allows(tool_name, &key))
            .unwrap_or(false);
        if session_allows {
            debug!(workload_id = %self.workload_id, %key, "Tool allowed by session grant");
            return Some(ToolVerdict::Allow);
        }

        match self.store.allows(tool_name, &key).await {
            Ok(true) => {
                debug!(workload_id = %self.workload_id, %key, "Tool allowed by project settings");
                Some(ToolVerdict::Allow)
            }
            Ok(false) => None,
            Err(e) => {
                warn!(workload_id = %self.workload_id, "Project approvals unreadable, asking: {e}");
                None
            }
        }
    }

    /// Register a request that needs a human decision.
    pub async fn register(
        &self,
        request_id: &str,
        tool_name: &str,
        input: Value,
    ) -> PendingApproval {
        let request = ToolApprovalRequest {
            request_id: request_id.to_string(),
            workload_id: self.workload_id,
            tool_name: tool_name.to_string(),
            input_summary: summarize_input(tool_name, &input),
            permission_key: permission_key(tool_name, &input),
            original_content: original_content(&self.worktree, tool_name, &input).await,
            input,
            requested_at: Utc::now(),
        };

        let (sender, receiver) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id.to_string(), sender);
        }
        PendingApproval { request, receiver }
    }

    /// Wait for the decision. Cancellation and timeout deny.
    pub async fn await_decision(
        &self,
        pending: PendingApproval,
        cancel: &CancellationToken,
    ) -> ToolVerdict {
        let PendingApproval { request, receiver } = pending;
        let timeout = self.timeout;
        let expiry = async move {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let verdict = tokio::select! {
            decision = receiver => match decision {
                Ok(decision) => self.apply(&request, decision).await,
                Err(_) => ToolVerdict::deny("Approval request was dropped"),
            },
            _ = cancel.cancelled() => ToolVerdict::deny("Session ended before a decision was made"),
            _ = expiry => {
                let secs = timeout.map(|d| d.as_secs()).unwrap_or_default();
                info!(workload_id = %self.workload_id, request_id = %request.request_id, "Tool approval timed out");
                ToolVerdict::deny(format!(
                    "Tool approval timed out after {secs}s without a response"
                ))
            }
        };

        self.forget(&request.request_id);
        verdict
    }

    /// Deliver a human decision. Each request accepts one decision.
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> WorkloadResult<()> {
        decision.validate()?;
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(request_id));
        let no_pending = || WorkloadError::NoPendingApproval {
            workload_id: self.workload_id,
            request_id: request_id.to_string(),
        };
        sender.ok_or_else(no_pending)?.send(decision).map_err(|_| no_pending())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn forget(&self, request_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(request_id);
        }
    }

    async fn apply(&self, request: &ToolApprovalRequest, decision: ApprovalDecision) -> ToolVerdict {
        let key = &request.permission_key;
        match decision {
            ApprovalDecision::Approve => ToolVerdict::Allow,
            ApprovalDecision::ApproveSession => {
                self.grant_session(key);
                ToolVerdict::Allow
            }
            ApprovalDecision::ApproveProject => {
                self.grant_session(key);
                if let Err(e) = self.store.persist(key).await {
                    warn!(workload_id = %self.workload_id, %key, "Failed to persist project approval: {e}");
                }
                ToolVerdict::Allow
            }
            ApprovalDecision::Deny { reason } => ToolVerdict::Deny { reason },
        }
    }

    fn grant_session(&self, key: &str) {
        if let Ok(mut session) = self.session.lock() {
            session.grant(key);
        }
    }
}
