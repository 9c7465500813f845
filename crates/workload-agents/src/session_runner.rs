//! Session runner: starts or resumes an agent session for one workload and
//! drives its event stream until the session stops, dies, or is cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coordination::events::WorkloadEvent;
use coordination::merge::{MergeCycle, MergeResolution, StopDecision};
use coordination::workload::Workload;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approvals::ApprovalBroker;
use crate::engine::{
    AgentControl, AgentEngine, AgentIdentity, EngineEvent, SessionHandle, SessionRequest,
    StopReply,
};
use crate::error::WorkloadResult;
use crate::merge_coordinator::MergeCoordinator;
use crate::store::WorkloadStore;
use crate::transport::{notify, ChatTransport};

/// How a driven session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The agent stopped and the merge cycle resolved.
    Finished {
        resolution: MergeResolution,
        /// Final result text the agent reported with its stop-intent.
        result: Option<String>,
    },
    /// The engine died outside the stop path.
    Abnormal {
        reason: String,
        transcript: Vec<String>,
    },
    Cancelled,
}

/// Per-session inputs to [`SessionRunner::drive`].
pub struct SessionContext {
    pub workload: Workload,
    pub worktree: PathBuf,
    pub trunk: String,
    pub broker: Arc<ApprovalBroker>,
    pub cancel: CancellationToken,
}

pub struct SessionRunner {
    engine: Arc<dyn AgentEngine>,
    merger: Arc<MergeCoordinator>,
    store: Arc<dyn WorkloadStore>,
    transport: Arc<dyn ChatTransport>,
    heartbeat: Duration,
    max_merge_retries: u32,
    email_domain: String,
}

impl SessionRunner {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        merger: Arc<MergeCoordinator>,
        store: Arc<dyn WorkloadStore>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            engine,
            merger,
            store,
            transport,
            heartbeat: Duration::from_secs(1),
            max_merge_retries: coordination::DEFAULT_MAX_MERGE_RETRIES,
            email_domain: "team-agent".to_string(),
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn with_max_merge_retries(mut self, max: u32) -> Self {
        self.max_merge_retries = max;
        self
    }

    pub fn with_email_domain(mut self, domain: impl Into<String>) -> Self {
        self.email_domain = domain.into();
        self
    }

    /// Start a fresh session, or resume the recorded one.
    ///
    /// A fresh session opens with the workload prompt (plus `message` when
    /// given). A resumed session receives only `message`, or nothing.
    pub async fn start_or_resume(
        &self,
        workload: &Workload,
        worktree: &Path,
        message: Option<String>,
    ) -> WorkloadResult<SessionHandle> {
        let initial_prompt = match (&workload.session_id, message) {
            (None, None) => Some(initial_prompt(workload)),
            (None, Some(message)) => Some(format!("{}\n\n{message}", initial_prompt(workload))),
            (Some(_), message) => message,
        };

        let request = SessionRequest {
            workload_id: workload.id,
            session_id: workload.session_id.clone(),
            working_dir: worktree.to_path_buf(),
            system_prompt: system_prompt(workload, worktree),
            initial_prompt,
            permission_mode: workload.permission_mode,
            identity: AgentIdentity::for_agent(&workload.agent, &self.email_domain),
        };
        info!(
            workload_id = %workload.id,
            resume = workload.session_id.is_some(),
            "Starting agent session"
        );
        Ok(self.engine.start(request).await?)
    }

    /// Drive the session's events until it ends.
    pub async fn drive(&self, ctx: &SessionContext, handle: SessionHandle) -> SessionOutcome {
        let SessionHandle {
            control,
            mut events,
        } = handle;
        let workload = &ctx.workload;
        let mut cycle = MergeCycle::new(&workload.branch, &ctx.trunk, self.max_merge_retries);
        let mut approvals = JoinSet::new();
        let mut turn_active = false;
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = ctx.cancel.cancelled() => {
                    info!(workload_id = %workload.id, "Session cancelled");
                    if let Err(e) = control.kill().await {
                        warn!(workload_id = %workload.id, "Failed to kill session: {e}");
                    }
                    return SessionOutcome::Cancelled;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        return SessionOutcome::Abnormal {
                            reason: "agent event stream closed".to_string(),
                            transcript: Vec::new(),
                        };
                    };
                    match event {
                        EngineEvent::SessionStarted { session_id } => {
                            self.record_session_id(workload, &session_id).await;
                        }
                        EngineEvent::TurnStarted => turn_active = true,
                        EngineEvent::TurnComplete => turn_active = false,
                        EngineEvent::Message { content } => {
                            notify(self.transport.as_ref(), WorkloadEvent::AgentMessage {
                                workload_id: workload.id,
                                agent: workload.agent.clone(),
                                room_id: workload.room_id.clone(),
                                content,
                                timestamp: Utc::now(),
                            }).await;
                        }
                        EngineEvent::TurnProgress { detail } => {
                            self.progress(workload, detail).await;
                        }
                        EngineEvent::ToolApprovalRequest { request_id, tool_name, input } => {
                            self.on_tool_request(ctx, &control, &mut approvals, request_id, tool_name, input).await;
                        }
                        EngineEvent::StopIntent { result } => {
                            turn_active = false;
                            match self.on_stop_intent(&mut cycle, workload).await {
                                StopDecision::Continue { message } => {
                                    if let Err(e) = control.resolve_stop(StopReply::Continue { message }).await {
                                        warn!(workload_id = %workload.id, "Failed to send continuation: {e}");
                                    }
                                }
                                StopDecision::ConfirmStop(resolution) => {
                                    if let Err(e) = control.resolve_stop(StopReply::Confirm).await {
                                        warn!(workload_id = %workload.id, "Failed to confirm stop: {e}");
                                    }
                                    return SessionOutcome::Finished { resolution, result };
                                }
                            }
                        }
                        EngineEvent::AbnormalExit { reason, transcript } => {
                            warn!(workload_id = %workload.id, %reason, "Agent session exited abnormally");
                            return SessionOutcome::Abnormal { reason, transcript };
                        }
                    }
                }

                Some(joined) = approvals.join_next(), if !approvals.is_empty() => {
                    if let Err(e) = joined {
                        warn!(workload_id = %workload.id, "Approval task failed: {e}");
                    }
                }

                _ = heartbeat.tick(), if turn_active => {
                    self.progress(workload, "working".to_string()).await;
                }
            }
        }
    }

    async fn record_session_id(&self, workload: &Workload, session_id: &str) {
        let mut accepted = true;
        let result = self
            .store
            .modify(&workload.id, &mut |w| {
                accepted = w.record_session_id(session_id);
            })
            .await;
        match result {
            Ok(_) if accepted => debug!(workload_id = %workload.id, session_id, "Session id recorded"),
            Ok(_) => warn!(
                workload_id = %workload.id,
                session_id,
                "Engine reported a different session id; keeping the original"
            ),
            Err(e) => warn!(workload_id = %workload.id, "Failed to record session id: {e}"),
        }
    }

    async fn progress(&self, workload: &Workload, detail: String) {
        notify(
            self.transport.as_ref(),
            WorkloadEvent::TurnProgress {
                workload_id: workload.id,
                detail,
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    async fn on_tool_request(
        &self,
        ctx: &SessionContext,
        control: &Arc<dyn AgentControl>,
        approvals: &mut JoinSet<()>,
        request_id: String,
        tool_name: String,
        input: Value,
    ) {
        let workload_id = ctx.workload.id;
        if let Some(verdict) = ctx.broker.preapproved(&tool_name, &input).await {
            if let Err(e) = control.resolve_tool_approval(&request_id, verdict).await {
                warn!(%workload_id, %request_id, "Failed to answer tool request: {e}");
            }
            return;
        }

        let pending = ctx.broker.register(&request_id, &tool_name, input).await;
        notify(
            self.transport.as_ref(),
            WorkloadEvent::ToolApprovalRequested {
                request: pending.request.clone(),
                room_id: ctx.workload.room_id.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;

        let broker = Arc::clone(&ctx.broker);
        let control = Arc::clone(control);
        let transport = Arc::clone(&self.transport);
        let cancel = ctx.cancel.clone();
        approvals.spawn(async move {
            let verdict = broker.await_decision(pending, &cancel).await;
            let allowed = verdict.is_allow();
            if let Err(e) = control.resolve_tool_approval(&request_id, verdict).await {
                warn!(%workload_id, %request_id, "Failed to answer tool request: {e}");
            }
            notify(
                transport.as_ref(),
                WorkloadEvent::ToolApprovalResolved {
                    workload_id,
                    request_id,
                    allowed,
                    timestamp: Utc::now(),
                },
            )
            .await;
        });
    }

    async fn on_stop_intent(&self, cycle: &mut MergeCycle, workload: &Workload) -> StopDecision {
        let decision = match self.merger.on_stop_intent(cycle, workload).await {
            Ok(decision) => decision,
            Err(e) => StopDecision::ConfirmStop(MergeResolution::Failed {
                cause: e.to_string(),
            }),
        };

        let retries = cycle.retries();
        if let Err(e) = self
            .store
            .modify(&workload.id, &mut |w| w.merge_retries = retries)
            .await
        {
            warn!(workload_id = %workload.id, "Failed to record merge retries: {e}");
        }

        match &decision {
            StopDecision::Continue { .. } => {
                self.progress(
                    workload,
                    format!(
                        "Merge conflict (attempt {retries} of {}); asked the agent to rebase",
                        cycle.max_retries()
                    ),
                )
                .await;
            }
            StopDecision::ConfirmStop(resolution) => {
                notify(
                    self.transport.as_ref(),
                    WorkloadEvent::MergeFinished {
                        workload_id: workload.id,
                        branch: workload.branch.clone(),
                        trunk: cycle.trunk().to_string(),
                        resolution: resolution.clone(),
                        timestamp: Utc::now(),
                    },
                )
                .await;
            }
        }
        decision
    }
}

/// First prompt of a fresh session.
pub fn initial_prompt(workload: &Workload) -> String {
    let mut prompt = format!("# Workload: {}\n\n{}\n", workload.title, workload.description);
    if let Some(background) = workload.background.as_deref().filter(|b| !b.trim().is_empty()) {
        prompt.push_str(&format!("\n## Background Context\n\n{background}\n"));
    }
    prompt.push_str("\nPlease work through this task. Commit your changes when appropriate.");
    prompt
}

/// Standing instructions for every session of a workload.
pub fn system_prompt(workload: &Workload, worktree: &Path) -> String {
    format!(
        "You are {agent}, working on workload \"{title}\".\n\n\
         You are working in an isolated git worktree at {path} on branch `{branch}`. \
         Other agents work in parallel on their own branches; do not touch files \
         outside this directory.\n\n\
         When your task is complete, stop. Your branch is merged automatically; if \
         the merge conflicts you will be asked to rebase and try again.",
        agent = workload.agent,
        title = workload.title,
        path = worktree.display(),
        branch = workload.branch,
    )
}
