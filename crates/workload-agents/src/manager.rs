//! Workload manager
//!
//! Owns workload lifecycles: creates records, gates starts on repository
//! ownership, provisions worktrees, runs sessions, and maps how a session
//! ended onto the workload status. At most one live session exists per
//! workload; the slot is claimed atomically before anything is started.
//!
//! ```text
//! dispatch ─▶ Assigned ─▶ Running ─┬─▶ Completed      (merged, worktree removed)
//!                            ▲     ├─▶ NeedsAttention (conflicts, failure, crash)
//!             resume ────────┘     └─▶ Cancelled      (worktree kept)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use coordination::approval::{ApprovalDecision, ApprovalStore, JsonApprovalStore};
use coordination::events::{EventBus, WorkloadEvent};
use coordination::git::GitRunner;
use coordination::merge::MergeResolution;
use coordination::ownership::{OwnershipVerdict, RepoOwnershipGuard};
use coordination::repo_lock::RepoLocks;
use coordination::workload::{PermissionMode, Workload, WorkloadId, WorkloadStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approvals::ApprovalBroker;
use crate::config::AgentsConfig;
use crate::engine::{AgentControl, AgentEngine, ProcessEngine};
use crate::error::{WorkloadError, WorkloadResult};
use crate::merge_coordinator::MergeCoordinator;
use crate::session_runner::{SessionContext, SessionOutcome, SessionRunner};
use crate::store::{InMemoryWorkloadStore, WorkloadStore};
use crate::transport::{notify, BusTransport, ChatTransport};
use crate::worktree_bridge::WorktreeController;

/// A request to hand new work to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub agent: String,
    pub title: String,
    pub description: String,
    pub background: Option<String>,
    pub room_id: Option<String>,
    pub main_chat_id: Option<String>,
    pub permission_mode: PermissionMode,
}

impl DispatchRequest {
    pub fn new(
        agent: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            title: title.into(),
            description: description.into(),
            background: None,
            room_id: None,
            main_chat_id: None,
            permission_mode: PermissionMode::default(),
        }
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    pub fn with_chat(mut self, room_id: Option<String>, main_chat_id: Option<String>) -> Self {
        self.room_id = room_id;
        self.main_chat_id = main_chat_id;
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }
}

/// How a human message reached its workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to the live session.
    Delivered,
    /// Session is starting; delivered once it is attached.
    Queued,
    /// Workload was idle; a new session was started with the message.
    Resumed,
}

struct LiveSession {
    cancel: CancellationToken,
    control: Option<Arc<dyn AgentControl>>,
    broker: Option<Arc<ApprovalBroker>>,
    pending_prompts: Vec<String>,
    pending_interrupt: bool,
    /// Closes when the pipeline task has finished.
    done: watch::Receiver<()>,
}

struct Inner {
    config: AgentsConfig,
    guard: Arc<RepoOwnershipGuard>,
    worktrees: Arc<WorktreeController>,
    runner: SessionRunner,
    store: Arc<dyn WorkloadStore>,
    transport: Arc<dyn ChatTransport>,
    approvals: Arc<dyn ApprovalStore>,
    sessions: Mutex<HashMap<WorkloadId, LiveSession>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct WorkloadManager {
    inner: Arc<Inner>,
}

pub struct WorkloadManagerBuilder {
    config: AgentsConfig,
    engine: Option<Arc<dyn AgentEngine>>,
    transport: Option<Arc<dyn ChatTransport>>,
    store: Option<Arc<dyn WorkloadStore>>,
    approvals: Option<Arc<dyn ApprovalStore>>,
}

impl WorkloadManagerBuilder {
    pub fn engine(mut self, engine: Arc<dyn AgentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn WorkloadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn approvals(mut self, approvals: Arc<dyn ApprovalStore>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub async fn build(self) -> WorkloadResult<WorkloadManager> {
        let config = self.config;

        let engine: Arc<dyn AgentEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(ProcessEngine::from_command(&config.engine_command)?),
        };
        let transport: Arc<dyn ChatTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(BusTransport::new(EventBus::new().shared())),
        };
        let store: Arc<dyn WorkloadStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryWorkloadStore::new()),
        };
        let approvals: Arc<dyn ApprovalStore> = match self.approvals {
            Some(approvals) => approvals,
            None => Arc::new(JsonApprovalStore::new(&config.clone_path)),
        };

        let git = GitRunner::new()
            .with_timeout(config.git_timeout())
            .with_retry(config.retry_policy());
        let locks = RepoLocks::new();

        let guard = Arc::new(
            RepoOwnershipGuard::new(config.identity(), &config.clone_path, git.clone())
                .with_locks(locks.clone()),
        );
        let worktrees = Arc::new(
            WorktreeController::open(
                &config.clone_path,
                config.resolved_worktree_base(),
                git.clone(),
            )
            .await?
            .with_default_branch(&config.default_branch),
        );
        let merger = Arc::new(
            MergeCoordinator::new(
                Arc::clone(&worktrees),
                git.with_timeout(config.merge_timeout()),
                locks,
            )
            .with_email_domain(&config.agent_email_domain),
        );
        let runner = SessionRunner::new(engine, merger, Arc::clone(&store), Arc::clone(&transport))
            .with_heartbeat(config.heartbeat_interval())
            .with_max_merge_retries(config.max_merge_retries)
            .with_email_domain(&config.agent_email_domain);

        info!(
            env = %config.env,
            project_id = %config.project_id,
            clone = %config.clone_path.display(),
            worktrees = %worktrees.base_dir().display(),
            "Workload manager ready"
        );

        Ok(WorkloadManager {
            inner: Arc::new(Inner {
                config,
                guard,
                worktrees,
                runner,
                store,
                transport,
                approvals,
                sessions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl WorkloadManager {
    pub fn builder(config: AgentsConfig) -> WorkloadManagerBuilder {
        WorkloadManagerBuilder {
            config,
            engine: None,
            transport: None,
            store: None,
            approvals: None,
        }
    }

    pub fn config(&self) -> &AgentsConfig {
        &self.inner.config
    }

    pub fn guard(&self) -> &RepoOwnershipGuard {
        &self.inner.guard
    }

    pub fn worktrees(&self) -> &WorktreeController {
        &self.inner.worktrees
    }

    pub async fn get(&self, id: WorkloadId) -> WorkloadResult<Workload> {
        self.inner
            .store
            .get(&id)
            .await?
            .ok_or(WorkloadError::NotFound(id))
    }

    pub async fn list(&self) -> WorkloadResult<Vec<Workload>> {
        self.inner.store.list().await
    }

    pub fn has_live_session(&self, id: WorkloadId) -> bool {
        self.sessions().contains_key(&id)
    }

    /// Create a workload for an agent and start its first session.
    pub async fn dispatch(&self, request: DispatchRequest) -> WorkloadResult<Workload> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WorkloadError::ShuttingDown);
        }
        let config = &self.inner.config;
        if !config.agents.is_empty() && !config.is_known_agent(&request.agent) {
            return Err(WorkloadError::UnknownAgent(request.agent));
        }
        self.gate().await?;

        let mut workload = Workload::new(&request.agent, &request.title, &request.description)
            .with_permission_mode(request.permission_mode);
        workload.background = request.background;
        workload.room_id = request.room_id;
        workload.main_chat_id = request.main_chat_id;
        let id = workload.id;

        self.inner.store.insert(workload.clone()).await?;
        info!(workload_id = %id, agent = %workload.agent, title = %workload.title, "Workload dispatched");
        notify(
            self.inner.transport.as_ref(),
            WorkloadEvent::WorkloadAssigned {
                workload_id: id,
                agent: workload.agent.clone(),
                title: workload.title.clone(),
                branch: workload.branch.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;

        let (cancel, done) = self.claim_slot(id)?;
        self.spawn_pipeline(id, None, cancel, done);
        Ok(workload)
    }

    /// Start a new run cycle of an idle workload in its existing worktree and
    /// session. `message` becomes the session's next prompt.
    pub async fn resume(
        &self,
        id: WorkloadId,
        message: Option<String>,
    ) -> WorkloadResult<Workload> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WorkloadError::ShuttingDown);
        }
        let workload = self.get(id).await?;
        if !workload.status.is_resumable() {
            return Err(WorkloadError::NotResumable {
                id,
                status: workload.status,
            });
        }

        let (cancel, done) = self.claim_slot(id)?;
        // Another resume may have finished a whole cycle before the slot was ours.
        let prepared = async {
            let workload = self.get(id).await?;
            if !workload.status.is_resumable() {
                return Err(WorkloadError::NotResumable {
                    id,
                    status: workload.status,
                });
            }
            self.gate().await?;
            self.inner.store.modify(&id, &mut |w| w.begin_cycle()).await
        }
        .await;

        match prepared {
            Ok(workload) => {
                info!(workload_id = %id, with_message = message.is_some(), "Workload resumed");
                self.spawn_pipeline(id, message, cancel, done);
                Ok(workload)
            }
            Err(e) => {
                self.sessions().remove(&id);
                Err(e)
            }
        }
    }

    /// Stop the live session, if any, and wait for it to wind down. The
    /// worktree is kept.
    pub async fn cancel(&self, id: WorkloadId) -> WorkloadResult<Workload> {
        let live = self
            .sessions()
            .get(&id)
            .map(|s| (s.cancel.clone(), s.control.clone(), s.done.clone()));

        match live {
            Some((cancel, control, mut done)) => {
                info!(workload_id = %id, "Cancelling workload");
                cancel.cancel();
                if let Some(control) = control {
                    if let Err(e) = control.kill().await {
                        warn!(workload_id = %id, "Failed to kill session: {e}");
                    }
                }
                while done.changed().await.is_ok() {}
                // A merge already in flight is not aborted; the result may be Completed.
                self.get(id).await
            }
            None => {
                let workload = self.get(id).await?;
                if workload.status == WorkloadStatus::Cancelled {
                    return Ok(workload);
                }
                self.set_status(id, WorkloadStatus::Cancelled, "cancelled by user")
                    .await
            }
        }
    }

    /// Ask the agent to wrap up its current turn. The session and status are
    /// kept. A session that is still starting is interrupted once attached.
    pub async fn interrupt(&self, id: WorkloadId) -> WorkloadResult<()> {
        let control = {
            let mut sessions = self.sessions();
            let slot = sessions
                .get_mut(&id)
                .ok_or(WorkloadError::NoLiveSession(id))?;
            let control = match &slot.control {
                Some(control) => Some(Arc::clone(control)),
                None => {
                    slot.pending_interrupt = true;
                    None
                }
            };
            control
        };

        match control {
            Some(control) => {
                control.interrupt().await?;
                info!(workload_id = %id, "Interrupted current turn");
            }
            None => info!(workload_id = %id, "Interrupt queued for starting session"),
        }
        Ok(())
    }

    /// Route a human message to a workload, resuming it if it is idle.
    pub async fn send_message(&self, id: WorkloadId, text: &str) -> WorkloadResult<Delivery> {
        enum Target {
            Live(Arc<dyn AgentControl>),
            Queued,
            Idle,
        }

        let target = {
            let mut sessions = self.sessions();
            let target = match sessions.get_mut(&id) {
                Some(slot) => match &slot.control {
                    Some(control) => Target::Live(Arc::clone(control)),
                    None => {
                        slot.pending_prompts.push(text.to_string());
                        Target::Queued
                    }
                },
                None => Target::Idle,
            };
            target
        };

        match target {
            Target::Live(control) => {
                control.send_prompt(text).await?;
                debug!(workload_id = %id, "Message delivered to live session");
                Ok(Delivery::Delivered)
            }
            Target::Queued => {
                debug!(workload_id = %id, "Message queued for starting session");
                Ok(Delivery::Queued)
            }
            Target::Idle => {
                self.resume(id, Some(text.to_string())).await?;
                Ok(Delivery::Resumed)
            }
        }
    }

    /// Deliver a human decision for a pending tool approval.
    pub fn resolve_tool_approval(
        &self,
        id: WorkloadId,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> WorkloadResult<()> {
        let broker = self
            .sessions()
            .get(&id)
            .and_then(|s| s.broker.clone())
            .ok_or(WorkloadError::NoLiveSession(id))?;
        broker.resolve(request_id, decision)?;
        info!(workload_id = %id, request_id, "Tool approval resolved");
        Ok(())
    }

    /// Pull and re-validate ownership; the only way out of lockdown.
    pub async fn refresh_ownership(&self) -> OwnershipVerdict {
        let was_locked = self.inner.guard.lockdown().locked;
        let verdict = self.inner.guard.refresh().await;
        let state = self.inner.guard.lockdown();
        if state.locked != was_locked {
            notify(
                self.inner.transport.as_ref(),
                WorkloadEvent::LockdownChanged {
                    locked: state.locked,
                    reason: state.reason,
                    timestamp: Utc::now(),
                },
            )
            .await;
        }
        verdict
    }

    /// Kill every live session and wait for their pipelines. Interrupted
    /// workloads end in NeedsAttention so they can be resumed.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let live: Vec<_> = self
            .sessions()
            .values()
            .map(|s| (s.control.clone(), s.done.clone()))
            .collect();
        info!(sessions = live.len(), "Shutting down workload manager");

        for (control, _) in &live {
            if let Some(control) = control {
                if let Err(e) = control.kill().await {
                    warn!("Failed to kill session during shutdown: {e}");
                }
            }
        }
        for (_, mut done) in live {
            while done.changed().await.is_ok() {}
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn sessions(&self) -> MutexGuard<'_, HashMap<WorkloadId, LiveSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim_slot(
        &self,
        id: WorkloadId,
    ) -> WorkloadResult<(CancellationToken, watch::Sender<()>)> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&id) {
            return Err(WorkloadError::SessionActive(id));
        }
        let cancel = self.inner.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(());
        sessions.insert(
            id,
            LiveSession {
                cancel: cancel.clone(),
                control: None,
                broker: None,
                pending_prompts: Vec::new(),
                pending_interrupt: false,
                done: done_rx,
            },
        );
        Ok((cancel, done_tx))
    }

    async fn gate(&self) -> WorkloadResult<()> {
        let was_locked = self.inner.guard.lockdown().locked;
        match self.inner.guard.gate(false).await {
            Ok(status) => {
                debug!(?status, "Ownership verified");
                Ok(())
            }
            Err(e) => {
                if e.is_locked() && !was_locked {
                    notify(
                        self.inner.transport.as_ref(),
                        WorkloadEvent::LockdownChanged {
                            locked: true,
                            reason: self.inner.guard.lockdown().reason,
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
                }
                warn!("Workload start refused: {e}");
                Err(e.into())
            }
        }
    }

    fn spawn_pipeline(
        &self,
        id: WorkloadId,
        message: Option<String>,
        cancel: CancellationToken,
        done: watch::Sender<()>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_pipeline(id, message, &cancel).await {
                error!(workload_id = %id, "Workload pipeline failed: {e}");
                this.finish(id, WorkloadStatus::NeedsAttention, &e.to_string())
                    .await;
            }
            this.sessions().remove(&id);
            drop(done);
        });
    }

    async fn run_pipeline(
        &self,
        id: WorkloadId,
        message: Option<String>,
        cancel: &CancellationToken,
    ) -> WorkloadResult<()> {
        let reason = match self.get(id).await?.status {
            WorkloadStatus::Assigned => "session starting",
            _ => "resumed",
        };
        let workload = self.set_status(id, WorkloadStatus::Running, reason).await?;

        let worktree = match self.inner.worktrees.ensure(&workload).await {
            Ok(path) => path,
            Err(e) => {
                let reason = format!("Failed to prepare worktree: {e}");
                self.conclude_failure(&workload, &reason).await;
                return Ok(());
            }
        };
        if cancel.is_cancelled() {
            return self.conclude(&workload, "", SessionOutcome::Cancelled).await;
        }

        let trunk = self.inner.worktrees.trunk().await;
        let broker = Arc::new(
            ApprovalBroker::new(
                id,
                workload.permission_mode,
                &worktree,
                Arc::clone(&self.inner.approvals),
            )
            .with_timeout(self.inner.config.approval_timeout()),
        );

        let handle = match self
            .inner
            .runner
            .start_or_resume(&workload, &worktree, message)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let reason = format!("Failed to start agent session: {e}");
                self.conclude_failure(&workload, &reason).await;
                return Ok(());
            }
        };

        let (queued, interrupt) = {
            let mut sessions = self.sessions();
            let queued = match sessions.get_mut(&id) {
                Some(slot) => {
                    slot.control = Some(Arc::clone(&handle.control));
                    slot.broker = Some(Arc::clone(&broker));
                    (
                        std::mem::take(&mut slot.pending_prompts),
                        std::mem::take(&mut slot.pending_interrupt),
                    )
                }
                None => (Vec::new(), false),
            };
            queued
        };
        for prompt in queued {
            if let Err(e) = handle.control.send_prompt(&prompt).await {
                warn!(workload_id = %id, "Failed to deliver queued message: {e}");
            }
        }
        if interrupt {
            match handle.control.interrupt().await {
                Ok(()) => info!(workload_id = %id, "Delivered queued interrupt"),
                Err(e) => warn!(workload_id = %id, "Failed to deliver queued interrupt: {e}"),
            }
        }

        let ctx = SessionContext {
            workload: workload.clone(),
            worktree,
            trunk,
            broker,
            cancel: cancel.clone(),
        };
        let outcome = self.inner.runner.drive(&ctx, handle).await;
        self.conclude(&workload, &ctx.trunk, outcome).await
    }

    /// Map a session's end onto the workload status and tell the humans.
    async fn conclude(
        &self,
        workload: &Workload,
        trunk: &str,
        outcome: SessionOutcome,
    ) -> WorkloadResult<()> {
        let id = workload.id;
        match outcome {
            SessionOutcome::Finished { resolution, result } => {
                if resolution.landed() {
                    self.set_status(id, WorkloadStatus::Completed, "merged")
                        .await?;
                    self.summarize(
                        workload,
                        format!("has finished and its changes have been merged to {trunk}."),
                        result.as_deref(),
                    )
                    .await;
                    self.post_merge_check().await;
                } else {
                    let (reason, text) = match &resolution {
                        MergeResolution::Exhausted { retries } => (
                            format!("merge conflicts persisted after {retries} attempts"),
                            format!(
                                "has finished, but merge conflicts could not be resolved \
                                 automatically. Changes remain on branch `{}`.",
                                workload.branch
                            ),
                        ),
                        MergeResolution::Failed { cause } => (
                            format!("merge failed: {cause}"),
                            "has finished and needs attention.".to_string(),
                        ),
                        MergeResolution::Merged | MergeResolution::NothingToMerge => (
                            "merge did not land".to_string(),
                            "has finished and needs attention.".to_string(),
                        ),
                    };
                    self.set_status(id, WorkloadStatus::NeedsAttention, &reason)
                        .await?;
                    self.summarize(workload, text, result.as_deref()).await;
                }
            }
            SessionOutcome::Abnormal { reason, transcript } => {
                notify(
                    self.inner.transport.as_ref(),
                    WorkloadEvent::SessionAbnormalExit {
                        workload_id: id,
                        reason: reason.clone(),
                        transcript_tail: transcript,
                        timestamp: Utc::now(),
                    },
                )
                .await;
                self.conclude_failure(workload, &reason).await;
            }
            SessionOutcome::Cancelled => {
                if self.inner.shutdown.is_cancelled() {
                    self.set_status(
                        id,
                        WorkloadStatus::NeedsAttention,
                        "interrupted by shutdown",
                    )
                    .await?;
                } else {
                    self.set_status(id, WorkloadStatus::Cancelled, "cancelled by user")
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn conclude_failure(&self, workload: &Workload, reason: &str) {
        warn!(workload_id = %workload.id, %reason, "Workload needs attention");
        self.finish(workload.id, WorkloadStatus::NeedsAttention, reason)
            .await;
        self.summarize(workload, "has finished and needs attention.".to_string(), None)
            .await;
    }

    /// Best-effort status change for error paths.
    async fn finish(&self, id: WorkloadId, to: WorkloadStatus, reason: &str) {
        if let Err(e) = self.set_status(id, to, reason).await {
            warn!(workload_id = %id, "Could not record final status {to}: {e}");
        }
    }

    async fn set_status(
        &self,
        id: WorkloadId,
        to: WorkloadStatus,
        reason: &str,
    ) -> WorkloadResult<Workload> {
        let mut applied = Ok(to);
        let workload = self
            .inner
            .store
            .modify(&id, &mut |w| {
                let from = w.status;
                applied = w.transition(to, Some(reason)).map(|()| from);
            })
            .await?;
        let from = applied?;

        notify(
            self.inner.transport.as_ref(),
            WorkloadEvent::status_changed(id, from, to, Some(reason)),
        )
        .await;
        Ok(workload)
    }

    async fn summarize(&self, workload: &Workload, text: String, result: Option<&str>) {
        let mut content = format!("Workload **{}** {text}", workload.title);
        if let Some(result) = result.filter(|r| !r.trim().is_empty()) {
            content.push_str(&format!("\n\nSummary: {result}"));
        }
        notify(
            self.inner.transport.as_ref(),
            WorkloadEvent::WorkloadSummary {
                workload_id: workload.id,
                main_chat_id: workload.main_chat_id.clone(),
                agent: workload.agent.clone(),
                content,
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Re-check ownership after trunk moved; a failure locks the project for
    /// future starts without touching the completed workload.
    async fn post_merge_check(&self) {
        if let OwnershipVerdict::Locked { reason } = self.inner.guard.check(false).await {
            warn!(%reason, "Ownership check failed after merge, project locked");
            notify(
                self.inner.transport.as_ref(),
                WorkloadEvent::LockdownChanged {
                    locked: true,
                    reason: Some(reason),
                    timestamp: Utc::now(),
                },
            )
            .await;
        }
    }
}
