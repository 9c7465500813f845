//! End-to-end workload lifecycles against real git repositories.
//!
//! The agent engine is replaced by a scripted double: each started session is
//! handed to the test, which emits engine events and observes the runtime's
//! replies. Everything else (worktrees, merges, ownership, approvals) is real.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordination::approval::{ApprovalDecision, ToolVerdict};
use coordination::events::{EventBus, WorkloadEvent};
use coordination::git::GitRunner;
use coordination::ownership::{CallerIdentity, RepoOwnershipGuard};
use coordination::resilience::RetryPolicy;
use coordination::workload::{Workload, WorkloadId, WorkloadStatus};
use mockall::mock;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use workload_agents::engine::{
    AgentControl, AgentEngine, EngineError, EngineEvent, SessionHandle, SessionRequest, StopReply,
};
use workload_agents::listener::{AuthorKind, ChatMessage};
use workload_agents::transport::ChatTransport;
use workload_agents::{
    AgentsConfig, BusTransport, Delivery, DispatchRequest, InboundEvent, Listener, WorkloadError,
    WorkloadManager, WorkloadResult,
};

const WAIT: Duration = Duration::from_secs(15);

fn git(cwd: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn commit_all(cwd: &Path, message: &str) {
    git(cwd, &["add", "-A"]);
    git(
        cwd,
        &[
            "-c",
            "user.name=Test User",
            "-c",
            "user.email=test@test.com",
            "commit",
            "-m",
            message,
        ],
    );
}

// ─── Scripted engine ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Prompt(String),
    Tool { request_id: String, verdict: ToolVerdict },
    Stop(StopReply),
    Interrupt,
    Kill,
}

struct ScriptedControl {
    calls: mpsc::UnboundedSender<Call>,
}

#[async_trait]
impl AgentControl for ScriptedControl {
    async fn send_prompt(&self, text: &str) -> Result<(), EngineError> {
        self.calls
            .send(Call::Prompt(text.to_string()))
            .map_err(|_| EngineError::Closed)
    }

    async fn resolve_tool_approval(
        &self,
        request_id: &str,
        verdict: ToolVerdict,
    ) -> Result<(), EngineError> {
        self.calls
            .send(Call::Tool {
                request_id: request_id.to_string(),
                verdict,
            })
            .map_err(|_| EngineError::Closed)
    }

    async fn resolve_stop(&self, reply: StopReply) -> Result<(), EngineError> {
        self.calls
            .send(Call::Stop(reply))
            .map_err(|_| EngineError::Closed)
    }

    async fn interrupt(&self) -> Result<(), EngineError> {
        self.calls
            .send(Call::Interrupt)
            .map_err(|_| EngineError::Closed)
    }

    async fn kill(&self) -> Result<(), EngineError> {
        let _ = self.calls.send(Call::Kill);
        Ok(())
    }
}

/// One started session, as seen by the test.
struct Session {
    request: SessionRequest,
    events: mpsc::Sender<EngineEvent>,
    calls: mpsc::UnboundedReceiver<Call>,
}

impl Session {
    fn worktree(&self) -> &Path {
        &self.request.working_dir
    }

    async fn emit(&self, event: EngineEvent) {
        self.events.send(event).await.expect("runner dropped events");
    }

    async fn next_call(&mut self) -> Call {
        timeout(WAIT, self.calls.recv())
            .await
            .expect("timed out waiting for engine call")
            .expect("control dropped")
    }

    async fn stop(&mut self, result: Option<&str>) -> Call {
        self.emit(EngineEvent::StopIntent {
            result: result.map(String::from),
        })
        .await;
        self.next_call().await
    }
}

struct ScriptedEngine {
    sessions: mpsc::UnboundedSender<Session>,
    /// Held by a test to keep `start` from returning.
    hold: Arc<Mutex<()>>,
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn start(&self, request: SessionRequest) -> Result<SessionHandle, EngineError> {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        self.sessions
            .send(Session {
                request,
                events: event_tx,
                calls: call_rx,
            })
            .map_err(|_| EngineError::Closed)?;
        drop(self.hold.lock().await);
        Ok(SessionHandle {
            control: Arc::new(ScriptedControl { calls: call_tx }),
            events: event_rx,
        })
    }
}

// ─── Harness ─────────────────────────────────────────────────────────

struct Harness {
    root: TempDir,
    origin: PathBuf,
    clone: PathBuf,
    manager: WorkloadManager,
    sessions: mpsc::UnboundedReceiver<Session>,
    events: broadcast::Receiver<WorkloadEvent>,
    engine_hold: Arc<Mutex<()>>,
}

impl Harness {
    async fn new() -> Self {
        let bus = EventBus::new().shared();
        let events = bus.subscribe();
        Self::with_transport(Arc::new(BusTransport::new(bus)), events).await
    }

    async fn with_transport(
        transport: Arc<dyn ChatTransport>,
        events: broadcast::Receiver<WorkloadEvent>,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let seed = root.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-b", "main"]);
        std::fs::write(seed.join("README.md"), "# shared\n").unwrap();
        commit_all(&seed, "Initial commit");

        let origin = root.path().join("origin.git");
        git(
            root.path(),
            &["clone", "--bare", "seed", origin.to_str().unwrap()],
        );
        let clone = root.path().join("clone");
        git(
            root.path(),
            &["clone", origin.to_str().unwrap(), clone.to_str().unwrap()],
        );

        let config = AgentsConfig {
            env: "dev-A".into(),
            project_id: "p-a".into(),
            project_name: "alpha".into(),
            clone_path: clone.clone(),
            worktree_base: Some(root.path().join("worktrees")),
            default_branch: "main".into(),
            git_max_retries: 0,
            max_merge_retries: 2,
            approval_timeout_secs: None,
            heartbeat_interval_ms: 60_000,
            agents: vec!["Ada".into()],
            ..AgentsConfig::default()
        };

        let (session_tx, sessions) = mpsc::unbounded_channel();
        let engine_hold = Arc::new(Mutex::new(()));
        let manager = WorkloadManager::builder(config)
            .engine(Arc::new(ScriptedEngine {
                sessions: session_tx,
                hold: Arc::clone(&engine_hold),
            }))
            .transport(transport)
            .build()
            .await
            .expect("manager");

        Self {
            root,
            origin,
            clone,
            manager,
            sessions,
            events,
            engine_hold,
        }
    }

    async fn dispatch(&self, title: &str) -> Workload {
        self.manager
            .dispatch(
                DispatchRequest::new("Ada", title, format!("{title}, please"))
                    .with_chat(Some("room-1".into()), Some("main-chat".into())),
            )
            .await
            .expect("dispatch")
    }

    async fn next_session(&mut self) -> Session {
        timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a session")
            .expect("engine dropped")
    }

    async fn wait_for(&self, id: WorkloadId, status: WorkloadStatus) -> Workload {
        let deadline = Instant::now() + WAIT;
        loop {
            let workload = self.manager.get(id).await.unwrap();
            if workload.status == status && !self.manager.has_live_session(id) {
                return workload;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {status}, still {}",
                workload.status
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn expect_event(&mut self, event_type: &str) -> WorkloadEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Ok(event)) if event.event_type() == event_type => return event,
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(e)) => panic!("event bus closed: {e}"),
                Err(_) => panic!("timed out waiting for {event_type}"),
            }
        }
    }

    /// Next session, once the runner is driving it (control attached).
    async fn started(&mut self, session_id: &str) -> Session {
        let session = self.next_session().await;
        session
            .emit(EngineEvent::SessionStarted {
                session_id: session_id.into(),
            })
            .await;
        session
            .emit(EngineEvent::Message {
                content: "ready".into(),
            })
            .await;
        self.expect_event("agent_message").await;
        session
    }
}

// ─── Merge on stop ───────────────────────────────────────────────────

#[tokio::test]
async fn stop_intent_merges_and_completes() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Add feature").await;
    let mut session = h.started("s-1").await;

    let prompt = session.request.initial_prompt.clone().unwrap();
    assert!(prompt.starts_with("# Workload: Add feature"), "{prompt}");
    assert!(session.request.session_id.is_none());
    assert_eq!(session.request.identity.email, "ada@team-agent");

    std::fs::write(session.worktree().join("feature.txt"), "done\n").unwrap();
    assert_eq!(
        session.stop(Some("Added feature.txt")).await,
        Call::Stop(StopReply::Confirm)
    );

    let done = h.wait_for(workload.id, WorkloadStatus::Completed).await;
    assert_eq!(done.session_id.as_deref(), Some("s-1"));
    assert!(h.clone.join("feature.txt").exists());
    assert!(!h.manager.worktrees().exists(&workload.id));
    assert_eq!(
        git(&h.origin, &["rev-parse", "main"]),
        git(&h.clone, &["rev-parse", "HEAD"]),
        "trunk must be pushed"
    );

    match h.expect_event("workload_summary").await {
        WorkloadEvent::WorkloadSummary {
            content,
            main_chat_id,
            ..
        } => {
            assert!(content.contains("merged to main"), "{content}");
            assert!(content.ends_with("Summary: Added feature.txt"), "{content}");
            assert_eq!(main_chat_id.as_deref(), Some("main-chat"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn persistent_conflicts_need_attention() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Rewrite readme").await;
    let mut session = h.started("s-1").await;

    std::fs::write(session.worktree().join("README.md"), "# agent\n").unwrap();
    std::fs::write(h.clone.join("README.md"), "# trunk\n").unwrap();
    commit_all(&h.clone, "trunk edit");
    let trunk_head = git(&h.clone, &["rev-parse", "HEAD"]);

    for attempt in 1..=2 {
        match session.stop(None).await {
            Call::Stop(StopReply::Continue { message }) => {
                assert!(message.contains(&format!("attempt {attempt} of 2")), "{message}");
                assert!(message.contains("README.md"), "{message}");
                assert!(message.contains("git rebase main"), "{message}");
            }
            other => panic!("expected a continuation, got {other:?}"),
        }
    }
    assert_eq!(session.stop(None).await, Call::Stop(StopReply::Confirm));

    let stuck = h.wait_for(workload.id, WorkloadStatus::NeedsAttention).await;
    assert_eq!(stuck.merge_retries, 3);
    assert!(h.manager.worktrees().exists(&workload.id));
    assert_eq!(git(&h.clone, &["rev-parse", "HEAD"]), trunk_head);
    assert_eq!(git(&h.clone, &["status", "--porcelain"]), "");

    match h.expect_event("workload_summary").await {
        WorkloadEvent::WorkloadSummary { content, .. } => {
            assert!(content.contains("could not be resolved automatically"), "{content}");
            assert!(content.contains(&workload.branch), "{content}");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// ─── Cancel, interrupt, crash ────────────────────────────────────────

#[tokio::test]
async fn cancel_keeps_worktree() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Long task").await;
    let mut session = h.started("s-1").await;
    std::fs::write(session.worktree().join("wip.txt"), "half done\n").unwrap();

    let cancelled = h.manager.cancel(workload.id).await.unwrap();
    assert_eq!(cancelled.status, WorkloadStatus::Cancelled);
    assert_eq!(session.next_call().await, Call::Kill);
    assert!(!h.manager.has_live_session(workload.id));
    assert!(session.worktree().join("wip.txt").exists());

    assert!(matches!(
        h.manager.resume(workload.id, None).await,
        Err(WorkloadError::NotResumable { .. })
    ));
    // Cancelling again is a no-op.
    assert_eq!(
        h.manager.cancel(workload.id).await.unwrap().status,
        WorkloadStatus::Cancelled
    );
}

#[tokio::test]
async fn interrupt_keeps_session_running() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Explore").await;
    let mut session = h.started("s-1").await;
    session.emit(EngineEvent::TurnStarted).await;

    h.manager.interrupt(workload.id).await.unwrap();
    assert_eq!(session.next_call().await, Call::Interrupt);
    session.emit(EngineEvent::TurnComplete).await;

    let current = h.manager.get(workload.id).await.unwrap();
    assert_eq!(current.status, WorkloadStatus::Running);
    assert!(h.manager.has_live_session(workload.id));

    assert_eq!(
        h.manager.send_message(workload.id, "look at src/ too").await.unwrap(),
        Delivery::Delivered
    );
    assert_eq!(
        session.next_call().await,
        Call::Prompt("look at src/ too".into())
    );

    assert!(matches!(
        h.manager.interrupt(uuid::Uuid::new_v4()).await,
        Err(WorkloadError::NoLiveSession(_))
    ));
    h.manager.cancel(workload.id).await.unwrap();
}

#[tokio::test]
async fn interrupt_while_starting_is_delivered_once_attached() {
    let mut h = Harness::new().await;
    let hold = Arc::clone(&h.engine_hold).lock_owned().await;
    let workload = h.dispatch("Slow start").await;
    let mut session = h.next_session().await;

    // The engine has not returned control yet; the slot exists without it.
    assert!(h.manager.has_live_session(workload.id));
    h.manager.interrupt(workload.id).await.unwrap();
    assert_eq!(
        h.manager.send_message(workload.id, "and check the logs").await.unwrap(),
        Delivery::Queued
    );

    drop(hold);
    assert_eq!(
        session.next_call().await,
        Call::Prompt("and check the logs".into())
    );
    assert_eq!(session.next_call().await, Call::Interrupt);

    let current = h.manager.get(workload.id).await.unwrap();
    assert_eq!(current.status, WorkloadStatus::Running);
    h.manager.cancel(workload.id).await.unwrap();
}

#[tokio::test]
async fn shutdown_leaves_running_workloads_resumable() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Interrupted by restart").await;
    let mut session = h.started("s-1").await;
    std::fs::write(session.worktree().join("wip.txt"), "half done\n").unwrap();

    h.manager.shutdown().await;
    assert_eq!(session.next_call().await, Call::Kill);

    let parked = h.wait_for(workload.id, WorkloadStatus::NeedsAttention).await;
    let last = parked.transitions.last().expect("transition recorded");
    assert_eq!(last.reason.as_deref(), Some("interrupted by shutdown"));
    assert_eq!(parked.session_id.as_deref(), Some("s-1"));
    assert!(session.worktree().join("wip.txt").exists());
    assert!(!h.clone.join("wip.txt").exists(), "shutdown must not merge");

    assert!(matches!(
        h.manager.dispatch(DispatchRequest::new("Ada", "late", "d")).await,
        Err(WorkloadError::ShuttingDown)
    ));
}

#[tokio::test]
async fn abnormal_exit_needs_attention() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Fragile").await;
    let session = h.started("s-1").await;

    session
        .emit(EngineEvent::AbnormalExit {
            reason: "engine crashed".into(),
            transcript: vec!["thread panicked".into()],
        })
        .await;

    h.wait_for(workload.id, WorkloadStatus::NeedsAttention).await;
    assert!(h.manager.worktrees().exists(&workload.id));
    match h.expect_event("session_abnormal_exit").await {
        WorkloadEvent::SessionAbnormalExit {
            reason,
            transcript_tail,
            ..
        } => {
            assert_eq!(reason, "engine crashed");
            assert_eq!(transcript_tail, vec!["thread panicked".to_string()]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// ─── Resume ──────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_reuses_worktree_and_session() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Iterate").await;
    let first = h.started("s-1").await;
    let path = first.worktree().to_path_buf();
    std::fs::write(path.join("notes.txt"), "kept\n").unwrap();
    first
        .emit(EngineEvent::AbnormalExit {
            reason: "engine crashed".into(),
            transcript: Vec::new(),
        })
        .await;
    h.wait_for(workload.id, WorkloadStatus::NeedsAttention).await;

    // A message to an idle workload resumes it.
    assert_eq!(
        h.manager.send_message(workload.id, "try again").await.unwrap(),
        Delivery::Resumed
    );
    let mut second = h.started("s-1").await;
    assert_eq!(second.request.session_id.as_deref(), Some("s-1"));
    assert_eq!(second.worktree(), path.as_path());
    assert_eq!(second.request.initial_prompt.as_deref(), Some("try again"));
    assert!(path.join("notes.txt").exists(), "worktree must survive resume");

    assert_eq!(second.stop(None).await, Call::Stop(StopReply::Confirm));
    let done = h.wait_for(workload.id, WorkloadStatus::Completed).await;
    assert_eq!(done.merge_retries, 0);
    assert!(!path.exists());

    // Completed workloads resume in a fresh worktree at the same path.
    h.manager
        .resume(workload.id, Some("one more thing".into()))
        .await
        .unwrap();
    let third = h.next_session().await;
    assert_eq!(third.worktree(), path.as_path());
    assert!(path.join("notes.txt").exists(), "fresh worktree starts from trunk");
    assert_eq!(third.request.session_id.as_deref(), Some("s-1"));

    let running = h.manager.get(workload.id).await.unwrap();
    assert_eq!(running.session_id.as_deref(), Some("s-1"));
    assert_eq!(running.status, WorkloadStatus::Running);
    h.manager.cancel(workload.id).await.unwrap();
}

#[tokio::test]
async fn concurrent_resumes_start_one_session() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Race").await;
    h.started("s-1")
        .await
        .emit(EngineEvent::AbnormalExit {
            reason: "boom".into(),
            transcript: Vec::new(),
        })
        .await;
    h.wait_for(workload.id, WorkloadStatus::NeedsAttention).await;

    let (a, b) = tokio::join!(
        h.manager.resume(workload.id, None),
        h.manager.resume(workload.id, None)
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(WorkloadError::SessionActive(_)) | Err(WorkloadError::NotResumable { .. })
    )));

    let session = h.next_session().await;
    assert!(session.request.initial_prompt.is_none());
    sleep(Duration::from_millis(200)).await;
    assert!(h.sessions.try_recv().is_err(), "only one session may start");
    h.manager.cancel(workload.id).await.unwrap();
}

// ─── Ownership ───────────────────────────────────────────────────────

#[tokio::test]
async fn locked_project_refuses_dispatch() {
    let mut h = Harness::new().await;

    // Another development environment claims the repository first.
    let other = h.root.path().join("dev-b");
    git(
        h.root.path(),
        &["clone", h.origin.to_str().unwrap(), other.to_str().unwrap()],
    );
    let other_guard = RepoOwnershipGuard::new(
        CallerIdentity::new("dev-B", "p-b", "beta"),
        &other,
        GitRunner::new().with_retry(RetryPolicy::none()),
    );
    assert!(other_guard.check(false).await.is_ok());
    git(&h.clone, &["pull", "--ff-only"]);

    let err = h
        .manager
        .dispatch(DispatchRequest::new("Ada", "Blocked", "nope"))
        .await
        .unwrap_err();
    assert!(err.is_locked(), "{err}");
    assert!(err.to_string().contains("dev-B"), "{err}");
    assert!(h.manager.list().await.unwrap().is_empty());

    match h.expect_event("lockdown_changed").await {
        WorkloadEvent::LockdownChanged { locked, .. } => assert!(locked),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn unknown_agent_is_rejected() {
    let h = Harness::new().await;
    assert!(matches!(
        h.manager
            .dispatch(DispatchRequest::new("Linus", "t", "d"))
            .await,
        Err(WorkloadError::UnknownAgent(_))
    ));
}

// ─── Tool approvals ──────────────────────────────────────────────────

#[tokio::test]
async fn tool_approval_round_trip() {
    let mut h = Harness::new().await;
    let workload = h.dispatch("Run tests").await;
    let mut session = h.started("s-1").await;

    session
        .emit(EngineEvent::ToolApprovalRequest {
            request_id: "r1".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "cargo test --all"}),
        })
        .await;
    match h.expect_event("tool_approval_requested").await {
        WorkloadEvent::ToolApprovalRequested { request, room_id, .. } => {
            assert_eq!(request.permission_key, "Bash(cargo test:*)");
            assert_eq!(room_id.as_deref(), Some("room-1"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(h
        .manager
        .resolve_tool_approval(workload.id, "r1", ApprovalDecision::Deny { reason: "".into() })
        .is_err());
    h.manager
        .resolve_tool_approval(workload.id, "r1", ApprovalDecision::ApproveSession)
        .unwrap();
    assert_eq!(
        session.next_call().await,
        Call::Tool {
            request_id: "r1".into(),
            verdict: ToolVerdict::Allow
        }
    );

    // The session grant covers the same command prefix without asking.
    session
        .emit(EngineEvent::ToolApprovalRequest {
            request_id: "r2".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "cargo test --release"}),
        })
        .await;
    assert_eq!(
        session.next_call().await,
        Call::Tool {
            request_id: "r2".into(),
            verdict: ToolVerdict::Allow
        }
    );

    assert!(matches!(
        h.manager
            .resolve_tool_approval(workload.id, "r1", ApprovalDecision::Approve),
        Err(WorkloadError::NoPendingApproval { .. })
    ));
    h.manager.cancel(workload.id).await.unwrap();
}

// ─── Listener and transport ──────────────────────────────────────────

#[tokio::test]
async fn listener_dispatches_from_chat() {
    let mut h = Harness::new().await;
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let listener = tokio::spawn(
        Listener::new(vec!["Ada".into()]).run(h.manager.clone(), rx, cancel.clone()),
    );

    tx.send(InboundEvent::ChatMessage(ChatMessage {
        chat_id: "main-chat".into(),
        room_id: None,
        author: "sam".into(),
        author_kind: AuthorKind::Human,
        content: "@Ada add a changelog".into(),
        mentions: Vec::new(),
        workload_id: None,
        permission_mode: Default::default(),
    }))
    .await
    .unwrap();

    let session = h.next_session().await;
    let prompt = session.request.initial_prompt.clone().unwrap();
    assert!(prompt.starts_with("# Workload: add a changelog"), "{prompt}");

    let workloads = h.manager.list().await.unwrap();
    assert_eq!(workloads.len(), 1);
    assert_eq!(workloads[0].main_chat_id.as_deref(), Some("main-chat"));

    cancel.cancel();
    listener.await.unwrap();
    h.manager.cancel(workloads[0].id).await.unwrap();
}

mock! {
    Transport {}

    #[async_trait]
    impl ChatTransport for Transport {
        async fn publish(&self, event: WorkloadEvent) -> WorkloadResult<()>;
    }
}

#[tokio::test]
async fn transport_failures_do_not_block_progress() {
    let mut transport = MockTransport::new();
    transport
        .expect_publish()
        .times(1..)
        .returning(|_| Err(WorkloadError::Transport("chat offline".into())));

    let (_unused_tx, events) = broadcast::channel(1);
    let mut h = Harness::with_transport(Arc::new(transport), events).await;
    let workload = h.dispatch("Offline").await;
    let mut session = h.next_session().await;
    session
        .emit(EngineEvent::SessionStarted {
            session_id: "s-1".into(),
        })
        .await;
    assert_eq!(session.stop(None).await, Call::Stop(StopReply::Confirm));
    h.wait_for(workload.id, WorkloadStatus::Completed).await;
}
