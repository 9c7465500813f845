//! Agent engine seam.
//!
//! The engine is a black box that runs agent turns inside a working
//! directory. The runtime talks to it through [`AgentEngine::start`], which
//! yields a control surface plus an event stream. [`ProcessEngine`] speaks a
//! JSON-lines protocol over a child process's stdio:
//!
//! ```text
//! stdin  ◀── {"type":"start",...} {"type":"prompt",...} {"type":"tool_decision",...}
//!            {"type":"stop_decision",...} {"type":"interrupt"}
//! stdout ──▶ {"type":"session_started",...} {"type":"message",...}
//!            {"type":"tool_approval_request",...} {"type":"stop_intent",...} ...
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coordination::approval::ToolVerdict;
use coordination::workload::{PermissionMode, WorkloadId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr/unparsed stdout kept for abnormal-exit reports.
const TRANSCRIPT_TAIL_LINES: usize = 50;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid engine command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn agent engine `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent engine protocol error: {0}")]
    Protocol(String),

    #[error("Agent session is closed")]
    Closed,
}

/// Git identity the agent commits under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub email: String,
}

impl AgentIdentity {
    pub fn for_agent(name: &str, email_domain: &str) -> Self {
        let local: String = name
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(".");
        Self {
            name: name.trim().to_string(),
            email: format!("{local}@{email_domain}"),
        }
    }

    /// `GIT_AUTHOR_*` / `GIT_COMMITTER_*` for the engine process.
    pub fn git_env(&self) -> [(&'static str, String); 4] {
        [
            ("GIT_AUTHOR_NAME", self.name.clone()),
            ("GIT_AUTHOR_EMAIL", self.email.clone()),
            ("GIT_COMMITTER_NAME", self.name.clone()),
            ("GIT_COMMITTER_EMAIL", self.email.clone()),
        ]
    }
}

/// Everything needed to start or resume a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub workload_id: WorkloadId,
    /// Set when resuming; the engine restores conversation context from it.
    pub session_id: Option<String>,
    pub working_dir: PathBuf,
    pub system_prompt: String,
    /// First prompt of the session. `None` on a bare resume: the session
    /// idles until a human message arrives.
    pub initial_prompt: Option<String>,
    pub permission_mode: PermissionMode,
    pub identity: AgentIdentity,
}

/// Events emitted by a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        session_id: String,
    },
    TurnStarted,
    Message {
        content: String,
    },
    TurnProgress {
        #[serde(default)]
        detail: String,
    },
    /// Turn ended without a stop-intent (e.g. after an interrupt); the
    /// session idles until the next prompt.
    TurnComplete,
    ToolApprovalRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    /// The agent believes its task is complete.
    StopIntent {
        #[serde(default)]
        result: Option<String>,
    },
    AbnormalExit {
        reason: String,
        #[serde(default)]
        transcript: Vec<String>,
    },
}

/// Answer to a stop-intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StopReply {
    Confirm,
    Continue { message: String },
}

/// Control surface of a live session.
#[async_trait]
pub trait AgentControl: Send + Sync {
    async fn send_prompt(&self, text: &str) -> Result<(), EngineError>;

    async fn resolve_tool_approval(
        &self,
        request_id: &str,
        verdict: ToolVerdict,
    ) -> Result<(), EngineError>;

    async fn resolve_stop(&self, reply: StopReply) -> Result<(), EngineError>;

    /// Ask the current turn to wrap up. The session stays alive.
    async fn interrupt(&self) -> Result<(), EngineError>;

    /// Terminate the session immediately.
    async fn kill(&self) -> Result<(), EngineError>;
}

/// A started session.
pub struct SessionHandle {
    pub control: Arc<dyn AgentControl>,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Starts agent sessions.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn start(&self, request: SessionRequest) -> Result<SessionHandle, EngineError>;
}

// ── Process engine ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineCommand {
    Start {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        system_prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        permission_mode: PermissionMode,
    },
    Prompt {
        text: String,
    },
    ToolDecision {
        request_id: String,
        verdict: ToolVerdict,
    },
    StopDecision {
        reply: StopReply,
    },
    Interrupt,
}

/// Runs the engine as a child process speaking JSON lines on stdio.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    argv: Vec<String>,
}

impl ProcessEngine {
    pub fn from_command(command: &str) -> Result<Self, EngineError> {
        match shlex::split(command) {
            Some(argv) if !argv.is_empty() => Ok(Self { argv }),
            _ => Err(EngineError::InvalidCommand(command.to_string())),
        }
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

#[async_trait]
impl AgentEngine for ProcessEngine {
    async fn start(&self, request: SessionRequest) -> Result<SessionHandle, EngineError> {
        let mut cmd = tokio::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .current_dir(&request.working_dir)
            .envs(request.identity.git_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            command: self.argv.join(" "),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stderr unavailable".into()))?;

        let workload_id = request.workload_id;
        let (command_tx, mut command_rx) = mpsc::channel::<EngineCommand>(32);
        let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(64);
        let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop_confirmed = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();

        // Writer: commands → stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(command) = command_rx.recv().await {
                let mut line = match serde_json::to_string(&command) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(%workload_id, "Failed to encode engine command: {e}");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(%workload_id, "Engine stdin closed: {e}");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // stderr → transcript tail.
        let stderr_tail = Arc::clone(&tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                push_tail(&stderr_tail, line);
            }
        });

        // Reader + supervisor: stdout → events, then classify the exit.
        let supervisor_tail = Arc::clone(&tail);
        let confirmed = Arc::clone(&stop_confirmed);
        let kill_token = kill.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut killed = false;
            loop {
                tokio::select! {
                    _ = kill_token.cancelled() => {
                        killed = true;
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match serde_json::from_str::<EngineEvent>(&line) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => push_tail(&supervisor_tail, line),
                        },
                        Ok(None) | Err(_) => break,
                    },
                }
            }

            let status = child.wait().await;
            if confirmed.load(Ordering::SeqCst) {
                debug!(%workload_id, "Engine exited after confirmed stop");
                return;
            }
            let reason = match (killed, status) {
                (true, _) => "session killed".to_string(),
                (false, Ok(status)) => format!("engine exited unexpectedly ({status})"),
                (false, Err(e)) => format!("engine wait failed: {e}"),
            };
            let transcript = supervisor_tail
                .lock()
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default();
            let _ = event_tx
                .send(EngineEvent::AbnormalExit { reason, transcript })
                .await;
        });

        command_tx
            .send(EngineCommand::Start {
                session_id: request.session_id.clone(),
                system_prompt: request.system_prompt.clone(),
                prompt: request.initial_prompt.clone(),
                permission_mode: request.permission_mode,
            })
            .await
            .map_err(|_| EngineError::Closed)?;

        info!(
            %workload_id,
            resume = request.session_id.is_some(),
            cwd = %request.working_dir.display(),
            "Agent engine started"
        );

        Ok(SessionHandle {
            control: Arc::new(ProcessControl {
                commands: command_tx,
                kill,
                stop_confirmed,
            }),
            events: event_rx,
        })
    }
}

fn push_tail(tail: &Mutex<VecDeque<String>>, line: String) {
    if let Ok(mut tail) = tail.lock() {
        if tail.len() == TRANSCRIPT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

struct ProcessControl {
    commands: mpsc::Sender<EngineCommand>,
    kill: CancellationToken,
    stop_confirmed: Arc<AtomicBool>,
}

impl ProcessControl {
    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

#[async_trait]
impl AgentControl for ProcessControl {
    async fn send_prompt(&self, text: &str) -> Result<(), EngineError> {
        self.send(EngineCommand::Prompt {
            text: text.to_string(),
        })
        .await
    }

    async fn resolve_tool_approval(
        &self,
        request_id: &str,
        verdict: ToolVerdict,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::ToolDecision {
            request_id: request_id.to_string(),
            verdict,
        })
        .await
    }

    async fn resolve_stop(&self, reply: StopReply) -> Result<(), EngineError> {
        if reply == StopReply::Confirm {
            self.stop_confirmed.store(true, Ordering::SeqCst);
        }
        self.send(EngineCommand::StopDecision { reply }).await
    }

    async fn interrupt(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Interrupt).await
    }

    async fn kill(&self) -> Result<(), EngineError> {
        self.kill.cancel();
        Ok(())
    }
}
