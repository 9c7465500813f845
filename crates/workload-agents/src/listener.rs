//! Listener: turns inbound chat/control events into manager operations.
//!
//! Classification is a pure function ([`Listener::on_event`]); [`Listener::run`]
//! feeds a channel of events through it and executes the resulting actions
//! without blocking the intake loop.

use coordination::approval::ApprovalDecision;
use coordination::workload::{PermissionMode, WorkloadId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{DispatchRequest, WorkloadManager};

/// Longest title derived from a dispatching message.
const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    Human,
    Agent,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: String,
    #[serde(default)]
    pub room_id: Option<String>,
    pub author: String,
    pub author_kind: AuthorKind,
    pub content: String,
    /// Agents addressed explicitly by the chat client.
    #[serde(default)]
    pub mentions: Vec<String>,
    /// Set when the message was posted in a workload's own chat.
    #[serde(default)]
    pub workload_id: Option<WorkloadId>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Interrupt,
    Resume,
}

/// Events arriving from the chat side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    ChatMessage(ChatMessage),
    ToolApprovalDecision {
        workload_id: WorkloadId,
        request_id: String,
        decision: ApprovalDecision,
    },
    WorkloadControl {
        workload_id: WorkloadId,
        action: ControlAction,
    },
    RefreshOwnership,
}

/// What the listener decided to do with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    Dispatch(DispatchRequest),
    Route {
        workload_id: WorkloadId,
        content: String,
    },
    ResolveApproval {
        workload_id: WorkloadId,
        request_id: String,
        decision: ApprovalDecision,
    },
    Control {
        workload_id: WorkloadId,
        action: ControlAction,
    },
    RefreshOwnership,
}

pub struct Listener {
    agents: Vec<String>,
}

impl Listener {
    pub fn new(agents: Vec<String>) -> Self {
        Self { agents }
    }

    /// Classify an inbound event. Agent-authored and unaddressed messages
    /// produce no action.
    pub fn on_event(&self, event: &InboundEvent) -> Option<ListenerAction> {
        match event {
            InboundEvent::ChatMessage(message) => self.on_message(message),
            InboundEvent::ToolApprovalDecision {
                workload_id,
                request_id,
                decision,
            } => Some(ListenerAction::ResolveApproval {
                workload_id: *workload_id,
                request_id: request_id.clone(),
                decision: decision.clone(),
            }),
            InboundEvent::WorkloadControl {
                workload_id,
                action,
            } => Some(ListenerAction::Control {
                workload_id: *workload_id,
                action: *action,
            }),
            InboundEvent::RefreshOwnership => Some(ListenerAction::RefreshOwnership),
        }
    }

    fn on_message(&self, message: &ChatMessage) -> Option<ListenerAction> {
        if message.author_kind != AuthorKind::Human {
            return None;
        }
        if message.content.trim().is_empty() {
            return None;
        }
        if let Some(workload_id) = message.workload_id {
            return Some(ListenerAction::Route {
                workload_id,
                content: message.content.clone(),
            });
        }

        let agent = self.mentioned_agent(message)?;
        let description = strip_mention(&message.content, &agent);
        let title = derive_title(&description);
        Some(ListenerAction::Dispatch(
            DispatchRequest::new(agent, title, description)
                .with_chat(message.room_id.clone(), Some(message.chat_id.clone()))
                .with_permission_mode(message.permission_mode),
        ))
    }

    /// First known agent addressed by the message, explicit mentions first.
    fn mentioned_agent(&self, message: &ChatMessage) -> Option<String> {
        let known = |name: &str| {
            self.agents
                .iter()
                .find(|a| a.eq_ignore_ascii_case(name))
                .cloned()
        };
        message
            .mentions
            .iter()
            .find_map(|m| known(m.trim_start_matches('@')))
            .or_else(|| {
                message
                    .content
                    .split_whitespace()
                    .filter_map(|word| word.strip_prefix('@'))
                    .map(|name| name.trim_end_matches(|c: char| !c.is_alphanumeric()))
                    .find_map(known)
            })
    }

    /// Feed events through [`Self::on_event`] until the channel closes or
    /// `cancel` fires. Each action runs on its own task.
    pub async fn run(
        self,
        manager: WorkloadManager,
        mut events: mpsc::Receiver<InboundEvent>,
        cancel: CancellationToken,
    ) {
        info!(agents = ?self.agents, "Listener started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(action) = self.on_event(&event) else {
                debug!("Inbound event ignored");
                continue;
            };
            let manager = manager.clone();
            tokio::spawn(async move { execute(&manager, action).await });
        }
        info!("Listener stopped");
    }
}

/// Run one action against the manager, logging the outcome.
pub async fn execute(manager: &WorkloadManager, action: ListenerAction) {
    match action {
        ListenerAction::Dispatch(request) => {
            let agent = request.agent.clone();
            match manager.dispatch(request).await {
                Ok(workload) => info!(workload_id = %workload.id, %agent, "Dispatched from chat"),
                Err(e) if e.is_locked() => warn!(%agent, "Dispatch refused, project locked: {e}"),
                Err(e) => warn!(%agent, "Dispatch failed: {e}"),
            }
        }
        ListenerAction::Route {
            workload_id,
            content,
        } => match manager.send_message(workload_id, &content).await {
            Ok(delivery) => debug!(%workload_id, ?delivery, "Message routed"),
            Err(e) => warn!(%workload_id, "Message routing failed: {e}"),
        },
        ListenerAction::ResolveApproval {
            workload_id,
            request_id,
            decision,
        } => {
            if let Err(e) = manager.resolve_tool_approval(workload_id, &request_id, decision) {
                warn!(%workload_id, %request_id, "Approval not applied: {e}");
            }
        }
        ListenerAction::Control {
            workload_id,
            action,
        } => {
            let result = match action {
                ControlAction::Cancel => manager.cancel(workload_id).await.map(|_| ()),
                ControlAction::Interrupt => manager.interrupt(workload_id).await,
                ControlAction::Resume => manager.resume(workload_id, None).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!(%workload_id, ?action, "Control action failed: {e}");
            }
        }
        ListenerAction::RefreshOwnership => {
            let verdict = manager.refresh_ownership().await;
            info!(?verdict, "Ownership refreshed");
        }
    }
}

fn strip_mention(content: &str, agent: &str) -> String {
    let is_mention = |word: &str| {
        word.strip_prefix('@')
            .map(|n| n.trim_end_matches(|c: char| !c.is_alphanumeric()))
            .is_some_and(|n| n.eq_ignore_ascii_case(agent))
    };
    content
        .lines()
        .map(|line| {
            line.split_whitespace()
                .filter(|word| !is_mention(word))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn derive_title(description: &str) -> String {
    let first_line = description
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if first_line.chars().count() <= MAX_TITLE_CHARS {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{}...", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> Listener {
        Listener::new(vec!["Ada".into(), "Grace".into()])
    }

    fn message(content: &str) -> ChatMessage {
        ChatMessage {
            chat_id: "main".into(),
            room_id: Some("room-1".into()),
            author: "sam".into(),
            author_kind: AuthorKind::Human,
            content: content.into(),
            mentions: Vec::new(),
            workload_id: None,
            permission_mode: PermissionMode::Standard,
        }
    }

    #[test]
    fn test_mention_dispatches() {
        let action = listener()
            .on_event(&InboundEvent::ChatMessage(message("@ada fix the login form")))
            .unwrap();
        match action {
            ListenerAction::Dispatch(request) => {
                assert_eq!(request.agent, "Ada");
                assert_eq!(request.title, "fix the login form");
                assert_eq!(request.main_chat_id.as_deref(), Some("main"));
                assert_eq!(request.room_id.as_deref(), Some("room-1"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_explicit_mentions_win() {
        let mut m = message("please look at this @Ada");
        m.mentions = vec!["grace".into()];
        match listener().on_event(&InboundEvent::ChatMessage(m)) {
            Some(ListenerAction::Dispatch(r)) => assert_eq!(r.agent, "Grace"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_agent_and_unaddressed_messages_ignored() {
        let mut m = message("@Ada do it");
        m.author_kind = AuthorKind::Agent;
        assert_eq!(listener().on_event(&InboundEvent::ChatMessage(m)), None);
        assert_eq!(
            listener().on_event(&InboundEvent::ChatMessage(message("hello @Linus"))),
            None
        );
    }

    #[test]
    fn test_workload_chat_routes() {
        let id = uuid::Uuid::new_v4();
        let mut m = message("@Ada also update the docs");
        m.workload_id = Some(id);
        assert_eq!(
            listener().on_event(&InboundEvent::ChatMessage(m)),
            Some(ListenerAction::Route {
                workload_id: id,
                content: "@Ada also update the docs".into()
            })
        );
    }

    #[test]
    fn test_title_truncated() {
        let long = "x".repeat(200);
        let title = derive_title(&format!("{long}\nsecond line"));
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_inbound_wire_format() {
        let id = uuid::Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"tool_approval_decision","workload_id":"{id}","request_id":"r1","decision":{{"decision":"deny","reason":"no"}}}}"#
        );
        let event: InboundEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            listener().on_event(&event),
            Some(ListenerAction::ResolveApproval {
                workload_id: id,
                request_id: "r1".into(),
                decision: ApprovalDecision::Deny {
                    reason: "no".into()
                },
            })
        );

        let control: InboundEvent = serde_json::from_str(&format!(
            r#"{{"type":"workload_control","workload_id":"{id}","action":"interrupt"}}"#
        ))
        .unwrap();
        assert!(matches!(
            listener().on_event(&control),
            Some(ListenerAction::Control { action: ControlAction::Interrupt, .. })
        ));
    }
}
