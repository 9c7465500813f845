//! Tool approval vocabulary.
//!
//! Permission keys use the engine's rule syntax: `Bash(git push:*)` for shell
//! commands keyed by their first two words, the bare tool name for file tools,
//! and `WebFetch(domain:example.com)` for fetches. Approved keys live either in
//! the session (in memory) or in the project's `.claude/settings.local.json`
//! under `permissions.allow`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::workload::WorkloadId;

/// Project settings file holding persisted approvals, relative to the repo.
pub const PROJECT_SETTINGS_FILE: &str = ".claude/settings.local.json";

const FILE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "Read", "Glob", "Grep"];
const EDIT_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];
const SUMMARY_LIMIT: usize = 500;

/// Tools that modify files; auto-approved under accept-edits.
pub fn is_edit_tool(tool_name: &str) -> bool {
    EDIT_TOOLS.contains(&tool_name)
}

/// Build the permission key for a tool call.
pub fn permission_key(tool_name: &str, input: &Value) -> String {
    if tool_name == "Bash" {
        if let Some(command) = input.get("command").and_then(Value::as_str) {
            let words: Vec<&str> = command.split_whitespace().take(2).collect();
            let prefix = if words.is_empty() {
                command.trim().to_string()
            } else {
                words.join(" ")
            };
            return format!("Bash({prefix}:*)");
        }
    }

    if FILE_TOOLS.contains(&tool_name) {
        return tool_name.to_string();
    }

    if tool_name == "WebFetch" {
        if let Some(domain) = input
            .get("url")
            .and_then(Value::as_str)
            .and_then(url_domain)
        {
            return format!("WebFetch(domain:{domain})");
        }
    }

    tool_name.to_string()
}

fn url_domain(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    (!host.is_empty()).then_some(host)
}

/// Whether a single allow-rule covers the call whose key is `key`.
pub fn rule_matches(rule: &str, tool_name: &str, key: &str) -> bool {
    if rule == key || rule == tool_name || rule == format!("{tool_name}(*)") {
        return true;
    }
    // `Bash(git push:*)` covers `Bash(git push:*)` and anything sharing its prefix.
    if let Some(prefix) = rule.strip_suffix(":*)") {
        return key.starts_with(prefix);
    }
    false
}

/// Whether any rule in `rules` covers the call.
pub fn any_rule_matches<'a>(
    rules: impl IntoIterator<Item = &'a String>,
    tool_name: &str,
    key: &str,
) -> bool {
    rules
        .into_iter()
        .any(|rule| rule_matches(rule, tool_name, key))
}

/// One-line human-readable description of what the tool wants to do.
pub fn summarize_input(tool_name: &str, input: &Value) -> String {
    let field = |name: &str| input.get(name).and_then(Value::as_str);
    match tool_name {
        "Bash" => {
            if let Some(command) = field("command") {
                return truncate(command, SUMMARY_LIMIT);
            }
        }
        "Write" | "Edit" | "MultiEdit" | "Read" => {
            if let Some(path) = field("file_path") {
                return path.to_string();
            }
        }
        "Glob" => {
            if let Some(pattern) = field("pattern") {
                return pattern.to_string();
            }
        }
        "Grep" => {
            if let Some(pattern) = field("pattern") {
                return format!("/{pattern}/");
            }
        }
        "WebFetch" => {
            if let Some(url) = field("url") {
                return truncate(url, 200);
            }
        }
        _ => {}
    }
    let keys: Vec<&str> = input
        .as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default();
    format!("{tool_name}({})", keys.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Current content of the file an edit tool targets, for diff display.
///
/// `Some("")` for a file that does not exist yet; `None` for non-edit tools
/// or unreadable files.
pub async fn original_content(worktree: &Path, tool_name: &str, input: &Value) -> Option<String> {
    if !matches!(tool_name, "Write" | "Edit" | "MultiEdit") {
        return None;
    }
    let file_path = input.get("file_path").and_then(Value::as_str)?;
    let resolved = if Path::new(file_path).is_absolute() {
        PathBuf::from(file_path)
    } else {
        worktree.join(file_path)
    };

    match tokio::fs::read(&resolved).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(String::new()),
        Err(e) => {
            warn!(path = %resolved.display(), error = %e, "Could not read original file for diff");
            None
        }
    }
}

/// A tool call put to a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolApprovalRequest {
    pub request_id: String,
    pub workload_id: WorkloadId,
    pub tool_name: String,
    pub input: Value,
    pub input_summary: String,
    pub permission_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Human decision on a pending tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Allow this call only.
    Approve,
    /// Allow this permission key for the rest of the session.
    ApproveSession,
    /// Allow this permission key permanently for the project.
    ApproveProject,
    Deny { reason: String },
}

impl ApprovalDecision {
    /// Deny with a reason; the reason is relayed to the agent and must be non-empty.
    pub fn deny(reason: impl Into<String>) -> CoordinationResult<Self> {
        let decision = Self::Deny {
            reason: reason.into(),
        };
        decision.validate()?;
        Ok(decision)
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        match self {
            Self::Deny { reason } if reason.trim().is_empty() => Err(
                CoordinationError::approval("a deny decision requires a reason"),
            ),
            _ => Ok(()),
        }
    }

    pub fn is_allow(&self) -> bool {
        !matches!(self, Self::Deny { .. })
    }
}

/// Answer returned to the engine for a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum ToolVerdict {
    Allow,
    Deny { reason: String },
}

impl ToolVerdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Permission keys approved for the lifetime of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionApprovals {
    keys: HashSet<String>,
}

impl SessionApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn allows(&self, tool_name: &str, key: &str) -> bool {
        any_rule_matches(&self.keys, tool_name, key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Durable per-project approvals.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Whether a persisted rule covers the call.
    async fn allows(&self, tool_name: &str, key: &str) -> CoordinationResult<bool>;

    /// Persist a permission key. Idempotent.
    async fn persist(&self, key: &str) -> CoordinationResult<()>;
}

/// Approvals stored in `<repo>/.claude/settings.local.json`.
pub struct JsonApprovalStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonApprovalStore {
    pub fn new(repo: &Path) -> Self {
        Self::at(repo.join(PROJECT_SETTINGS_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_settings(&self) -> CoordinationResult<Value> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Ignoring unparseable settings file");
                Value::Object(Default::default())
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Value::Object(Default::default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rules currently listed under `permissions.allow`.
    pub async fn allowed_rules(&self) -> CoordinationResult<Vec<String>> {
        let settings = self.read_settings().await?;
        Ok(settings
            .pointer("/permissions/allow")
            .and_then(Value::as_array)
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ApprovalStore for JsonApprovalStore {
    async fn allows(&self, tool_name: &str, key: &str) -> CoordinationResult<bool> {
        let rules = self.allowed_rules().await?;
        Ok(any_rule_matches(&rules, tool_name, key))
    }

    async fn persist(&self, key: &str) -> CoordinationResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.read_settings().await?;
        if !settings.is_object() {
            settings = Value::Object(Default::default());
        }

        let root = settings
            .as_object_mut()
            .ok_or_else(|| CoordinationError::approval("settings root is not an object"))?;
        let permissions = root
            .entry("permissions")
            .or_insert_with(|| Value::Object(Default::default()));
        if !permissions.is_object() {
            *permissions = Value::Object(Default::default());
        }
        let allow = permissions
            .as_object_mut()
            .ok_or_else(|| CoordinationError::approval("permissions is not an object"))?
            .entry("allow")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !allow.is_array() {
            *allow = Value::Array(Vec::new());
        }
        if let Some(list) = allow.as_array_mut() {
            if list.iter().any(|v| v.as_str() == Some(key)) {
                return Ok(());
            }
            list.push(Value::String(key.to_string()));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut body = serde_json::to_string_pretty(&settings)?;
        body.push('\n');
        tokio::fs::write(&self.path, body).await?;
        info!(key, path = %self.path.display(), "Persisted project tool approval");
        Ok(())
    }
}
