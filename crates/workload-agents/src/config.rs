use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use coordination::merge::DEFAULT_MAX_MERGE_RETRIES;
use coordination::ownership::CallerIdentity;
use coordination::resilience::{RetryPolicy, RETRY_BASE_DELAY_MS};
use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Top-level runtime configuration.
///
/// Defaults come from `TEAM_AGENT_*` environment variables; a TOML file may
/// override any field, and CLI flags override both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Environment tag of this deployment (`prod` is special).
    pub env: String,
    pub project_id: String,
    pub project_name: String,
    /// Working clone of the shared repository; its checked-out branch is trunk.
    pub clone_path: PathBuf,
    /// Parent directory for worktrees (None = `<clone>/../worktrees`).
    pub worktree_base: Option<PathBuf>,
    /// Trunk used when the clone's HEAD is detached.
    pub default_branch: String,
    /// Upper bound on a single `git merge` into trunk.
    pub merge_timeout_secs: u64,
    /// Upper bound on any other git command.
    pub git_timeout_secs: u64,
    /// Retries for transient git failures (push, pull, worktree add).
    pub git_max_retries: u32,
    /// Conflict cycles before a workload needs a human.
    pub max_merge_retries: u32,
    /// Auto-deny unanswered tool approvals after this long (None = wait).
    pub approval_timeout_secs: Option<u64>,
    /// Interval between turn-progress heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Agent engine command line, split with shell rules.
    pub engine_command: String,
    /// Agents that may be mentioned to receive work.
    pub agents: Vec<String>,
    /// Domain used for agent git identities (`<name>@<domain>`).
    pub agent_email_domain: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            env: env_or("TEAM_AGENT_ENV", "dev"),
            project_id: env_or("TEAM_AGENT_PROJECT_ID", "local"),
            project_name: env_or("TEAM_AGENT_PROJECT_NAME", "local"),
            clone_path: PathBuf::from(env_or("TEAM_AGENT_CLONE_PATH", ".")),
            worktree_base: std::env::var("TEAM_AGENT_WORKTREE_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            default_branch: env_or("TEAM_AGENT_DEFAULT_BRANCH", "main"),
            merge_timeout_secs: env_parse("TEAM_AGENT_MERGE_TIMEOUT_SECS").unwrap_or(30),
            git_timeout_secs: env_parse("TEAM_AGENT_GIT_TIMEOUT_SECS").unwrap_or(60),
            git_max_retries: env_parse("TEAM_AGENT_GIT_MAX_RETRIES").unwrap_or(3),
            max_merge_retries: env_parse("TEAM_AGENT_MAX_MERGE_RETRIES")
                .unwrap_or(DEFAULT_MAX_MERGE_RETRIES),
            approval_timeout_secs: env_parse("TEAM_AGENT_APPROVAL_TIMEOUT_SECS"),
            heartbeat_interval_ms: env_parse("TEAM_AGENT_HEARTBEAT_MS").unwrap_or(1000),
            engine_command: env_or("TEAM_AGENT_ENGINE_CMD", "team-agent-engine --stdio"),
            agents: std::env::var("TEAM_AGENT_AGENTS")
                .map(|v| parse_agent_list(&v))
                .unwrap_or_default(),
            agent_email_domain: env_or("TEAM_AGENT_EMAIL_DOMAIN", "team-agent"),
        }
    }
}

fn parse_agent_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl AgentsConfig {
    /// Load from a TOML file; fields it omits fall back to the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentsConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Environment defaults, overlaid by `path` when given, then validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.env.trim().is_empty() {
            bail!("env must not be empty");
        }
        if self.project_id.trim().is_empty() {
            bail!("project_id must not be empty");
        }
        if self.default_branch.trim().is_empty() {
            bail!("default_branch must not be empty");
        }
        if self.merge_timeout_secs == 0 {
            bail!("merge_timeout_secs must be > 0");
        }
        if self.git_timeout_secs == 0 {
            bail!("git_timeout_secs must be > 0");
        }
        if self.approval_timeout_secs == Some(0) {
            bail!("approval_timeout_secs must be > 0 when set");
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat_interval_ms must be > 0");
        }
        match shlex::split(&self.engine_command) {
            Some(argv) if !argv.is_empty() => {}
            _ => bail!("engine_command must be a non-empty, shell-parseable command"),
        }
        Ok(())
    }

    pub fn identity(&self) -> CallerIdentity {
        CallerIdentity::new(&self.env, &self.project_id, &self.project_name)
    }

    /// Worktree parent directory, resolved against the clone.
    pub fn resolved_worktree_base(&self) -> PathBuf {
        match &self.worktree_base {
            Some(base) => base.clone(),
            None => self
                .clone_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("worktrees"),
        }
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.git_max_retries,
            Duration::from_millis(RETRY_BASE_DELAY_MS),
        )
    }

    pub fn is_known_agent(&self, name: &str) -> bool {
        self.agents.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}
