//! Async git runner
//!
//! Every git invocation the core makes goes through [`GitRunner`]: a bounded
//! `tokio::process::Command` with its own process group, so a timed-out git
//! (and any hook it spawned) is killed rather than left holding the repo.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::{CoordinationError, CoordinationResult};
use crate::resilience::RetryPolicy;

/// Default time bound for a single git invocation.
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 60;

/// Captured output of a finished git process.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for conflict scanning.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs git commands with a timeout and optional retry.
#[derive(Debug, Clone)]
pub struct GitRunner {
    timeout: Duration,
    retry: RetryPolicy,
}

impl Default for GitRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRunner {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the per-invocation time bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry policy used by [`GitRunner::run_with_retry`].
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run git and capture its output without interpreting the exit code.
    ///
    /// Fails only if git could not be spawned or exceeded the time bound.
    pub async fn output(&self, cwd: &Path, args: &[&str]) -> CoordinationResult<GitOutput> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        debug!(cwd = %cwd.display(), args = ?args, "git");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(CoordinationError::git("execute", e.to_string())),
            Err(_) => {
                return Err(CoordinationError::GitTimeout {
                    operation: args.join(" "),
                    secs: self.timeout.as_secs(),
                })
            }
        };

        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run git command and return stdout, failing on a non-zero exit.
    pub async fn run(&self, cwd: &Path, args: &[&str]) -> CoordinationResult<String> {
        let output = self.output(cwd, args).await?;
        if !output.success() {
            return Err(CoordinationError::git(args.join(" "), output.combined()));
        }
        Ok(output.stdout)
    }

    /// Run git command with automatic retry for transient failures
    pub async fn run_with_retry(&self, cwd: &Path, args: &[&str]) -> CoordinationResult<String> {
        let label = args.first().copied().unwrap_or("git");
        self.retry.run(label, || self.run(cwd, args)).await
    }

    /// Get current branch name
    pub async fn current_branch(&self, cwd: &Path) -> CoordinationResult<String> {
        self.run(cwd, &["symbolic-ref", "--short", "HEAD"]).await
    }

    /// Get current commit hash (full)
    pub async fn head_commit(&self, cwd: &Path) -> CoordinationResult<String> {
        self.run(cwd, &["rev-parse", "HEAD"]).await
    }

    /// Check if working directory has uncommitted changes
    pub async fn has_uncommitted_changes(&self, cwd: &Path) -> CoordinationResult<bool> {
        let status = self.run(cwd, &["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    /// Whether `branch` exists as a local branch.
    pub async fn branch_exists(&self, cwd: &Path, branch: &str) -> CoordinationResult<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = self
            .output(cwd, &["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(output.success())
    }

    /// Verify `cwd` is inside a git repository.
    pub async fn ensure_repository(&self, cwd: &Path) -> CoordinationResult<()> {
        let output = self.output(cwd, &["rev-parse", "--git-dir"]).await?;
        if !output.success() {
            return Err(CoordinationError::git(
                "rev-parse",
                format!("Not a git repository: {}", cwd.display()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_git_repo(path: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(path)
                .output()
                .expect("git setup failed");
        }
        std::fs::write(path.join("README.md"), "# Test\n").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(path)
            .output()
            .unwrap();
    }

    #[tokio::test]
    async fn test_current_branch_and_status() {
        let dir = tempfile::tempdir().unwrap();
        init_git_repo(dir.path());
        let git = GitRunner::new();

        assert_eq!(git.current_branch(dir.path()).await.unwrap(), "main");
        assert!(!git.has_uncommitted_changes(dir.path()).await.unwrap());

        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        assert!(git.has_uncommitted_changes(dir.path()).await.unwrap());
        assert!(git.branch_exists(dir.path(), "main").await.unwrap());
        assert!(!git.branch_exists(dir.path(), "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_command_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        init_git_repo(dir.path());
        let err = GitRunner::new()
            .run(dir.path(), &["checkout", "does-not-exist"])
            .await
            .unwrap_err();
        match err {
            CoordinationError::GitError { operation, message } => {
                assert_eq!(operation, "checkout does-not-exist");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ensure_repository_rejects_plain_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitRunner::new().ensure_repository(dir.path()).await.is_err());
    }
}
