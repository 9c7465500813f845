//! Coordination error types
//!
//! Structured errors for git, ownership, state-machine and approval
//! operations, with a retryable classification used by the backoff layer.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors that can occur while coordinating workloads
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    GitError { operation: String, message: String },

    /// Git operation exceeded its time bound
    #[error("Git operation timed out after {secs}s: {operation}")]
    GitTimeout { operation: String, secs: u64 },

    /// Repository is locked down by the ownership guard
    #[error("Project is locked: {reason}")]
    Locked { reason: String },

    /// Ownership manifest could not be parsed
    #[error("Invalid ownership manifest at {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    /// Invalid workload status transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Tool approval could not be recorded or resolved
    #[error("Approval error: {message}")]
    ApprovalError { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinationError {
    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GitError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a lockdown error
    pub fn locked(reason: impl Into<String>) -> Self {
        Self::Locked {
            reason: reason.into(),
        }
    }

    pub fn invalid_manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn approval(message: impl Into<String>) -> Self {
        Self::ApprovalError {
            message: message.into(),
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GitError { message, .. } => {
                let lower = message.to_lowercase();
                // Lock file conflicts
                lower.contains("index.lock") ||
                lower.contains("could not lock") ||
                lower.contains("another git process") ||
                // Timeout or network issues
                lower.contains("timed out") ||
                lower.contains("connection") ||
                lower.contains("network") ||
                lower.contains("could not read from remote") ||
                lower.contains("unable to access")
            }
            Self::GitTimeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            // Gate failures are never retried automatically
            Self::Locked { .. } => false,
            _ => false,
        }
    }

    /// Whether this error is a lockdown refusal.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::GitError { message, .. } => {
                let lower = message.to_lowercase();
                if lower.contains("lock") || lower.contains("another git process") {
                    Some("Git lock file conflict. Wait a moment and retry, or remove stale lock: \
                          rm -f .git/index.lock")
                } else if lower.contains("not a git repository") {
                    Some("The project clone path is not a git repository. Re-clone the project.")
                } else {
                    Some("Check git status and repository state: git status")
                }
            }
            Self::GitTimeout { .. } => {
                Some("Git did not finish in time. Check for a stuck process holding the repo.")
            }
            Self::Locked { .. } => Some(
                "Fix the ownership manifest in the repository (or pick another repository), \
                 then refresh the project to re-validate.",
            ),
            Self::InvalidManifest { .. } => Some(
                "The ownership manifest is not valid JSON. Restore it from git history.",
            ),
            Self::InvalidStateTransition { .. } => {
                Some("Invalid operation for the workload's current status.")
            }
            Self::ApprovalError { .. } => None,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Some("File or directory not found. Check the path exists.")
                }
                std::io::ErrorKind::PermissionDenied => {
                    Some("Permission denied. Check file permissions: ls -la <path>")
                }
                _ => Some("IO error occurred. Check disk space and file permissions."),
            },
            Self::Json(_) => None,
        }
    }

    /// Get error with recovery suggestion formatted
    pub fn with_suggestion(&self) -> String {
        match self.recovery_suggestion() {
            Some(suggestion) => format!("{}\n\nRecovery: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflicts_are_retryable() {
        let err = CoordinationError::git(
            "worktree add",
            "fatal: Unable to create '/repo/.git/index.lock': File exists.",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_network_failures_are_retryable() {
        let err = CoordinationError::git("push", "fatal: Could not read from remote repository.");
        assert!(err.is_retryable());
        let err = CoordinationError::GitTimeout {
            operation: "pull".into(),
            secs: 30,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_conflicts_and_gates_are_not_retryable() {
        let err = CoordinationError::git("merge", "CONFLICT (content): Merge conflict in a.rs");
        assert!(!err.is_retryable());
        let err = CoordinationError::locked("owned by prod");
        assert!(!err.is_retryable());
        assert!(err.is_locked());
    }

    #[test]
    fn test_with_suggestion_appends_recovery() {
        let err = CoordinationError::locked("manifest mismatch");
        let text = err.with_suggestion();
        assert!(text.starts_with("Project is locked: manifest mismatch"));
        assert!(text.contains("Recovery:"));
    }
}
