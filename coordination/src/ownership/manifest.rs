//! Ownership manifest document
//!
//! A small versioned JSON file committed at `.team-agent/manifest.json`
//! asserting which environment/project instance owns the repository. It is
//! the only durable state the core writes into a user's repository.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// Namespace directory inside the repository.
pub const MANIFEST_DIR: &str = ".team-agent";

/// Manifest file name inside [`MANIFEST_DIR`].
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Environment tag reserved for production deployments.
pub const PRODUCTION_ENV: &str = "prod";

/// Committed ownership claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipManifest {
    pub version: u32,
    pub env: String,
    pub project_id: String,
    pub project_name: String,
    pub claimed_at: DateTime<Utc>,
}

impl OwnershipManifest {
    pub fn new(
        env: impl Into<String>,
        project_id: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            env: env.into(),
            project_id: project_id.into(),
            project_name: project_name.into(),
            claimed_at: Utc::now(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.env == PRODUCTION_ENV
    }

    /// Same owner: environment and project id both match.
    pub fn same_owner(&self, other: &OwnershipManifest) -> bool {
        self.env == other.env && self.project_id == other.project_id
    }

    /// Field-by-field differences between the manifest a caller expected and
    /// the one actually found, one line per differing field. The claim
    /// timestamp is not compared.
    pub fn diff(expected: &OwnershipManifest, actual: &OwnershipManifest) -> Vec<String> {
        let mut lines = Vec::new();
        if expected.version != actual.version {
            lines.push(format!(
                "version: expected {}, actual {}",
                expected.version, actual.version
            ));
        }
        if expected.env != actual.env {
            lines.push(format!(
                "env: expected '{}', actual '{}'",
                expected.env, actual.env
            ));
        }
        if expected.project_id != actual.project_id {
            lines.push(format!(
                "project_id: expected '{}', actual '{}'",
                expected.project_id, actual.project_id
            ));
        }
        if expected.project_name != actual.project_name {
            lines.push(format!(
                "project_name: expected '{}', actual '{}'",
                expected.project_name, actual.project_name
            ));
        }
        lines
    }

    /// Human-readable owner description used in lockdown reasons.
    pub fn describe_owner(&self) -> String {
        format!(
            "project '{}' (ID: {}) in the '{}' environment",
            self.project_name, self.project_id, self.env
        )
    }
}

/// Path of the manifest inside a repository working copy.
pub fn manifest_path(repo: &Path) -> PathBuf {
    repo.join(MANIFEST_DIR).join(MANIFEST_FILE)
}

/// Read the manifest. `Ok(None)` when the repository is unclaimed.
pub async fn read_manifest(repo: &Path) -> CoordinationResult<Option<OwnershipManifest>> {
    let path = manifest_path(repo);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| CoordinationError::invalid_manifest(&path, e.to_string()))
}

/// Write the manifest, creating the namespace directory if needed.
pub async fn write_manifest(repo: &Path, manifest: &OwnershipManifest) -> CoordinationResult<()> {
    let dir = repo.join(MANIFEST_DIR);
    tokio::fs::create_dir_all(&dir).await?;
    let mut body = serde_json::to_string_pretty(manifest)?;
    body.push('\n');
    tokio::fs::write(dir.join(MANIFEST_FILE), body).await?;
    Ok(())
}
