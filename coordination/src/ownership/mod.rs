//! Repository ownership: the committed manifest and the guard that enforces it.

pub mod guard;
pub mod manifest;

pub use guard::{
    CallerIdentity, ClaimInspection, LockdownState, OwnershipStatus, OwnershipVerdict,
    RepoOwnershipGuard,
};
pub use manifest::{
    manifest_path, read_manifest, write_manifest, OwnershipManifest, MANIFEST_DIR, MANIFEST_FILE,
    MANIFEST_VERSION, PRODUCTION_ENV,
};
