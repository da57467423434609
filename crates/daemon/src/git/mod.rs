// Repository change detection.

pub mod worker;

use std::path::Path;

pub use worker::{FingerprintError, GitWorker};

/// Opaque, comparable identifier of a repository's current state.
pub trait FingerprintSource: Send + Sync {
    fn fingerprint(&self, repo_path: &Path) -> Result<String, FingerprintError>;
}
