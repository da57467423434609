// Storage-to-database syncers.
//
// `GenericSyncer` owns the repository bookkeeping (fingerprints, directory
// walk, per-file accounting); a `ResourceTransform` turns one document into
// database writes.

pub mod cluster_set;
pub mod clusters_group;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hubsync_common::assignment::DesiredAssignment;
use hubsync_common::document::{DocumentError, ResourceKind};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authz::{AuthorizationError, Authorizer};
use crate::cluster_set::ClusterSetError;
use crate::db::spec::SpecDbError;
use crate::git::{FingerprintError, FingerprintSource};

pub use cluster_set::ManagedClusterSetTransform;
pub use clusters_group::ManagedClustersGroupTransform;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{what} is not valid base64: {source}")]
    IdentityEncoding {
        what: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("{what} is not valid UTF-8")]
    IdentityText { what: &'static str },

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("fingerprint task did not complete: {0}")]
    FingerprintTask(#[from] tokio::task::JoinError),

    #[error("work path {0:?} leaves the repository")]
    WorkPath(String),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    ClusterSet(#[from] ClusterSetError),

    #[error(transparent)]
    SpecDb(#[from] SpecDbError),

    #[error("{failed} of {total} file(s) failed to sync")]
    Files { failed: usize, total: usize },
}

/// Result of one `sync_git_repo` call, as tallied by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The repository fingerprint matched the last successful sync.
    Unchanged,
    Synced,
    Failed,
}

impl SyncOutcome {
    /// Whether new content reached the database.
    pub fn changed(self) -> bool {
        self == Self::Synced
    }
}

/// Identity a repository is synced on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user: String,
    pub groups: Vec<String>,
}

impl UserIdentity {
    /// Decode the base64 subscription annotations. An empty group means none.
    pub fn decode(user_b64: &str, group_b64: &str) -> Result<Self, SyncError> {
        let user = decode_annotation("user identity", user_b64)?;
        let group = decode_annotation("user group", group_b64)?;
        let groups = if group.is_empty() { Vec::new() } else { vec![group] };
        Ok(Self { user, groups })
    }
}

fn decode_annotation(what: &'static str, value: &str) -> Result<String, SyncError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|source| SyncError::IdentityEncoding { what, source })?;
    String::from_utf8(bytes).map_err(|_| SyncError::IdentityText { what })
}

#[async_trait]
pub trait StorageToDbSyncer: Send {
    /// Sync the documents under `repo_path/work_path` into the database.
    ///
    /// `force` ignores the remembered fingerprint.
    async fn sync_git_repo(
        &mut self,
        user_identity_b64: &str,
        user_group_b64: &str,
        repo_path: &Path,
        work_path: &str,
        force: bool,
    ) -> SyncOutcome;

    /// Drop any state remembered for `repo_path`, so its next sync is a full one.
    fn forget(&mut self, repo_path: &Path);
}

/// Per-kind document handling plugged into `GenericSyncer`.
#[async_trait]
pub trait ResourceTransform: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Apply one document. `DocumentError::KindMismatch` marks a document of
    /// another kind, which the engine skips.
    async fn apply(&self, user: &UserIdentity, document: &[u8]) -> Result<(), SyncError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DirectorySummary {
    applied: usize,
    skipped: usize,
    failed: usize,
}

pub struct GenericSyncer<T> {
    fingerprints: Arc<dyn FingerprintSource>,
    transform: T,
    synced_commits: HashMap<PathBuf, String>,
}

impl<T: ResourceTransform> GenericSyncer<T> {
    pub fn new(fingerprints: Arc<dyn FingerprintSource>, transform: T) -> Self {
        Self { fingerprints, transform, synced_commits: HashMap::new() }
    }

    pub fn kind(&self) -> ResourceKind {
        self.transform.kind()
    }

    /// Fingerprint recorded by the last fully successful sync of `repo_path`.
    pub fn synced_commit(&self, repo_path: &Path) -> Option<&str> {
        self.synced_commits.get(repo_path).map(String::as_str)
    }

    async fn try_sync(
        &mut self,
        user_identity_b64: &str,
        user_group_b64: &str,
        repo_path: &Path,
        work_path: &str,
        force: bool,
    ) -> Result<SyncOutcome, SyncError> {
        if force {
            self.synced_commits.remove(repo_path);
        }

        let fingerprints = Arc::clone(&self.fingerprints);
        let path = repo_path.to_path_buf();
        let commit = tokio::task::spawn_blocking(move || fingerprints.fingerprint(&path)).await??;
        if self.synced_commit(repo_path) == Some(commit.as_str()) {
            debug!(kind = %self.kind(), repo = %repo_path.display(), %commit, "repo unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let user = UserIdentity::decode(user_identity_b64, user_group_b64)?;
        let directory = work_directory(repo_path, work_path)?;
        let summary = self.sync_directory(&user, &directory).await?;

        let total = summary.applied + summary.skipped + summary.failed;
        if summary.failed > 0 {
            return Err(SyncError::Files { failed: summary.failed, total });
        }

        info!(
            kind = %self.kind(),
            repo = %repo_path.display(),
            %commit,
            applied = summary.applied,
            skipped = summary.skipped,
            "synced repo"
        );
        self.synced_commits.insert(repo_path.to_path_buf(), commit);
        Ok(SyncOutcome::Synced)
    }

    /// Apply every regular file directly inside `directory`, in name order.
    async fn sync_directory(
        &self,
        user: &UserIdentity,
        directory: &Path,
    ) -> Result<DirectorySummary, SyncError> {
        let read_error =
            |source: std::io::Error| SyncError::Read { path: directory.to_path_buf(), source };
        let mut entries = tokio::fs::read_dir(directory).await.map_err(read_error)?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
            let is_file = entry.file_type().await.map_err(read_error)?.is_file();
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut summary = DirectorySummary::default();
        for path in files {
            match self.sync_file(user, &path).await {
                Ok(()) => summary.applied += 1,
                Err(SyncError::Document(error)) if error.is_irrelevant() => {
                    debug!(file = %path.display(), %error, "skipping document");
                    summary.skipped += 1;
                }
                Err(error) => {
                    warn!(
                        kind = %self.kind(),
                        file = %path.display(),
                        %error,
                        "failed to sync file"
                    );
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn sync_file(&self, user: &UserIdentity, path: &Path) -> Result<(), SyncError> {
        let document = tokio::fs::read(path)
            .await
            .map_err(|source| SyncError::Read { path: path.to_path_buf(), source })?;
        self.transform.apply(user, &document).await
    }
}

#[async_trait]
impl<T: ResourceTransform> StorageToDbSyncer for GenericSyncer<T> {
    async fn sync_git_repo(
        &mut self,
        user_identity_b64: &str,
        user_group_b64: &str,
        repo_path: &Path,
        work_path: &str,
        force: bool,
    ) -> SyncOutcome {
        match self.try_sync(user_identity_b64, user_group_b64, repo_path, work_path, force).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(
                    kind = %self.kind(),
                    repo = %repo_path.display(),
                    %error,
                    "failed to sync repo"
                );
                SyncOutcome::Failed
            }
        }
    }

    fn forget(&mut self, repo_path: &Path) {
        if self.synced_commits.remove(repo_path).is_some() {
            debug!(kind = %self.kind(), repo = %repo_path.display(), "forgot synced commit");
        }
    }
}

/// `repo_path/work_path`, refusing paths that climb out of the repository.
fn work_directory(repo_path: &Path, work_path: &str) -> Result<PathBuf, SyncError> {
    let relative = Path::new(work_path);
    let escapes = relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(SyncError::WorkPath(work_path.to_owned()));
    }
    Ok(repo_path.join(relative))
}

/// Drop the pairs `user` may not assign from `requested`.
pub(crate) async fn authorized_assignment(
    authorizer: &dyn Authorizer,
    user: &UserIdentity,
    mut requested: DesiredAssignment,
) -> Result<DesiredAssignment, SyncError> {
    let unauthorized = authorizer.unauthorized(&user.user, &user.groups, &requested).await?;
    if !unauthorized.is_empty() {
        info!(
            user = %user.user,
            unauthorized = %unauthorized,
            "dropping managed clusters the user may not assign"
        );
        requested.subtract(&unauthorized);
    }
    Ok(requested)
}
