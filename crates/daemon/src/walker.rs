// Git storage walker: the periodic scheduler driving every registered syncer.
//
// Each directory under the storage root is a repository named after its
// subscription. A cycle visits them sequentially; its aggregate outcome tunes
// the polling interval.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hubsync_common::interval::{ExponentialBackoffPolicy, IntervalPolicy};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::subscription::SubscriptionSource;
use crate::syncer::{StorageToDbSyncer, SyncOutcome};

/// Tally of one pass over the storage root.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub synced: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Orphaned repositories deleted because their subscription is gone.
    pub removed: usize,
    /// Repositories left for the next cycle once the deadline passed.
    pub deferred: usize,
}

impl CycleReport {
    /// Repositories with new content outnumber failed ones.
    pub fn work_happened(&self) -> bool {
        self.synced > self.failed
    }
}

pub struct GitStorageWalker<P = ExponentialBackoffPolicy> {
    root: PathBuf,
    subscriptions: Arc<dyn SubscriptionSource>,
    syncers: HashMap<String, Box<dyn StorageToDbSyncer>>,
    interval_policy: P,
    full_reconciliation_interval: Duration,
}

impl<P: IntervalPolicy> GitStorageWalker<P> {
    pub fn new(
        root: impl Into<PathBuf>,
        subscriptions: Arc<dyn SubscriptionSource>,
        interval_policy: P,
        full_reconciliation_interval: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            subscriptions,
            syncers: HashMap::new(),
            interval_policy,
            full_reconciliation_interval,
        }
    }

    /// Route repositories whose subscription carries `tag` to `syncer`.
    pub fn register(&mut self, tag: impl Into<String>, syncer: Box<dyn StorageToDbSyncer>) {
        self.syncers.insert(tag.into(), syncer);
    }

    pub fn interval_policy(&self) -> &P {
        &self.interval_policy
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    ///
    /// An in-flight cycle always completes before the walker stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(root = %self.root.display(), "initialized git storage walker");
        self.sync_git_repos(true).await;

        let period = self.full_reconciliation_interval;
        let mut full_reconciliation = tokio::time::interval_at(Instant::now() + period, period);
        full_reconciliation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_cycle = Instant::now() + self.interval_policy.interval();

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = full_reconciliation.tick() => {
                    info!(root = %self.root.display(), "running full reconciliation");
                    self.sync_git_repos(true).await;
                }
                _ = tokio::time::sleep_until(next_cycle) => {
                    self.run_cycle().await;
                    next_cycle = Instant::now() + self.interval_policy.interval();
                }
            }
        }

        info!(root = %self.root.display(), "git storage walker stopped");
    }

    /// One regular polling cycle that feeds its outcome back into the
    /// interval policy.
    ///
    /// The cycle is bounded by the policy's max interval. A repository that is
    /// being synced when the deadline passes runs to completion; the ones not
    /// yet visited wait for the next cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let limit = self.interval_policy.max_interval();
        let report = self.sync_pass(false, Some(Instant::now() + limit)).await;
        if report.deferred > 0 {
            warn!(
                root = %self.root.display(),
                limit = %humantime::format_duration(limit),
                deferred = report.deferred,
                "sync cycle ran out of time"
            );
        }

        let previous = self.interval_policy.interval();
        if report.work_happened() {
            self.interval_policy.evaluate();
        } else {
            self.interval_policy.reset();
        }

        let current = self.interval_policy.interval();
        if current != previous {
            info!(
                interval = %humantime::format_duration(current),
                "sync interval has been reset"
            );
        }
        report
    }

    /// Visit every repository once.
    pub async fn sync_git_repos(&mut self, force: bool) -> CycleReport {
        self.sync_pass(force, None).await
    }

    async fn sync_pass(&mut self, force: bool, deadline: Option<Instant>) -> CycleReport {
        let mut report = CycleReport::default();
        let repos = match list_repos(&self.root).await {
            Ok(repos) => repos,
            Err(error) => {
                error!(root = %self.root.display(), %error, "failed to open git storage root");
                report.failed += 1;
                return report;
            }
        };

        let total = repos.len();
        for (visited, (name, path)) in repos.into_iter().enumerate() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                report.deferred = total - visited;
                break;
            }
            match self.sync_repo(&name, &path, force).await {
                RepoOutcome::Synced(SyncOutcome::Synced) => report.synced += 1,
                RepoOutcome::Synced(SyncOutcome::Unchanged) => report.unchanged += 1,
                RepoOutcome::Synced(SyncOutcome::Failed) | RepoOutcome::Failed => {
                    report.failed += 1
                }
                RepoOutcome::Removed => report.removed += 1,
            }
        }

        debug!(
            root = %self.root.display(),
            force,
            synced = report.synced,
            unchanged = report.unchanged,
            failed = report.failed,
            removed = report.removed,
            deferred = report.deferred,
            "finished sync pass"
        );
        report
    }

    async fn sync_repo(&mut self, name: &str, path: &Path, force: bool) -> RepoOutcome {
        let subscription = match self.subscriptions.subscription(name).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => return self.remove_orphan(name, path).await,
            Err(error) => {
                error!(repo = name, %error, "failed to sync local git repo");
                return RepoOutcome::Failed;
            }
        };

        let Some(syncer) = self.syncers.get_mut(&subscription.syncer_tag) else {
            error!(
                repo = name,
                tag = %subscription.syncer_tag,
                "subscription's syncer tag is not registered"
            );
            return RepoOutcome::Failed;
        };

        let outcome = syncer
            .sync_git_repo(
                &subscription.user_identity,
                &subscription.user_group,
                path,
                &subscription.git_path,
                force,
            )
            .await;
        RepoOutcome::Synced(outcome)
    }

    /// Delete the checkout of a deleted subscription and every syncer's memory of it.
    async fn remove_orphan(&mut self, name: &str, path: &Path) -> RepoOutcome {
        for syncer in self.syncers.values_mut() {
            syncer.forget(path);
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(repo = name, "removed repo of deleted subscription");
                RepoOutcome::Removed
            }
            Err(error) => {
                error!(repo = name, %error, "failed to delete repo for deleted subscription");
                RepoOutcome::Failed
            }
        }
    }
}

enum RepoOutcome {
    Synced(SyncOutcome),
    Failed,
    Removed,
}

/// Subdirectories of `root` as (name, path), sorted by name. Stray files are ignored.
async fn list_repos(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut repos = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => repos.push((name, entry.path())),
            Err(name) => warn!(?name, "skipping repo with non UTF-8 name"),
        }
    }
    repos.sort();
    Ok(repos)
}
