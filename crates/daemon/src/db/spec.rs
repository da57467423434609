// Optimistic-concurrency label writer for the spec schema.
//
// Every (hub, cluster) row carries a version counter. Updates are
// conditioned on the version that was read; a writer that loses the race
// leaves the pair pending and retries the remaining batch after a backoff.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use hubsync_common::assignment::DesiredAssignment;
use hubsync_common::interval::{ExponentialBackoffPolicy, IntervalPolicy};
use hubsync_common::labels::{merge_labels, LabelState};
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

pub const MANAGED_CLUSTER_LABELS_TABLE: &str = "spec.managed_clusters_labels";

pub const DEFAULT_WRITE_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SpecDbError {
    #[error("{remaining} managed cluster label(s) left unsynced after {attempts} attempt(s)")]
    Unsynced { remaining: usize, attempts: u32 },
}

/// Label row as read from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRow {
    pub state: LabelState,
    pub version: i64,
}

/// Row-level access to managed-cluster labels.
#[async_trait]
pub trait LabelRowStore: Send + Sync {
    async fn fetch_row(&self, hub: &str, cluster: &str) -> Result<Option<LabelRow>, sqlx::Error>;

    /// Insert a version-0 row. `false` when a row already exists.
    async fn insert_row(
        &self,
        hub: &str,
        cluster: &str,
        state: &LabelState,
    ) -> Result<bool, sqlx::Error>;

    /// Replace the row's labels if its version still equals `expected_version`.
    async fn update_row(
        &self,
        hub: &str,
        cluster: &str,
        state: &LabelState,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error>;
}

#[async_trait]
pub trait SpecDb: Send + Sync {
    /// Assign `label_key=label_value` to every pair of `assignment`.
    ///
    /// Written pairs are removed from `assignment`; on error it holds exactly
    /// the pairs that could not be written.
    async fn update_managed_cluster_labels(
        &self,
        label_key: &str,
        label_value: &str,
        assignment: &mut DesiredAssignment,
    ) -> Result<(), SpecDbError>;
}

#[derive(Debug, Clone)]
pub struct LabelWriter<S> {
    store: S,
    attempts: u32,
    retry_backoff: Duration,
}

impl<S: LabelRowStore> LabelWriter<S> {
    pub fn new(store: S) -> Self {
        Self::with_retry(store, DEFAULT_WRITE_ATTEMPTS, DEFAULT_RETRY_BACKOFF)
    }

    pub fn with_retry(store: S, attempts: u32, retry_backoff: Duration) -> Self {
        Self { store, attempts: attempts.max(1), retry_backoff }
    }

    /// `Ok(true)` once the label is stored, `Ok(false)` on a lost race.
    async fn write_label(
        &self,
        hub: &str,
        cluster: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<bool, sqlx::Error> {
        let Some(row) = self.store.fetch_row(hub, cluster).await? else {
            let state = LabelState::with_label(label_key, label_value);
            return self.store.insert_row(hub, cluster, &state).await;
        };

        let next = merge_labels(&row.state, label_key, label_value);
        if next == row.state {
            return Ok(true);
        }
        self.store.update_row(hub, cluster, &next, row.version).await
    }
}

#[async_trait]
impl<S: LabelRowStore> SpecDb for LabelWriter<S> {
    async fn update_managed_cluster_labels(
        &self,
        label_key: &str,
        label_value: &str,
        assignment: &mut DesiredAssignment,
    ) -> Result<(), SpecDbError> {
        let mut backoff = ExponentialBackoffPolicy::new(self.retry_backoff);

        for attempt in 1..=self.attempts {
            let pending: Vec<(String, String)> = assignment
                .pairs()
                .map(|(hub, cluster)| (hub.to_owned(), cluster.to_owned()))
                .collect();

            for (hub, cluster) in pending {
                match self.write_label(&hub, &cluster, label_key, label_value).await {
                    Ok(true) => {
                        assignment.remove(&hub, &cluster);
                    }
                    Ok(false) => {
                        debug!(
                            hub = %hub,
                            cluster = %cluster,
                            label = label_key,
                            attempt,
                            "label row changed concurrently"
                        );
                    }
                    Err(error) => {
                        warn!(
                            %error,
                            hub = %hub,
                            cluster = %cluster,
                            label = label_key,
                            attempt,
                            "failed to write label"
                        );
                    }
                }
            }

            if assignment.is_empty() {
                return Ok(());
            }
            if attempt < self.attempts {
                tokio::time::sleep(backoff.interval()).await;
                backoff.reset();
            }
        }

        Err(SpecDbError::Unsynced {
            remaining: assignment.cluster_count(),
            attempts: self.attempts,
        })
    }
}

/// PostgreSQL-backed label rows.
#[derive(Debug, Clone)]
pub struct PgLabelStore {
    pool: PgPool,
}

impl PgLabelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type LabelColumns =
    (Option<Json<BTreeMap<String, String>>>, Option<Json<BTreeSet<String>>>, i64);

#[async_trait]
impl LabelRowStore for PgLabelStore {
    async fn fetch_row(&self, hub: &str, cluster: &str) -> Result<Option<LabelRow>, sqlx::Error> {
        let row = sqlx::query_as::<_, LabelColumns>(
            r#"
SELECT labels, deleted_label_keys, version
FROM spec.managed_clusters_labels
WHERE leaf_hub_name = $1
  AND managed_cluster_name = $2
            "#,
        )
        .bind(hub)
        .bind(cluster)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(labels, deleted_label_keys, version)| LabelRow {
            state: LabelState {
                labels: labels.map(|Json(labels)| labels).unwrap_or_default(),
                deleted_label_keys: deleted_label_keys.map(|Json(keys)| keys).unwrap_or_default(),
            },
            version,
        }))
    }

    // The conflict target needs a primary key or unique constraint on
    // (leaf_hub_name, managed_cluster_name); without one Postgres rejects the
    // statement instead of skipping the duplicate.
    async fn insert_row(
        &self,
        hub: &str,
        cluster: &str,
        state: &LabelState,
    ) -> Result<bool, sqlx::Error> {
        let inserted = sqlx::query(
            r#"
INSERT INTO spec.managed_clusters_labels
    (leaf_hub_name, managed_cluster_name, labels, deleted_label_keys, version, updated_at)
VALUES ($1, $2, $3, $4, 0, now())
ON CONFLICT (leaf_hub_name, managed_cluster_name) DO NOTHING
            "#,
        )
        .bind(hub)
        .bind(cluster)
        .bind(Json(&state.labels))
        .bind(Json(&state.deleted_label_keys))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn update_row(
        &self,
        hub: &str,
        cluster: &str,
        state: &LabelState,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error> {
        let updated = sqlx::query(
            r#"
UPDATE spec.managed_clusters_labels
SET labels = $3,
    deleted_label_keys = $4,
    version = version + 1,
    updated_at = now()
WHERE leaf_hub_name = $1
  AND managed_cluster_name = $2
  AND version = $5
            "#,
        )
        .bind(hub)
        .bind(cluster)
        .bind(Json(&state.labels))
        .bind(Json(&state.deleted_label_keys))
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubsync_common::labels::CLUSTER_SET_LABEL_KEY;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    type Key = (String, String);

    #[derive(Clone, Default)]
    struct MemoryStore {
        rows: Arc<Mutex<HashMap<Key, LabelRow>>>,
        /// Remaining lost races per pair; `usize::MAX` never wins.
        contention: Arc<Mutex<HashMap<Key, usize>>>,
        writes: Arc<Mutex<usize>>,
    }

    impl MemoryStore {
        fn seed(&self, hub: &str, cluster: &str, labels: &[(&str, &str)], version: i64) {
            let state = LabelState {
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                deleted_label_keys: BTreeSet::new(),
            };
            self.rows
                .lock()
                .expect("rows lock poisoned")
                .insert((hub.into(), cluster.into()), LabelRow { state, version });
        }

        fn contend(&self, hub: &str, cluster: &str, races: usize) {
            self.contention
                .lock()
                .expect("contention lock poisoned")
                .insert((hub.into(), cluster.into()), races);
        }

        fn row(&self, hub: &str, cluster: &str) -> Option<LabelRow> {
            self.rows
                .lock()
                .expect("rows lock poisoned")
                .get(&(hub.to_string(), cluster.to_string()))
                .cloned()
        }

        fn writes(&self) -> usize {
            *self.writes.lock().expect("writes lock poisoned")
        }

        fn lose_race(&self, key: &Key) -> bool {
            let mut contention = self.contention.lock().expect("contention lock poisoned");
            match contention.get_mut(key) {
                Some(remaining) if *remaining > 0 => {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    true
                }
                _ => false,
            }
        }
    }

    #[async_trait]
    impl LabelRowStore for MemoryStore {
        async fn fetch_row(
            &self,
            hub: &str,
            cluster: &str,
        ) -> Result<Option<LabelRow>, sqlx::Error> {
            Ok(self.row(hub, cluster))
        }

        async fn insert_row(
            &self,
            hub: &str,
            cluster: &str,
            state: &LabelState,
        ) -> Result<bool, sqlx::Error> {
            *self.writes.lock().expect("writes lock poisoned") += 1;
            let mut rows = self.rows.lock().expect("rows lock poisoned");
            let key = (hub.to_string(), cluster.to_string());
            if rows.contains_key(&key) {
                return Ok(false);
            }
            rows.insert(key, LabelRow { state: state.clone(), version: 0 });
            Ok(true)
        }

        async fn update_row(
            &self,
            hub: &str,
            cluster: &str,
            state: &LabelState,
            expected_version: i64,
        ) -> Result<bool, sqlx::Error> {
            *self.writes.lock().expect("writes lock poisoned") += 1;
            let key = (hub.to_string(), cluster.to_string());
            if self.lose_race(&key) {
                return Ok(false);
            }
            let mut rows = self.rows.lock().expect("rows lock poisoned");
            match rows.get_mut(&key) {
                Some(row) if row.version == expected_version => {
                    row.state = state.clone();
                    row.version += 1;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_rows_are_inserted_at_version_zero() {
        let store = MemoryStore::default();
        let writer = LabelWriter::new(store.clone());
        let mut assignment = DesiredAssignment::new().with("hubA", ["c1", "c2"]);

        writer
            .update_managed_cluster_labels(CLUSTER_SET_LABEL_KEY, "set-a", &mut assignment)
            .await
            .expect("write should succeed");

        assert!(assignment.is_empty());
        let row = store.row("hubA", "c2").expect("row inserted");
        assert_eq!(row.version, 0);
        assert_eq!(row.state, LabelState::with_label(CLUSTER_SET_LABEL_KEY, "set-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn existing_row_is_merged_and_version_bumped() {
        let store = MemoryStore::default();
        store.seed("hubA", "c1", &[("k1", "v1")], 3);
        let writer = LabelWriter::new(store.clone());
        let mut assignment = DesiredAssignment::new().with("hubA", ["c1"]);

        writer
            .update_managed_cluster_labels(CLUSTER_SET_LABEL_KEY, "", &mut assignment)
            .await
            .expect("write should succeed");

        let row = store.row("hubA", "c1").expect("row exists");
        assert_eq!(row.version, 4);
        assert_eq!(
            row.state.labels,
            BTreeMap::from([(CLUSTER_SET_LABEL_KEY.to_string(), "true".to_string())])
        );
        assert!(row.state.deleted_label_keys.contains("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_race_is_retried_after_backoff() {
        let store = MemoryStore::default();
        store.seed("hubA", "c1", &[], 7);
        store.contend("hubA", "c1", 1);
        let writer = LabelWriter::new(store.clone());
        let mut assignment = DesiredAssignment::new().with("hubA", ["c1", "c2"]);

        let started = Instant::now();
        writer
            .update_managed_cluster_labels(CLUSTER_SET_LABEL_KEY, "set-a", &mut assignment)
            .await
            .expect("second attempt should succeed");

        assert!(started.elapsed() >= DEFAULT_RETRY_BACKOFF);
        assert!(started.elapsed() < DEFAULT_RETRY_BACKOFF * 2);
        assert!(assignment.is_empty());
        assert_eq!(store.row("hubA", "c1").expect("row").version, 8);
        // c2 was inserted on the first attempt and not rewritten.
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_leaves_only_unsynced_pairs() {
        let store = MemoryStore::default();
        store.seed("hubA", "c1", &[], 0);
        store.contend("hubA", "c1", usize::MAX);
        let writer = LabelWriter::new(store.clone());
        let mut assignment =
            DesiredAssignment::new().with("hubA", ["c1", "c2"]).with("hubB", ["c9"]);

        let started = Instant::now();
        let error = writer
            .update_managed_cluster_labels(CLUSTER_SET_LABEL_KEY, "set-a", &mut assignment)
            .await
            .expect_err("c1 never wins its race");

        assert!(matches!(error, SpecDbError::Unsynced { remaining: 1, attempts: 5 }));
        assert_eq!(assignment, DesiredAssignment::new().with("hubA", ["c1"]));
        // 5s + 10s + 20s + 40s between the five attempts.
        assert!(started.elapsed() >= Duration::from_secs(75));
        assert!(started.elapsed() < Duration::from_secs(80));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_labels_are_not_rewritten() {
        let store = MemoryStore::default();
        store.seed("hubA", "c1", &[(CLUSTER_SET_LABEL_KEY, "set-a")], 2);
        let writer = LabelWriter::new(store.clone());
        let mut assignment = DesiredAssignment::new().with("hubA", ["c1"]);

        writer
            .update_managed_cluster_labels(CLUSTER_SET_LABEL_KEY, "set-a", &mut assignment)
            .await
            .expect("write should succeed");

        assert!(assignment.is_empty());
        assert_eq!(store.writes(), 0);
        assert_eq!(store.row("hubA", "c1").expect("row").version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_assignment_is_a_no_op() {
        let store = MemoryStore::default();
        let writer = LabelWriter::with_retry(store.clone(), 3, Duration::from_secs(1));
        let mut assignment = DesiredAssignment::new();

        writer
            .update_managed_cluster_labels(CLUSTER_SET_LABEL_KEY, "set-a", &mut assignment)
            .await
            .expect("nothing to write");
        assert_eq!(store.writes(), 0);
    }
}
