// Entitlement lookups against the read-only status schema.

use async_trait::async_trait;
use hubsync_common::assignment::DesiredAssignment;
use sqlx::PgPool;

use crate::authz::predicate::Predicate;

pub const MANAGED_CLUSTERS_STATUS_TABLE: &str = "status.managed_clusters";

#[async_trait]
pub trait StatusDb: Send + Sync {
    /// Hub → clusters whose status payload satisfies `filter`.
    async fn accessible_managed_clusters(
        &self,
        filter: &Predicate,
    ) -> Result<DesiredAssignment, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct PgStatusDb {
    pool: PgPool,
}

impl PgStatusDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusDb for PgStatusDb {
    async fn accessible_managed_clusters(
        &self,
        filter: &Predicate,
    ) -> Result<DesiredAssignment, sqlx::Error> {
        let sql = accessible_clusters_sql(filter);
        let rows = sqlx::query_as::<_, (String, Option<String>)>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(hub, cluster)| cluster.map(|cluster| (hub, cluster)))
            .collect())
    }
}

fn accessible_clusters_sql(filter: &Predicate) -> String {
    format!(
        "SELECT leaf_hub_name, payload -> 'metadata' ->> 'name' FROM {MANAGED_CLUSTERS_STATUS_TABLE} WHERE TRUE AND ({})",
        filter.to_sql()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlement_query_embeds_filter() {
        assert_eq!(
            accessible_clusters_sql(&Predicate::DenyAll),
            "SELECT leaf_hub_name, payload -> 'metadata' ->> 'name' FROM status.managed_clusters WHERE TRUE AND (FALSE)"
        );
        assert!(accessible_clusters_sql(&Predicate::AllowAll).ends_with("WHERE TRUE AND (TRUE)"));
    }
}
