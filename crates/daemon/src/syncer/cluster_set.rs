// ManagedClusterSet documents: ensure the set exists, then label its members.

use std::sync::Arc;

use async_trait::async_trait;
use hubsync_common::document::{ManagedClusterSet, ResourceKind};
use tracing::debug;

use super::{authorized_assignment, ResourceTransform, SyncError, UserIdentity};
use crate::authz::Authorizer;
use crate::cluster_set::ClusterSetRegistry;
use crate::db::spec::SpecDb;

pub struct ManagedClusterSetTransform {
    authorizer: Arc<dyn Authorizer>,
    spec_db: Arc<dyn SpecDb>,
    registry: Arc<dyn ClusterSetRegistry>,
}

impl ManagedClusterSetTransform {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        spec_db: Arc<dyn SpecDb>,
        registry: Arc<dyn ClusterSetRegistry>,
    ) -> Self {
        Self { authorizer, spec_db, registry }
    }
}

#[async_trait]
impl ResourceTransform for ManagedClusterSetTransform {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ManagedClusterSet
    }

    async fn apply(&self, user: &UserIdentity, document: &[u8]) -> Result<(), SyncError> {
        let set = ManagedClusterSet::from_slice(document)?;
        let mut assignment =
            authorized_assignment(self.authorizer.as_ref(), user, set.desired_assignment())
                .await?;

        self.registry.ensure(set.name()).await?;

        debug!(
            cluster_set = set.name(),
            clusters = assignment.cluster_count(),
            "applying managed cluster set"
        );
        self.spec_db
            .update_managed_cluster_labels(set.label_key(), set.label_value(), &mut assignment)
            .await?;
        Ok(())
    }
}
