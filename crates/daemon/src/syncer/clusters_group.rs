// ManagedClustersGroup documents: tag the listed clusters with the group label.

use std::sync::Arc;

use async_trait::async_trait;
use hubsync_common::document::{ManagedClustersGroup, ResourceKind};
use tracing::debug;

use super::{authorized_assignment, ResourceTransform, SyncError, UserIdentity};
use crate::authz::Authorizer;
use crate::db::spec::SpecDb;

pub struct ManagedClustersGroupTransform {
    authorizer: Arc<dyn Authorizer>,
    spec_db: Arc<dyn SpecDb>,
}

impl ManagedClustersGroupTransform {
    pub fn new(authorizer: Arc<dyn Authorizer>, spec_db: Arc<dyn SpecDb>) -> Self {
        Self { authorizer, spec_db }
    }
}

#[async_trait]
impl ResourceTransform for ManagedClustersGroupTransform {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ManagedClustersGroup
    }

    async fn apply(&self, user: &UserIdentity, document: &[u8]) -> Result<(), SyncError> {
        let group = ManagedClustersGroup::from_slice(document)?;
        let mut assignment =
            authorized_assignment(self.authorizer.as_ref(), user, group.desired_assignment())
                .await?;

        let label_key = group.label_key();
        debug!(
            group = %group.metadata.name,
            label = %label_key,
            clusters = assignment.cluster_count(),
            "applying managed clusters group"
        );
        self.spec_db
            .update_managed_cluster_labels(&label_key, group.label_value(), &mut assignment)
            .await?;
        Ok(())
    }
}
