// Authorization of label assignments through the policy engine.
//
// The policy engine partially evaluates the cluster-access rule for a user;
// the residual becomes a filter over the status table, and whatever the user
// asked for outside the filtered rows is unauthorized.

pub mod client;
pub mod predicate;
pub mod residual;

use async_trait::async_trait;
use hubsync_common::assignment::DesiredAssignment;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::status::StatusDb;
use client::{CompileRequest, PolicyEngine};
use predicate::Predicate;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("failed to look up accessible managed clusters: {0}")]
    Entitlements(#[from] sqlx::Error),
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Subset of `requested` the user may not assign.
    ///
    /// `groups` is accepted for future policy input and currently unused.
    async fn unauthorized(
        &self,
        user: &str,
        groups: &[String],
        requested: &DesiredAssignment,
    ) -> Result<DesiredAssignment, AuthorizationError>;
}

pub struct PolicyAuthorizer<P, S> {
    policy: P,
    status: S,
}

impl<P: PolicyEngine, S: StatusDb> PolicyAuthorizer<P, S> {
    pub fn new(policy: P, status: S) -> Self {
        Self { policy, status }
    }

    /// Row filter for `user`; any policy failure denies everything.
    pub async fn cluster_filter(&self, user: &str) -> Predicate {
        match self.policy.compile(&CompileRequest::cluster_access(user)).await {
            Ok(response) => Predicate::from_queries(response.queries()),
            Err(error) => {
                warn!(%error, user, "policy evaluation failed, denying all clusters");
                Predicate::DenyAll
            }
        }
    }
}

#[async_trait]
impl<P: PolicyEngine, S: StatusDb> Authorizer for PolicyAuthorizer<P, S> {
    async fn unauthorized(
        &self,
        user: &str,
        _groups: &[String],
        requested: &DesiredAssignment,
    ) -> Result<DesiredAssignment, AuthorizationError> {
        let filter = self.cluster_filter(user).await;
        debug!(user, filter = %filter, "resolved cluster filter");

        let entitled = self.status.accessible_managed_clusters(&filter).await?;
        Ok(requested.disjoint_from(&entitled))
    }
}
