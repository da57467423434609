// Subscription metadata lookup.
//
// Each directory under the git storage root is named after a subscription in
// the subscriptions namespace. The subscription carries the syncer tag and the
// (base64) identity on whose behalf its repository is synced.

use async_trait::async_trait;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use thiserror::Error;

pub const USER_IDENTITY_ANNOTATION: &str = "apps.open-cluster-management.io/user-identity";
pub const USER_GROUP_ANNOTATION: &str = "apps.open-cluster-management.io/user-group";
pub const GIT_PATH_ANNOTATION: &str = "apps.open-cluster-management.io/git-path";

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to get subscription {name}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("subscription {name} has no {annotation} annotation")]
    MissingAnnotation { name: String, annotation: &'static str },

    #[error("subscription {name} does not set spec.placement.hubOfHubsGitOps")]
    MissingSyncerTag { name: String },
}

/// What the walker needs to dispatch one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMetadata {
    pub syncer_tag: String,
    pub user_identity: String,
    pub user_group: String,
    /// Relative directory inside the repository; empty for the repository root.
    pub git_path: String,
}

impl SubscriptionMetadata {
    pub fn from_object(object: &DynamicObject) -> Result<Self, SubscriptionError> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let annotations = object.metadata.annotations.as_ref();
        let annotation = |key: &'static str| annotations.and_then(|map| map.get(key)).cloned();

        let user_identity = annotation(USER_IDENTITY_ANNOTATION).ok_or_else(|| {
            SubscriptionError::MissingAnnotation {
                name: name.clone(),
                annotation: USER_IDENTITY_ANNOTATION,
            }
        })?;
        let user_group = annotation(USER_GROUP_ANNOTATION).ok_or_else(|| {
            SubscriptionError::MissingAnnotation {
                name: name.clone(),
                annotation: USER_GROUP_ANNOTATION,
            }
        })?;

        let syncer_tag = object
            .data
            .pointer("/spec/placement/hubOfHubsGitOps")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| SubscriptionError::MissingSyncerTag { name: name.clone() })?
            .to_owned();

        Ok(Self {
            syncer_tag,
            user_identity,
            user_group,
            git_path: annotation(GIT_PATH_ANNOTATION).unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// `Ok(None)` when the subscription no longer exists.
    async fn subscription(
        &self,
        name: &str,
    ) -> Result<Option<SubscriptionMetadata>, SubscriptionError>;
}

pub fn subscription_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "apps.open-cluster-management.io",
        "v1",
        "Subscription",
    ))
}

/// Reads subscriptions from the Kubernetes API.
#[derive(Clone)]
pub struct KubeSubscriptions {
    api: Api<DynamicObject>,
}

impl KubeSubscriptions {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced_with(client, namespace, &subscription_resource()) }
    }
}

#[async_trait]
impl SubscriptionSource for KubeSubscriptions {
    async fn subscription(
        &self,
        name: &str,
    ) -> Result<Option<SubscriptionMetadata>, SubscriptionError> {
        let object = self
            .api
            .get_opt(name)
            .await
            .map_err(|source| SubscriptionError::Lookup { name: name.to_owned(), source })?;

        object.as_ref().map(SubscriptionMetadata::from_object).transpose()
    }
}
