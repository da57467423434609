// Companion `ManagedClusterSet` resources.

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("failed to create ManagedClusterSet {name}: {source}")]
pub struct ClusterSetError {
    pub name: String,
    #[source]
    pub source: kube::Error,
}

#[async_trait]
pub trait ClusterSetRegistry: Send + Sync {
    /// Create the cluster set if it does not exist yet.
    async fn ensure(&self, name: &str) -> Result<(), ClusterSetError>;
}

pub fn cluster_set_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "cluster.open-cluster-management.io",
        "v1beta1",
        "ManagedClusterSet",
    ))
}

#[derive(Clone)]
pub struct KubeClusterSets {
    api: Api<DynamicObject>,
}

impl KubeClusterSets {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all_with(client, &cluster_set_resource()) }
    }
}

#[async_trait]
impl ClusterSetRegistry for KubeClusterSets {
    async fn ensure(&self, name: &str) -> Result<(), ClusterSetError> {
        let object = DynamicObject::new(name, &cluster_set_resource())
            .data(serde_json::json!({ "spec": {} }));

        match self.api.create(&PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(name, "ManagedClusterSet already exists");
                Ok(())
            }
            Err(source) => Err(ClusterSetError { name: name.to_owned(), source }),
        }
    }
}
