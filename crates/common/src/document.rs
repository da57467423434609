// Declarative cluster-membership documents read from git storage.
//
// Each file holds exactly one YAML document whose `kind` selects the
// resource type. Both supported kinds list hub identifiers under
// `spec.identifiers`; the map keys there are informational only, the hub
// name comes from each identifier's `name`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assignment::DesiredAssignment;
use crate::labels::{group_label_key, CLUSTER_SET_LABEL_KEY, DEFAULT_TAG_VALUE};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to parse yaml document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("document kind `{found}` does not match expected kind `{expected}`")]
    KindMismatch { expected: ResourceKind, found: String },

    #[error("document has no metadata.name")]
    MissingName,
}

impl DocumentError {
    /// The document parsed but describes a different resource; callers skip it.
    pub fn is_irrelevant(&self) -> bool {
        matches!(self, Self::KindMismatch { .. })
    }
}

/// Resource kinds understood by the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ManagedClustersGroup,
    ManagedClusterSet,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManagedClustersGroup => "ManagedClustersGroup",
            Self::ManagedClusterSet => "ManagedClusterSet",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies managed clusters within one hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubIdentifier {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "managedClusterIdentifiers")]
    pub managed_cluster_ids: Vec<String>,
}

/// `spec.identifiers`: a list of single-entry maps of hub identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifiers(pub Vec<BTreeMap<String, HubIdentifier>>);

impl Identifiers {
    pub fn to_assignment(&self) -> DesiredAssignment {
        let mut assignment = DesiredAssignment::new();
        for hub in self.0.iter().flat_map(BTreeMap::values) {
            if hub.name.is_empty() {
                continue;
            }
            assignment.assign(hub.name.as_str(), hub.managed_cluster_ids.iter().cloned());
        }
        assignment
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
}

/// Tags a set of managed clusters with a hub-of-hubs group label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedClustersGroup {
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ManagedClustersGroupSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClustersGroupSpec {
    /// Value assigned to the group label key. Empty means a plain tag.
    #[serde(default)]
    pub tag_value: String,
    #[serde(default)]
    pub identifiers: Identifiers,
}

impl ManagedClustersGroup {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let document: Self = serde_yaml::from_slice(bytes)?;
        check_kind(ResourceKind::ManagedClustersGroup, &document.kind)?;
        check_name(&document.metadata)?;
        Ok(document)
    }

    pub fn label_key(&self) -> String {
        group_label_key(&self.metadata.name)
    }

    pub fn label_value(&self) -> &str {
        if self.spec.tag_value.is_empty() {
            DEFAULT_TAG_VALUE
        } else {
            &self.spec.tag_value
        }
    }

    pub fn desired_assignment(&self) -> DesiredAssignment {
        self.spec.identifiers.to_assignment()
    }
}

/// Assigns managed clusters to a `ManagedClusterSet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedClusterSet {
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ManagedClusterSetSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedClusterSetSpec {
    #[serde(default)]
    pub identifiers: Identifiers,
}

impl ManagedClusterSet {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let document: Self = serde_yaml::from_slice(bytes)?;
        check_kind(ResourceKind::ManagedClusterSet, &document.kind)?;
        check_name(&document.metadata)?;
        Ok(document)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn label_key(&self) -> &'static str {
        CLUSTER_SET_LABEL_KEY
    }

    pub fn label_value(&self) -> &str {
        &self.metadata.name
    }

    pub fn desired_assignment(&self) -> DesiredAssignment {
        self.spec.identifiers.to_assignment()
    }
}

fn check_kind(expected: ResourceKind, found: &str) -> Result<(), DocumentError> {
    if found == expected.as_str() {
        Ok(())
    } else {
        Err(DocumentError::KindMismatch { expected, found: found.to_owned() })
    }
}

fn check_name(metadata: &Metadata) -> Result<(), DocumentError> {
    if metadata.name.trim().is_empty() {
        Err(DocumentError::MissingName)
    } else {
        Ok(())
    }
}
