// Managed-cluster label keys owned by the sync pipeline and the merge rule
// applied on every optimistic-concurrency write.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Label assigning a managed cluster to a `ManagedClusterSet`.
pub const CLUSTER_SET_LABEL_KEY: &str = "cluster.open-cluster-management.io/clusterset";
/// Namespace prefix of every label key managed by hub-of-hubs.
pub const HUB_OF_HUBS_GROUP: &str = "hub-of-hubs.open-cluster-management.io";
/// Value used when a label is a plain tag.
pub const DEFAULT_TAG_VALUE: &str = "true";

/// Whether a label key survives a merge.
pub fn label_key_is_allowed(key: &str) -> bool {
    key == CLUSTER_SET_LABEL_KEY || key.starts_with(HUB_OF_HUBS_GROUP)
}

/// Label key of a managed-clusters group, e.g.
/// `hub-of-hubs.open-cluster-management.io/prod-east`.
pub fn group_label_key(group_name: &str) -> String {
    format!("{HUB_OF_HUBS_GROUP}/{group_name}")
}

/// Labels of one managed cluster as stored in the spec database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelState {
    pub labels: BTreeMap<String, String>,
    pub deleted_label_keys: BTreeSet<String>,
}

impl LabelState {
    /// State of a freshly inserted row carrying a single label.
    pub fn with_label(key: &str, value: &str) -> Self {
        Self {
            labels: BTreeMap::from([(key.to_owned(), tag_value(value).to_owned())]),
            deleted_label_keys: BTreeSet::new(),
        }
    }
}

/// Compute the next label state after assigning `key=value`.
///
/// Allowed labels are retained, the new label is added (overwriting any
/// previous value of the same key), and every dropped key is recorded as
/// deleted. A key present in the result is never listed as deleted.
pub fn merge_labels(current: &LabelState, key: &str, value: &str) -> LabelState {
    let mut labels: BTreeMap<String, String> = current
        .labels
        .iter()
        .filter(|(existing, _)| label_key_is_allowed(existing))
        .map(|(existing, existing_value)| (existing.clone(), existing_value.clone()))
        .collect();
    labels.insert(key.to_owned(), tag_value(value).to_owned());

    let deleted_label_keys = current
        .deleted_label_keys
        .iter()
        .chain(current.labels.keys().filter(|existing| !label_key_is_allowed(existing)))
        .filter(|deleted| !labels.contains_key(deleted.as_str()))
        .cloned()
        .collect();

    LabelState { labels, deleted_label_keys }
}

fn tag_value(value: &str) -> &str {
    if value.is_empty() {
        DEFAULT_TAG_VALUE
    } else {
        value
    }
}
