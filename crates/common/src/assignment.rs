// Desired hub → managed-cluster assignments and the set algebra the
// authorization and write paths need.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Mapping of hub name → set of managed-cluster identifiers.
///
/// Empty hub entries are never stored: removing the last cluster of a hub
/// removes the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesiredAssignment {
    hubs: BTreeMap<String, BTreeSet<String>>,
}

impl DesiredAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add clusters to a hub, merging with any clusters already assigned to it.
    pub fn assign<I, S>(&mut self, hub: impl Into<String>, clusters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let clusters: BTreeSet<String> = clusters.into_iter().map(Into::into).collect();
        if clusters.is_empty() {
            return;
        }
        self.hubs.entry(hub.into()).or_default().extend(clusters);
    }

    /// Builder-style [`assign`](Self::assign).
    pub fn with<I, S>(mut self, hub: impl Into<String>, clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assign(hub, clusters);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    pub fn hub_count(&self) -> usize {
        self.hubs.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.hubs.values().map(BTreeSet::len).sum()
    }

    pub fn clusters(&self, hub: &str) -> Option<&BTreeSet<String>> {
        self.hubs.get(hub)
    }

    pub fn contains(&self, hub: &str, cluster: &str) -> bool {
        self.hubs.get(hub).is_some_and(|clusters| clusters.contains(cluster))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.hubs.iter()
    }

    /// Every (hub, cluster) pair, hub-major.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.hubs.iter().flat_map(|(hub, clusters)| {
            clusters.iter().map(move |cluster| (hub.as_str(), cluster.as_str()))
        })
    }

    /// Remove one (hub, cluster) pair. Returns whether it was present.
    pub fn remove(&mut self, hub: &str, cluster: &str) -> bool {
        let Some(clusters) = self.hubs.get_mut(hub) else {
            return false;
        };
        let removed = clusters.remove(cluster);
        if clusters.is_empty() {
            self.hubs.remove(hub);
        }
        removed
    }

    /// Remove every pair of `other` from `self`, dropping hubs left empty.
    pub fn subtract(&mut self, other: &DesiredAssignment) {
        for (hub, excluded) in &other.hubs {
            let Some(clusters) = self.hubs.get_mut(hub) else {
                continue;
            };
            clusters.retain(|cluster| !excluded.contains(cluster));
            if clusters.is_empty() {
                self.hubs.remove(hub);
            }
        }
    }

    /// Entries of `self` not covered by `entitled`.
    ///
    /// A hub absent from `entitled` is entitled to nothing, so all of its
    /// requested clusters are returned.
    pub fn disjoint_from(&self, entitled: &DesiredAssignment) -> DesiredAssignment {
        let hubs = self
            .hubs
            .iter()
            .filter_map(|(hub, requested)| {
                let missing: BTreeSet<String> = match entitled.hubs.get(hub) {
                    Some(allowed) => requested.difference(allowed).cloned().collect(),
                    None => requested.clone(),
                };
                (!missing.is_empty()).then(|| (hub.clone(), missing))
            })
            .collect();
        DesiredAssignment { hubs }
    }
}

impl<H, C> FromIterator<(H, C)> for DesiredAssignment
where
    H: Into<String>,
    C: Into<String>,
{
    /// Collect (hub, cluster) pairs.
    fn from_iter<T: IntoIterator<Item = (H, C)>>(iter: T) -> Self {
        let mut assignment = DesiredAssignment::new();
        for (hub, cluster) in iter {
            assignment.assign(hub, [cluster]);
        }
        assignment
    }
}

impl fmt::Display for DesiredAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (hub, clusters)) in self.hubs.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            let joined: Vec<&str> = clusters.iter().map(String::as_str).collect();
            write!(f, "{hub}: [{}]", joined.join(", "))?;
        }
        f.write_str("}")
    }
}
