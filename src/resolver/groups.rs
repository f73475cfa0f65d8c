//! Group registry: sentinel group name to its ordered endpoints.

use crate::config::{GroupConfig, GroupsConfig};
use crate::types::{Endpoint, EndpointKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// What [`GroupRegistry::merge`] changed.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Names of groups that already existed and were redefined.
    pub replaced: Vec<String>,
    /// Endpoints of replaced groups that the new definition no longer lists.
    pub dropped: Vec<Endpoint>,
}

/// Registry of sentinel groups.
///
/// Endpoint order is the query order. It is rewritten after every resolution
/// so known-good sentinels are tried first; failed ones move to the tail but
/// are kept so they can recover.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, GroupConfig>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole registry. Returns the previous one.
    pub fn replace(&self, config: GroupsConfig) -> GroupsConfig {
        std::mem::replace(&mut *self.groups.write(), config)
    }

    /// Merge groups in; same-named groups are replaced wholesale.
    pub fn merge(&self, config: GroupsConfig) -> MergeOutcome {
        let mut groups = self.groups.write();
        let mut outcome = MergeOutcome::default();
        for (name, group) in config {
            let kept: HashSet<EndpointKey> = group.endpoints.iter().map(Endpoint::key).collect();
            if let Some(old) = groups.insert(name.clone(), group) {
                outcome.dropped.extend(
                    old.endpoints
                        .into_iter()
                        .filter(|e| !kept.contains(&e.key())),
                );
                outcome.replaced.push(name);
            }
        }
        outcome
    }

    /// Remove a group.
    pub fn remove(&self, name: &str) -> Option<GroupConfig> {
        self.groups.write().remove(name)
    }

    /// Get a copy of a group's configuration.
    pub fn get(&self, name: &str) -> Option<GroupConfig> {
        self.groups.read().get(name).cloned()
    }

    /// Get a group's endpoints in query order.
    pub fn endpoints(&self, name: &str) -> Option<Vec<Endpoint>> {
        self.groups.read().get(name).map(|g| g.endpoints.clone())
    }

    /// Names of all registered groups.
    pub fn names(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    /// Check if a group is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.groups.read().contains_key(name)
    }

    /// Rewrite the group's order to `successful` followed by `failed`.
    ///
    /// Endpoints named in neither list keep their relative order at the tail.
    /// Duplicates (by host and port) keep their first position. Unknown
    /// groups are left alone.
    pub fn reorder_after_success(&self, name: &str, successful: &[Endpoint], failed: &[Endpoint]) {
        let mut groups = self.groups.write();
        let Some(group) = groups.get_mut(name) else {
            return;
        };

        let mut seen = HashSet::new();
        let ordered: Vec<Endpoint> = successful
            .iter()
            .chain(failed.iter())
            .chain(group.endpoints.iter())
            .filter(|e| seen.insert(e.key()))
            .cloned()
            .collect();

        group.endpoints = ordered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("10.0.0.1", port, Duration::from_millis(100))
    }

    fn ports(endpoints: &[Endpoint]) -> Vec<u16> {
        endpoints.iter().map(|e| e.port).collect()
    }

    fn groups(entries: &[(&str, Vec<Endpoint>)]) -> GroupsConfig {
        entries
            .iter()
            .map(|(n, e)| (n.to_string(), GroupConfig::new(e.clone())))
            .collect()
    }

    #[test]
    fn test_replace_returns_previous_groups() {
        let registry = GroupRegistry::new();
        assert!(registry.replace(groups(&[("g1", vec![ep(1), ep(2)])])).is_empty());

        let previous = registry.replace(groups(&[("g2", vec![ep(3)])]));
        assert_eq!(ports(&previous["g1"].endpoints), vec![1, 2]);
        assert!(!registry.contains("g1"));
        assert!(registry.contains("g2"));
    }

    #[test]
    fn test_merge_replaces_same_named_groups() {
        let registry = GroupRegistry::new();
        registry.replace(groups(&[("g1", vec![ep(1), ep(2)]), ("g2", vec![ep(5)])]));

        let outcome = registry.merge(groups(&[("g1", vec![ep(2), ep(3)]), ("g3", vec![ep(4)])]));
        assert_eq!(ports(&outcome.dropped), vec![1]);
        assert_eq!(outcome.replaced, vec!["g1"]);
        assert_eq!(ports(&registry.endpoints("g1").unwrap()), vec![2, 3]);
        assert!(registry.contains("g2"));
        assert!(registry.contains("g3"));
    }

    #[test]
    fn test_reorder_keeps_failed_at_tail() {
        let registry = GroupRegistry::new();
        registry.replace(groups(&[("g1", vec![ep(1), ep(2), ep(3)])]));

        registry.reorder_after_success("g1", &[ep(3)], &[ep(1), ep(2)]);
        assert_eq!(ports(&registry.endpoints("g1").unwrap()), vec![3, 1, 2]);
    }

    #[test]
    fn test_reorder_never_drops_unlisted_endpoints() {
        let registry = GroupRegistry::new();
        registry.replace(groups(&[("g1", vec![ep(1), ep(2), ep(3)])]));

        // Only the winner is named; the others stay behind it.
        registry.reorder_after_success("g1", &[ep(3)], &[]);
        assert_eq!(ports(&registry.endpoints("g1").unwrap()), vec![3, 1, 2]);

        // Newly discovered peers are added.
        registry.reorder_after_success("g1", &[ep(4)], &[ep(3)]);
        assert_eq!(ports(&registry.endpoints("g1").unwrap()), vec![4, 3, 1, 2]);
    }

    #[test]
    fn test_reorder_dedupes_and_ignores_unknown_group() {
        let registry = GroupRegistry::new();
        registry.replace(groups(&[("g1", vec![ep(1), ep(2)])]));

        registry.reorder_after_success("g1", &[ep(2), ep(1)], &[ep(2)]);
        assert_eq!(ports(&registry.endpoints("g1").unwrap()), vec![2, 1]);

        registry.reorder_after_success("missing", &[ep(9)], &[]);
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_remove() {
        let registry = GroupRegistry::new();
        registry.replace(groups(&[("g1", vec![ep(1)])]));
        assert!(registry.remove("g1").is_some());
        assert!(registry.remove("g1").is_none());
        assert!(registry.names().is_empty());
    }
}
