//! Resolved-spec cache: `(group, master name)` to the last resolution.

use crate::types::ResolvedEntry;
use dashmap::DashMap;
use std::sync::Arc;

type CacheKey = (String, String);

/// Concurrent cache of resolution results.
///
/// Entries are replaced whole, never patched, so a reader sees either the
/// previous or the next entry.
#[derive(Debug, Default)]
pub struct ResolvedCache {
    entries: DashMap<CacheKey, Arc<ResolvedEntry>>,
}

impl ResolvedCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(group: &str, master_name: &str) -> CacheKey {
        (group.to_string(), master_name.to_string())
    }

    /// Get the cached entry.
    pub fn get(&self, group: &str, master_name: &str) -> Option<Arc<ResolvedEntry>> {
        self.entries
            .get(&Self::key(group, master_name))
            .map(|e| e.value().clone())
    }

    /// Store an entry, replacing any previous one.
    pub fn put(&self, group: &str, master_name: &str, entry: ResolvedEntry) {
        self.entries
            .insert(Self::key(group, master_name), Arc::new(entry));
    }

    /// Remove an entry. Returns the removed entry, if any.
    pub fn remove(&self, group: &str, master_name: &str) -> Option<Arc<ResolvedEntry>> {
        self.entries
            .remove(&Self::key(group, master_name))
            .map(|(_, e)| e)
    }

    /// Remove `entry` only if it is still the cached value for the key.
    ///
    /// Used by pruning so a fresh resolution racing the check survives.
    pub fn remove_if_same(
        &self,
        group: &str,
        master_name: &str,
        entry: &Arc<ResolvedEntry>,
    ) -> bool {
        self.entries
            .remove_if(&Self::key(group, master_name), |_, current| {
                Arc::ptr_eq(current, entry)
            })
            .is_some()
    }

    /// Drop every entry of a group.
    pub fn remove_group(&self, group: &str) {
        self.entries.retain(|(g, _), _| g != group);
    }

    /// Snapshot of all entries.
    pub fn snapshot(&self) -> Vec<(String, String, Arc<ResolvedEntry>)> {
        self.entries
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
