//! Per-`(group, master name)` locks collapsing concurrent resolutions.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lazily created async locks keyed by `(group, master name)`.
///
/// Locks are never removed; the key space is bounded by the pairs actually
/// looked up.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, group: &str, master_name: &str) -> Arc<Mutex<()>> {
        let key = format!("{}\u{0}{}", group, master_name);
        // `entry` holds the shard lock, so racing first callers converge on
        // the same instance.
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Run `f` while holding the lock for `(group, master_name)`.
    ///
    /// The guard is dropped on every exit path, including a panic in `f` or
    /// the returned future being dropped.
    pub async fn with_lock<F, Fut, T>(&self, group: &str, master_name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(group, master_name);
        let _guard = lock.lock().await;
        f().await
    }

    /// Number of locks created so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
