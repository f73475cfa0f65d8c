//! Sentinel resolution and failover tracking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SentinelResolver                          │
//! │  get_resolved_address(group, master, options)                 │
//! └──────────────────────────────────────────────────────────────┘
//!        │ hit                         │ miss
//!        ▼                             ▼
//! ┌──────────────┐   ┌─────────────────────────────┐
//! │ResolvedCache │◄──│ KeyedLocks ─► ResolutionEngine│──► GroupRegistry
//! └──────────────┘   └─────────────────────────────┘
//!        ▲                             │
//!        │ invalidate                  ▼
//! ┌──────────────────────┐   ┌──────────────────┐
//! │SwitchMasterSubscriber│   │  EventNotifier   │
//! └──────────────────────┘   └──────────────────┘
//! ```
//!
//! Lookups that hit the cache never touch the network. Misses serialize on
//! a per-`(group, master)` lock and re-check the cache before resolving, so
//! a cold start issues one sentinel round trip per key rather than one per
//! caller.

pub mod cache;
pub mod engine;
pub mod groups;
pub mod locks;
pub mod selector;
pub mod subscriber;

pub use cache::ResolvedCache;
pub use engine::ResolutionEngine;
pub use groups::{GroupRegistry, MergeOutcome};
pub use locks::KeyedLocks;
pub use selector::{choose, Balancer, FirstReplica, RandomReplica, RoundRobin};
pub use subscriber::{Subscription, SubscriptionState, SwitchMasterMessage, SwitchMasterSubscriber};

use crate::config::{GroupConfig, GroupsConfig, ResolverConfig};
use crate::error::{Error, Result};
use crate::events::{EventListener, EventNotifier, ListenerId};
use crate::transport::{RedisTransport, SentinelTransport};
use crate::types::{Address, EndpointKey, LookupOptions, ResolvedEntry};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Client-side resolver for sentinel-monitored masters.
///
/// Owns every piece of shared state; create one per process (or per test).
pub struct SentinelResolver {
    config: ResolverConfig,
    registry: Arc<GroupRegistry>,
    cache: Arc<ResolvedCache>,
    locks: KeyedLocks,
    subscriber: Arc<SwitchMasterSubscriber>,
    notifier: Arc<EventNotifier>,
    engine: ResolutionEngine,
    maintenance: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SentinelResolver {
    /// Create a resolver over `transport`.
    pub fn new(config: ResolverConfig, transport: Arc<dyn SentinelTransport>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(GroupRegistry::new());
        let cache = Arc::new(ResolvedCache::new());
        let notifier = Arc::new(EventNotifier::new());
        let subscriber = Arc::new(SwitchMasterSubscriber::new(
            transport.clone(),
            cache.clone(),
            notifier.clone(),
            config.switch_master_channel.clone(),
            config.resubscribe_backoff,
        ));
        let engine = ResolutionEngine::new(
            transport,
            registry.clone(),
            cache.clone(),
            subscriber.clone(),
            notifier.clone(),
            config.default_timeout,
        );

        Ok(Self {
            config,
            registry,
            cache,
            locks: KeyedLocks::new(),
            subscriber,
            notifier,
            engine,
            maintenance: Mutex::new(None),
        })
    }

    /// Create a resolver talking to real sentinels through the `redis` crate.
    pub fn with_redis(config: ResolverConfig) -> Result<Self> {
        Self::new(config, Arc::new(RedisTransport::new()))
    }

    /// Get the configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    // ==================== Configuration ====================

    /// Replace every group.
    ///
    /// Watchers of the previous groups are torn down along with their cached
    /// entries: an entry nobody watches could miss a failover. The next
    /// lookup re-resolves and subscribes again.
    pub async fn set_groups(&self, groups: GroupsConfig) -> Result<()> {
        validate_groups(&groups)?;

        let count = groups.len();
        let previous = self.registry.replace(groups);

        for (name, group) in previous {
            for endpoint in &group.endpoints {
                self.subscriber.unsubscribe(&endpoint.key()).await;
            }
            self.cache.remove_group(&name);
        }
        info!(groups = count, "Sentinel groups replaced");
        Ok(())
    }

    /// Add groups; same-named groups are replaced wholesale and their cached
    /// entries dropped.
    pub async fn add_groups(&self, groups: GroupsConfig) -> Result<()> {
        validate_groups(&groups)?;

        let count = groups.len();
        let outcome = self.registry.merge(groups);
        for endpoint in &outcome.dropped {
            self.subscriber.unsubscribe(&endpoint.key()).await;
        }
        // A redefined group may have lost the watchers behind its entries.
        for name in &outcome.replaced {
            self.cache.remove_group(name);
        }
        debug!(groups = count, "Sentinel groups added");
        Ok(())
    }

    /// Add or replace a single group.
    pub async fn add_group(&self, name: impl Into<String>, group: GroupConfig) -> Result<()> {
        self.add_groups(GroupsConfig::from([(name.into(), group)]))
            .await
    }

    /// Remove a group, its watchers and its cached entries.
    ///
    /// A watcher shared with another group stops as well, so that group's
    /// entries are dropped too and re-resolved on its next lookup.
    /// Returns false if the group did not exist.
    pub async fn remove_group(&self, name: &str) -> bool {
        let Some(group) = self.registry.remove(name) else {
            return false;
        };
        for endpoint in &group.endpoints {
            self.subscriber.unsubscribe(&endpoint.key()).await;
        }
        self.cache.remove_group(name);
        info!(group = name, "Sentinel group removed");
        true
    }

    /// Names of the registered groups.
    pub fn groups(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Current configuration of a group, endpoints in query order.
    pub fn group(&self, name: &str) -> Option<GroupConfig> {
        self.registry.get(name)
    }

    // ==================== Lookup ====================

    /// Get the address to connect to for `master_name` in `group`.
    ///
    /// Served from the cache when possible. Otherwise one caller per key
    /// queries the sentinels while the others wait and then reuse its
    /// result.
    pub async fn get_resolved_address(
        &self,
        group: &str,
        master_name: &str,
        options: &LookupOptions,
    ) -> Result<Address> {
        if group.is_empty() || master_name.is_empty() {
            return Err(Error::Config(
                "group and master name must not be empty".into(),
            ));
        }

        if let Some(entry) = self.cache.get(group, master_name) {
            return choose(group, master_name, &entry, options);
        }
        if !self.registry.contains(group) {
            return Err(Error::GroupNotFound(group.to_string()));
        }

        self.locks
            .with_lock(group, master_name, || async {
                if let Some(entry) = self.cache.get(group, master_name) {
                    return choose(group, master_name, &entry, options);
                }
                self.engine
                    .ask_sentinel_master(group, master_name, options)
                    .await
            })
            .await
    }

    /// The cached entry for a key, if any.
    pub fn resolved_entry(&self, group: &str, master_name: &str) -> Option<ResolvedEntry> {
        self.cache
            .get(group, master_name)
            .map(|e| e.as_ref().clone())
    }

    /// Drop the cached entry for a key, including the error marker.
    pub fn remove_last_resolved_spec(&self, group: &str, master_name: &str) -> bool {
        self.cache.remove(group, master_name).is_some()
    }

    /// Evict cached masters that no longer report the master role.
    pub async fn prune_invalid_resolved_masters(&self) -> usize {
        self.engine.prune_invalid_resolved_masters().await
    }

    // ==================== Events ====================

    /// Register an event listener.
    pub fn register_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.notifier.register(listener)
    }

    /// Unregister an event listener.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.notifier.unregister(id)
    }

    // ==================== Subscriptions ====================

    /// Sentinels currently watched for failovers.
    pub fn subscribed_endpoints(&self) -> Vec<EndpointKey> {
        self.subscriber.endpoints()
    }

    /// The watcher for a sentinel, if any.
    pub fn subscription(&self, key: &EndpointKey) -> Option<Arc<Subscription>> {
        self.subscriber.get(key)
    }

    /// Access the resolution engine.
    pub fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    // ==================== Lifecycle ====================

    /// Start the prune loop if `prune_interval` is configured.
    ///
    /// Returns false if no interval is set or the loop already runs.
    pub fn spawn_maintenance(self: &Arc<Self>) -> bool {
        let Some(interval) = self.config.prune_interval else {
            return false;
        };
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_maintenance(
            Arc::downgrade(self),
            interval,
            token.clone(),
        ));
        *maintenance = Some((token, handle));
        true
    }

    /// Stop the prune loop and every watcher.
    pub async fn shutdown(&self) {
        let maintenance = self.maintenance.lock().take();
        if let Some((token, handle)) = maintenance {
            token.cancel();
            let _ = handle.await;
        }
        self.subscriber.unsubscribe_all().await;
        info!("Sentinel resolver shut down");
    }
}

impl std::fmt::Debug for SentinelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelResolver")
            .field("groups", &self.registry.names())
            .field("cached", &self.cache.len())
            .field("subscriptions", &self.subscriber.len())
            .field("listeners", &self.notifier.len())
            .finish()
    }
}

fn validate_groups(groups: &GroupsConfig) -> Result<()> {
    for (name, group) in groups {
        group.validate(name)?;
    }
    Ok(())
}

async fn run_maintenance(
    resolver: Weak<SentinelResolver>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                let evicted = resolver.prune_invalid_resolved_masters().await;
                if evicted > 0 {
                    info!(evicted, "Pruned stale masters");
                }
            }
            _ = token.cancelled() => {
                debug!("Maintenance loop shutting down");
                break;
            }
        }
    }
}
