//! Switch-master subscriptions, one background watcher per sentinel.
//!
//! ```text
//!  Connecting ──► Listening ──(error / stream end)──► Reconnecting
//!                     ▲                                    │
//!                     └──────────── backoff ◄──────────────┘
//!
//!  any state ──(stop)──► Terminated
//! ```
//!
//! A watcher is shared by every group that uses its sentinel. A message
//! `<master> <old-ip> <old-port> <new-ip> <new-port>` drops the cached entry
//! of `<master>` in each of those groups and emits
//! [`ResolverEvent::SwitchMaster`].

use crate::events::{EventNotifier, ResolverEvent};
use crate::resolver::cache::ResolvedCache;
use crate::transport::{PubSubMessage, SentinelTransport};
use crate::types::{Address, Endpoint, EndpointKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Listening,
    Reconnecting,
    Terminated,
}

/// A parsed `+switch-master` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchMasterMessage {
    pub master_name: String,
    /// Old and new master, if the payload carried valid addresses.
    pub addresses: Option<(Address, Address)>,
}

impl SwitchMasterMessage {
    /// Parse a space-delimited payload. None if the master name is missing.
    pub fn parse(payload: &str) -> Option<Self> {
        let parts: Vec<&str> = payload.split_whitespace().collect();
        let master_name = parts.first()?.to_string();

        let addresses = if parts.len() >= 5 {
            match (parts[2].parse::<u16>(), parts[4].parse::<u16>()) {
                (Ok(old_port), Ok(new_port)) => Some((
                    Address::new(parts[1], old_port),
                    Address::new(parts[3], new_port),
                )),
                _ => None,
            }
        } else {
            None
        };

        Some(Self {
            master_name,
            addresses,
        })
    }
}

/// A live watcher on one sentinel.
#[derive(Debug)]
pub struct Subscription {
    endpoint: Endpoint,
    groups: RwLock<HashSet<String>>,
    state: RwLock<SubscriptionState>,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn new(endpoint: Endpoint, group: &str) -> Self {
        Self {
            endpoint,
            groups: RwLock::new(HashSet::from([group.to_string()])),
            state: RwLock::new(SubscriptionState::Connecting),
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// The sentinel being watched.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Groups whose cache entries this watcher invalidates.
    pub fn groups(&self) -> Vec<String> {
        self.groups.read().iter().cloned().collect()
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.read()
    }

    /// Whether the stop flag has been set.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.write() = state;
    }
}

/// What a watcher task needs to do its job.
#[derive(Clone)]
struct WatchContext {
    transport: Arc<dyn SentinelTransport>,
    cache: Arc<ResolvedCache>,
    notifier: Arc<EventNotifier>,
    channel: String,
    backoff: Duration,
}

impl WatchContext {
    fn handle_message(&self, subscription: &Subscription, msg: &PubSubMessage) {
        if msg.kind != "message" {
            trace!(kind = %msg.kind, "Ignoring non-message pub/sub frame");
            return;
        }
        let Some(switch) = SwitchMasterMessage::parse(&msg.payload) else {
            debug!(payload = %msg.payload, "Ignoring empty switch-master payload");
            return;
        };

        for group in subscription.groups() {
            self.cache.remove(&group, &switch.master_name);
            match &switch.addresses {
                Some((old, new)) => {
                    info!(group, master_name = %switch.master_name, %old, %new, "Switch-master received");
                    self.notifier.notify(ResolverEvent::SwitchMaster {
                        group,
                        master_name: switch.master_name.clone(),
                        old: old.clone(),
                        new: new.clone(),
                    });
                }
                None => {
                    warn!(group, payload = %msg.payload, "Switch-master payload without valid addresses");
                }
            }
        }
    }

    async fn watch(self, subscription: Arc<Subscription>) {
        let endpoint = subscription.endpoint.clone();
        let stop = subscription.stop.clone();

        loop {
            if stop.is_cancelled() {
                break;
            }

            let opened = tokio::select! {
                _ = stop.cancelled() => break,
                opened = self.transport.subscribe(&endpoint, &self.channel) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    subscription.set_state(SubscriptionState::Listening);
                    debug!(%endpoint, channel = %self.channel, "Listening for failovers");

                    let mut stopped = false;
                    loop {
                        let next = tokio::select! {
                            _ = stop.cancelled() => {
                                stopped = true;
                                break;
                            }
                            next = stream.next_message() => next,
                        };
                        match next {
                            Some(msg) => self.handle_message(&subscription, &msg),
                            None => break,
                        }
                    }
                    stream.close().await;
                    if stopped {
                        break;
                    }
                    debug!(%endpoint, "Subscription ended, reconnecting");
                }
                Err(e) => {
                    debug!(%endpoint, error = %e, "Failed to subscribe, retrying");
                }
            }

            subscription.set_state(SubscriptionState::Reconnecting);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        subscription.set_state(SubscriptionState::Terminated);
        debug!(%endpoint, "Watcher terminated");
    }
}

/// Owner of all switch-master watchers, keyed by sentinel host and port.
pub struct SwitchMasterSubscriber {
    ctx: WatchContext,
    subscriptions: Mutex<HashMap<EndpointKey, Arc<Subscription>>>,
}

impl SwitchMasterSubscriber {
    pub fn new(
        transport: Arc<dyn SentinelTransport>,
        cache: Arc<ResolvedCache>,
        notifier: Arc<EventNotifier>,
        channel: impl Into<String>,
        backoff: Duration,
    ) -> Self {
        Self {
            ctx: WatchContext {
                transport,
                cache,
                notifier,
                channel: channel.into(),
                backoff,
            },
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a watcher runs for `endpoint` and serves `group`.
    ///
    /// Idempotent: an existing watcher is returned unchanged apart from
    /// learning the group. Must be called within a Tokio runtime.
    pub fn subscribe(&self, group: &str, endpoint: &Endpoint) -> Arc<Subscription> {
        let mut subscriptions = self.subscriptions.lock();
        let key = endpoint.key();

        if let Some(existing) = subscriptions.get(&key) {
            if !existing.is_stopped() {
                existing.groups.write().insert(group.to_string());
                return existing.clone();
            }
        }

        let subscription = Arc::new(Subscription::new(endpoint.clone(), group));
        let handle = tokio::spawn(self.ctx.clone().watch(subscription.clone()));
        *subscription.handle.lock() = Some(handle);
        subscriptions.insert(key, subscription.clone());

        debug!(group, %endpoint, "Subscribed to switch-master");
        subscription
    }

    /// Stop and forget the watcher for `key`, waiting for its task to end.
    ///
    /// Cached entries of every group the watcher served are dropped, since
    /// nothing would invalidate them any more. Returns those groups.
    /// Failures of the task are logged, never returned.
    pub async fn unsubscribe(&self, key: &EndpointKey) -> Vec<String> {
        let removed = self.subscriptions.lock().remove(key);
        let Some(subscription) = removed else {
            return Vec::new();
        };
        self.stop(subscription).await
    }

    /// Stop every watcher.
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<_> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for subscription in drained {
            self.stop(subscription).await;
        }
    }

    async fn stop(&self, subscription: Arc<Subscription>) -> Vec<String> {
        subscription.stop.cancel();
        let handle = subscription.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(endpoint = %subscription.endpoint, error = %e, "Watcher ended abnormally");
            }
        }
        let groups = subscription.groups();
        for group in &groups {
            self.ctx.cache.remove_group(group);
        }
        debug!(endpoint = %subscription.endpoint, groups = groups.len(), "Unsubscribed from switch-master");
        groups
    }

    /// Get the watcher for an endpoint.
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(key).cloned()
    }

    /// Endpoints currently watched.
    pub fn endpoints(&self) -> Vec<EndpointKey> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }
}

impl std::fmt::Debug for SwitchMasterSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchMasterSubscriber")
            .field("channel", &self.ctx.channel)
            .field("subscriptions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::types::ResolvedEntry;

    const CHANNEL: &str = "+switch-master";

    fn sentinel(port: u16) -> Endpoint {
        Endpoint::new("10.0.1.1", port, Duration::from_millis(100))
    }

    fn setup() -> (MockTransport, Arc<ResolvedCache>, Arc<EventNotifier>, SwitchMasterSubscriber) {
        let transport = MockTransport::new();
        let cache = Arc::new(ResolvedCache::new());
        let notifier = Arc::new(EventNotifier::new());
        let subscriber = SwitchMasterSubscriber::new(
            Arc::new(transport.clone()),
            cache.clone(),
            notifier.clone(),
            CHANNEL,
            Duration::from_millis(20),
        );
        (transport, cache, notifier, subscriber)
    }

    async fn wait_for_state(subscription: &Subscription, state: SubscriptionState) {
        for _ in 0..100 {
            if subscription.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state never reached {:?}, was {:?}", state, subscription.state());
    }

    #[test]
    fn test_parse_switch_master_payload() {
        let msg = SwitchMasterMessage::parse("m1 10.0.0.1 6379 10.0.0.2 6380").unwrap();
        assert_eq!(msg.master_name, "m1");
        assert_eq!(
            msg.addresses,
            Some((Address::new("10.0.0.1", 6379), Address::new("10.0.0.2", 6380)))
        );

        let partial = SwitchMasterMessage::parse("m1 10.0.0.1").unwrap();
        assert_eq!(partial.master_name, "m1");
        assert!(partial.addresses.is_none());

        let bad_port = SwitchMasterMessage::parse("m1 a x b 1").unwrap();
        assert!(bad_port.addresses.is_none());

        assert!(SwitchMasterMessage::parse("   ").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_per_endpoint() {
        let (transport, _cache, _notifier, subscriber) = setup();

        let first = subscriber.subscribe("g1", &sentinel(1));
        let second = subscriber.subscribe("g2", &sentinel(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(subscriber.len(), 1);

        let mut groups = first.groups();
        groups.sort();
        assert_eq!(groups, vec!["g1", "g2"]);

        wait_for_state(&first, SubscriptionState::Listening).await;
        assert_eq!(transport.subscribe_count(&sentinel(1)), 1);

        subscriber.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_switch_message_invalidates_and_notifies() {
        let (transport, cache, notifier, subscriber) = setup();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        notifier.register(Arc::new(move |e: &ResolverEvent| sink.lock().push(e.clone())));

        cache.put("g1", "m1", ResolvedEntry::Failed);
        cache.put("g1", "m2", ResolvedEntry::Failed);

        let subscription = subscriber.subscribe("g1", &sentinel(1));
        wait_for_state(&subscription, SubscriptionState::Listening).await;

        transport.publish(&sentinel(1), CHANNEL, "m1 10.0.0.1 6379 10.0.0.2 6379");
        for _ in 0..100 {
            if cache.get("g1", "m1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(cache.get("g1", "m1").is_none());
        assert!(cache.get("g1", "m2").is_some());

        let events = events.lock().clone();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ResolverEvent::SwitchMaster { group, master_name, old, new } => {
                assert_eq!(group, "g1");
                assert_eq!(master_name, "m1");
                assert_eq!(old, &Address::new("10.0.0.1", 6379));
                assert_eq!(new, &Address::new("10.0.0.2", 6379));
            }
            other => panic!("unexpected event {:?}", other),
        }

        subscriber.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let (transport, _cache, _notifier, subscriber) = setup();
        transport.fail_subscriptions(&sentinel(1), true);

        let subscription = subscriber.subscribe("g1", &sentinel(1));
        wait_for_state(&subscription, SubscriptionState::Reconnecting).await;

        transport.fail_subscriptions(&sentinel(1), false);
        wait_for_state(&subscription, SubscriptionState::Listening).await;
        assert!(transport.subscribe_count(&sentinel(1)) >= 2);

        // A dropped stream sends the watcher back through the retry path.
        let before = transport.subscribe_count(&sentinel(1));
        transport.close_subscriptions(&sentinel(1));
        for _ in 0..100 {
            if transport.subscribe_count(&sentinel(1)) > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(transport.subscribe_count(&sentinel(1)) > before);
        wait_for_state(&subscription, SubscriptionState::Listening).await;

        subscriber.unsubscribe_all().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_entries_of_every_served_group() {
        let (_transport, cache, _notifier, subscriber) = setup();
        cache.put("g1", "m1", ResolvedEntry::Failed);
        cache.put("g2", "m1", ResolvedEntry::Failed);
        cache.put("g3", "m1", ResolvedEntry::Failed);

        subscriber.subscribe("g1", &sentinel(1));
        subscriber.subscribe("g2", &sentinel(1));
        subscriber.subscribe("g3", &sentinel(2));

        let mut served = subscriber.unsubscribe(&sentinel(1).key()).await;
        served.sort();
        assert_eq!(served, vec!["g1", "g2"]);
        assert!(cache.get("g1", "m1").is_none());
        assert!(cache.get("g2", "m1").is_none());
        assert!(cache.get("g3", "m1").is_some());

        assert!(subscriber.unsubscribe(&sentinel(1).key()).await.is_empty());
        subscriber.unsubscribe_all().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_terminates_watcher() {
        let (_transport, _cache, _notifier, subscriber) = setup();

        let subscription = subscriber.subscribe("g1", &sentinel(1));
        wait_for_state(&subscription, SubscriptionState::Listening).await;

        subscriber.unsubscribe(&sentinel(1).key()).await;
        assert!(subscription.is_stopped());
        assert_eq!(subscription.state(), SubscriptionState::Terminated);
        assert!(subscriber.get(&sentinel(1).key()).is_none());

        // Unknown endpoints are a no-op.
        subscriber.unsubscribe(&sentinel(2).key()).await;

        let again = subscriber.subscribe("g1", &sentinel(1));
        assert!(!Arc::ptr_eq(&subscription, &again));
        subscriber.unsubscribe_all().await;
        assert!(subscriber.is_empty());
    }
}
