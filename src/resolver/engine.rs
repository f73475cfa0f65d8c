//! Resolution engine: query sentinels, verify the master, update the cache.

use crate::error::{Error, Result, TransportError};
use crate::events::{EventNotifier, ResolverEvent};
use crate::resolver::cache::ResolvedCache;
use crate::resolver::groups::GroupRegistry;
use crate::resolver::selector;
use crate::resolver::subscriber::SwitchMasterSubscriber;
use crate::transport::{Command, Reply, SentinelTransport};
use crate::types::{Address, Endpoint, LookupOptions, ResolvedEntry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Replica flags that make a replica unusable.
const UNHEALTHY_REPLICA_FLAGS: &[&str] = &["s_down", "o_down", "disconnected"];

/// Drives sentinel queries for the resolver.
pub struct ResolutionEngine {
    transport: Arc<dyn SentinelTransport>,
    registry: Arc<GroupRegistry>,
    cache: Arc<ResolvedCache>,
    subscriber: Arc<SwitchMasterSubscriber>,
    notifier: Arc<EventNotifier>,
    /// Timeout for role checks when the group is gone.
    default_timeout: Duration,
}

impl ResolutionEngine {
    pub fn new(
        transport: Arc<dyn SentinelTransport>,
        registry: Arc<GroupRegistry>,
        cache: Arc<ResolvedCache>,
        subscriber: Arc<SwitchMasterSubscriber>,
        notifier: Arc<EventNotifier>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            cache,
            subscriber,
            notifier,
            default_timeout,
        }
    }

    /// Discover the sentinels currently monitoring `master_name`.
    ///
    /// Every configured endpoint is asked for its peers. The union of the
    /// endpoints that answered and the peers they report becomes the query
    /// set, each member gets a switch-master watcher, and the registry is
    /// reordered with the responders first. Silent endpoints stay in the
    /// registry at the tail. An empty result means no sentinel answered.
    pub async fn resolve_all_sentinels_for_group(
        &self,
        group: &str,
        master_name: &str,
    ) -> Result<Vec<Endpoint>> {
        let endpoints = self
            .registry
            .endpoints(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        if endpoints.is_empty() {
            return Err(Error::MissingEndpoints(group.to_string()));
        }

        let mut seen = HashSet::new();
        let mut discovered = Vec::new();
        let mut silent = Vec::new();

        for endpoint in &endpoints {
            match self.query_peers(endpoint, master_name).await {
                Ok(peers) => {
                    for candidate in std::iter::once(endpoint.clone()).chain(peers) {
                        if seen.insert(candidate.key()) {
                            discovered.push(candidate);
                        }
                    }
                }
                Err(e) => {
                    debug!(group, master_name, %endpoint, error = %e, "Sentinel did not list peers");
                    silent.push(endpoint.clone());
                }
            }
        }

        if discovered.is_empty() {
            warn!(group, master_name, "No sentinel of the group answered");
            return Ok(discovered);
        }

        for endpoint in &discovered {
            self.subscriber.subscribe(group, endpoint);
        }
        silent.retain(|e| !seen.contains(&e.key()));
        self.registry
            .reorder_after_success(group, &discovered, &silent);

        debug!(group, master_name, sentinels = discovered.len(), "Sentinel set discovered");
        Ok(discovered)
    }

    /// Try to resolve the master through the first of `endpoints`.
    ///
    /// On success the entry is cached and a `resolved` event emitted. On any
    /// failure the stale entry is dropped, an `error` event emitted and the
    /// endpoint's watcher torn down, which also drops the entries of every
    /// group it served. None is returned so the caller can move on to the
    /// next endpoint.
    pub async fn try_resolve_master_spec(
        &self,
        endpoints: &[Endpoint],
        group: &str,
        master_name: &str,
    ) -> Option<(Address, Vec<Address>)> {
        let endpoint = endpoints.first()?;

        match self.query_master(endpoint, group, master_name).await {
            Ok((master, replicas)) => {
                let entry = ResolvedEntry::Resolved {
                    master: master.clone(),
                    replicas: replicas.clone(),
                };
                self.cache.put(group, master_name, entry.clone());
                self.notifier.notify(ResolverEvent::Resolved {
                    group: group.to_string(),
                    master_name: master_name.to_string(),
                    entry,
                });
                info!(group, master_name, %master, %endpoint, "Resolved master");
                Some((master, replicas))
            }
            Err(e) => {
                warn!(group, master_name, %endpoint, error = %e, "Sentinel failed to resolve master");
                self.cache.remove(group, master_name);
                self.notifier.notify(ResolverEvent::Error {
                    group: group.to_string(),
                    master_name: master_name.to_string(),
                    endpoint: endpoint.key(),
                    error: Arc::new(e),
                });
                self.subscriber.unsubscribe(&endpoint.key()).await;
                None
            }
        }
    }

    /// Resolve `master_name` in `group` and pick an address.
    ///
    /// Endpoints are tried in order. On the first success the untried
    /// endpoints and the winner are promoted ahead of the ones that failed.
    /// If none succeeds the error marker is cached, a terminal `resolved`
    /// event is emitted and [`Error::NoEndpointsResolved`] returned.
    ///
    /// This includes the case where no sentinel of the group answered at
    /// all. The marker is sticky: after a full sentinel outage the key keeps
    /// failing with [`Error::NoEndpointsFound`] even once the sentinels are
    /// back, until a switch-master message or
    /// [`SentinelResolver::remove_last_resolved_spec`](crate::SentinelResolver::remove_last_resolved_spec)
    /// clears it.
    pub async fn ask_sentinel_master(
        &self,
        group: &str,
        master_name: &str,
        options: &LookupOptions,
    ) -> Result<Address> {
        let endpoints = self
            .resolve_all_sentinels_for_group(group, master_name)
            .await?;

        let mut tried: Vec<Endpoint> = Vec::new();
        for (idx, endpoint) in endpoints.iter().enumerate() {
            let remaining = &endpoints[idx..];
            if let Some((master, replicas)) = self
                .try_resolve_master_spec(remaining, group, master_name)
                .await
            {
                self.registry
                    .reorder_after_success(group, remaining, &tried);
                let entry = ResolvedEntry::Resolved { master, replicas };
                return selector::choose(group, master_name, &entry, options);
            }
            tried.push(endpoint.clone());
        }

        warn!(group, master_name, tried = tried.len(), "No sentinel resolved master");
        self.cache.put(group, master_name, ResolvedEntry::Failed);
        self.notifier.notify(ResolverEvent::Resolved {
            group: group.to_string(),
            master_name: master_name.to_string(),
            entry: ResolvedEntry::Failed,
        });
        Err(Error::NoEndpointsResolved {
            group: group.to_string(),
            master_name: master_name.to_string(),
        })
    }

    /// Re-check every cached master and evict those no longer reporting
    /// the master role. Returns the number of evicted entries.
    pub async fn prune_invalid_resolved_masters(&self) -> usize {
        let mut evicted = 0;

        for (group, master_name, entry) in self.cache.snapshot() {
            let Some(master) = entry.master() else {
                continue;
            };
            let target = self.data_node_endpoint(&group, master, None);
            if let Err(e) = self.verify_master_role(&target).await {
                if self.cache.remove_if_same(&group, &master_name, &entry) {
                    info!(group, master_name, %master, error = %e, "Evicted stale master");
                    evicted += 1;
                }
            }
        }

        evicted
    }

    /// Ask the role of `endpoint`. Fails unless it reports `master`.
    pub async fn verify_master_role(&self, endpoint: &Endpoint) -> Result<()> {
        let replies = self.transport.execute(endpoint, &[Command::role()]).await?;
        let role = replies
            .first()
            .map(reply_ok)
            .transpose()?
            .and_then(Reply::as_array)
            .and_then(|items| items.first())
            .and_then(Reply::as_str)
            .ok_or_else(|| Error::MalformedReply(format!("ROLE from {}", endpoint)))?;

        if role.eq_ignore_ascii_case("master") {
            Ok(())
        } else {
            Err(Error::RoleMismatch {
                addr: endpoint.to_string(),
                role: role.to_string(),
            })
        }
    }

    async fn query_peers(&self, endpoint: &Endpoint, master_name: &str) -> Result<Vec<Endpoint>> {
        let replies = self
            .transport
            .execute(endpoint, &[Command::sentinels(master_name)])
            .await?;
        let reply = replies
            .first()
            .ok_or_else(|| Error::MalformedReply("empty SENTINEL sentinels reply".into()))?;
        let peers = reply_ok(reply)?
            .as_array()
            .ok_or_else(|| Error::MalformedReply("SENTINEL sentinels is not an array".into()))?;

        Ok(peers
            .iter()
            .filter_map(Reply::to_instance_address)
            .map(|addr| endpoint.sibling(&addr))
            .collect())
    }

    async fn query_master(
        &self,
        endpoint: &Endpoint,
        group: &str,
        master_name: &str,
    ) -> Result<(Address, Vec<Address>)> {
        let replies = self
            .transport
            .execute(
                endpoint,
                &[
                    Command::get_master_addr_by_name(master_name),
                    Command::replicas(master_name),
                ],
            )
            .await?;
        let [master_reply, replicas_reply] = replies.as_slice() else {
            return Err(Error::MalformedReply(format!(
                "expected 2 replies from {}, got {}",
                endpoint,
                replies.len()
            )));
        };

        let master = parse_master_addr(reply_ok(master_reply)?, master_name)?;
        let replicas = parse_replicas(reply_ok(replicas_reply)?)?;

        let target = self.data_node_endpoint(group, &master, Some(endpoint));
        self.verify_master_role(&target).await?;

        Ok((master, replicas))
    }

    /// Endpoint for a data node, authenticated with the group's pool password.
    fn data_node_endpoint(&self, group: &str, addr: &Address, via: Option<&Endpoint>) -> Endpoint {
        let config = self.registry.get(group);
        let timeout = via
            .map(|e| e.timeout)
            .or_else(|| config.as_ref().and_then(|c| c.endpoints.first()).map(|e| e.timeout))
            .unwrap_or(self.default_timeout);

        let mut endpoint = Endpoint::new(addr.host.clone(), addr.port, timeout);
        endpoint.password = config.and_then(|c| c.pool.password);
        endpoint
    }
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Turn an error reply into an error.
fn reply_ok(reply: &Reply) -> Result<&Reply> {
    match reply {
        Reply::Error(msg) => Err(Error::Transport(TransportError::Command(msg.clone()))),
        other => Ok(other),
    }
}

fn parse_master_addr(reply: &Reply, master_name: &str) -> Result<Address> {
    if reply.is_nil() {
        return Err(Error::MasterUnknown(master_name.to_string()));
    }
    let items = reply
        .as_array()
        .ok_or_else(|| Error::MalformedReply("master address is not an array".into()))?;
    match items {
        [] => Err(Error::MasterUnknown(master_name.to_string())),
        [host, port, ..] => {
            let host = host
                .as_str()
                .ok_or_else(|| Error::MalformedReply("master host is not a string".into()))?;
            let port = match port {
                Reply::Int(n) => u16::try_from(*n).ok(),
                other => other.as_str().and_then(|p| p.parse().ok()),
            }
            .ok_or_else(|| Error::MalformedReply("master port is not a port".into()))?;
            Ok(Address::new(host, port))
        }
        _ => Err(Error::MalformedReply("master address is truncated".into())),
    }
}

fn parse_replicas(reply: &Reply) -> Result<Vec<Address>> {
    let items = reply
        .as_array()
        .ok_or_else(|| Error::MalformedReply("replica list is not an array".into()))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let fields = item.to_field_map()?;
            let flags = fields.get("flags").map(String::as_str).unwrap_or("");
            if flags
                .split(',')
                .any(|f| UNHEALTHY_REPLICA_FLAGS.contains(&f))
            {
                return None;
            }
            item.to_instance_address()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_master_addr() {
        let reply = Reply::strings(["10.0.0.1", "6379"]);
        assert_eq!(
            parse_master_addr(&reply, "m").unwrap(),
            Address::new("10.0.0.1", 6379)
        );
        assert!(matches!(
            parse_master_addr(&Reply::Nil, "m"),
            Err(Error::MasterUnknown(_))
        ));
        assert!(matches!(
            parse_master_addr(&Reply::strings(["10.0.0.1"]), "m"),
            Err(Error::MalformedReply(_))
        ));
        assert!(matches!(
            parse_master_addr(&Reply::strings(["10.0.0.1", "port"]), "m"),
            Err(Error::MalformedReply(_))
        ));
    }

    #[test]
    fn test_parse_replicas_skips_unhealthy() {
        let reply = Reply::Array(vec![
            Reply::strings(["ip", "10.0.0.2", "port", "6379", "flags", "slave"]),
            Reply::strings(["ip", "10.0.0.3", "port", "6379", "flags", "slave,s_down"]),
            Reply::strings(["ip", "10.0.0.4", "port", "6379", "flags", "slave,disconnected"]),
            Reply::strings(["ip", "10.0.0.5", "port", "6380"]),
        ]);
        assert_eq!(
            parse_replicas(&reply).unwrap(),
            vec![Address::new("10.0.0.2", 6379), Address::new("10.0.0.5", 6380)]
        );
    }

    #[test]
    fn test_error_reply_becomes_error() {
        let reply = Reply::Error("ERR No such master with that name".into());
        assert!(matches!(
            reply_ok(&reply),
            Err(Error::Transport(TransportError::Command(_)))
        ));
    }

    fn engine_with(transport: &crate::testing::MockTransport, endpoints: Vec<Endpoint>) -> ResolutionEngine {
        use crate::config::GroupConfig;

        let registry = Arc::new(GroupRegistry::new());
        registry.replace([("g1".to_string(), GroupConfig::new(endpoints))].into());
        let cache = Arc::new(ResolvedCache::new());
        let notifier = Arc::new(EventNotifier::new());
        let transport: Arc<dyn SentinelTransport> = Arc::new(transport.clone());
        let subscriber = Arc::new(SwitchMasterSubscriber::new(
            transport.clone(),
            cache.clone(),
            notifier.clone(),
            "+switch-master",
            Duration::from_millis(20),
        ));
        ResolutionEngine::new(transport, registry, cache, subscriber, notifier, Duration::from_millis(100))
    }

    fn sentinel(host: &str) -> Endpoint {
        Endpoint::new(host, 26379, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_silent_group_discovers_nothing() {
        let transport = crate::testing::MockTransport::new();
        let a = sentinel("a");
        transport.set_unreachable(&a, true);

        let engine = engine_with(&transport, vec![a]);
        let discovered = engine.resolve_all_sentinels_for_group("g1", "m1").await.unwrap();
        assert!(discovered.is_empty());
        assert!(engine.subscriber.is_empty());

        assert!(matches!(
            engine.resolve_all_sentinels_for_group("nope", "m1").await,
            Err(Error::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_try_resolve_caches_on_success_only() {
        let transport = crate::testing::MockTransport::new();
        let (a, b) = (sentinel("a"), sentinel("b"));
        let master = Address::new("10.0.0.1", 6379);
        transport.set_master(&b, "m1", master.clone(), vec![]);
        transport.set_role(&master, "master");

        let engine = engine_with(&transport, vec![a.clone(), b.clone()]);
        engine.cache.put("g1", "m1", ResolvedEntry::Failed);

        // `a` does not know the master: the stale entry goes away.
        assert!(engine.try_resolve_master_spec(&[a, b.clone()], "g1", "m1").await.is_none());
        assert!(engine.cache.get("g1", "m1").is_none());

        let (resolved, replicas) = engine.try_resolve_master_spec(&[b], "g1", "m1").await.unwrap();
        assert_eq!(resolved, master);
        assert!(replicas.is_empty());
        assert_eq!(engine.cache.get("g1", "m1").unwrap().master(), Some(&master));
        assert!(engine.try_resolve_master_spec(&[], "g1", "m1").await.is_none());
    }

    #[tokio::test]
    async fn test_verify_master_role() {
        let transport = crate::testing::MockTransport::new();
        let engine = engine_with(&transport, vec![sentinel("a")]);
        let node = Endpoint::new("10.0.0.1", 6379, Duration::from_millis(100));

        transport.set_role(&node.key(), "master");
        assert!(engine.verify_master_role(&node).await.is_ok());

        transport.set_role(&node.key(), "slave");
        assert!(matches!(
            engine.verify_master_role(&node).await,
            Err(Error::RoleMismatch { .. })
        ));

        let unknown = Endpoint::new("10.0.0.9", 6379, Duration::from_millis(100));
        assert!(matches!(
            engine.verify_master_role(&unknown).await,
            Err(Error::Transport(TransportError::ConnectionFailed { .. }))
        ));
    }
}
