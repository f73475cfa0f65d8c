//! Scriptable in-memory transport.

use crate::error::TransportError;
use crate::transport::{Command, MessageStream, PubSubMessage, Reply, SentinelTransport};
use crate::types::{Address, Endpoint, EndpointKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
struct MonitoredMaster {
    master: Option<Address>,
    /// Replica address and its `flags` field.
    replicas: Vec<(Address, String)>,
    peers: Vec<Address>,
}

#[derive(Default)]
struct MockState {
    /// Per sentinel, per master name.
    sentinels: HashMap<EndpointKey, HashMap<String, MonitoredMaster>>,
    roles: HashMap<EndpointKey, String>,
    unreachable: HashSet<EndpointKey>,
    delays: HashMap<EndpointKey, Duration>,
    calls: Vec<(EndpointKey, Command)>,
    streams: HashMap<EndpointKey, Vec<mpsc::UnboundedSender<PubSubMessage>>>,
    subscribe_counts: HashMap<EndpointKey, usize>,
    failing_subscriptions: HashSet<EndpointKey>,
}

/// In-memory stand-in for sentinels and data nodes.
///
/// Cloning shares state, so a test can keep a handle while the resolver
/// owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `sentinel` report `master` and `replicas` for `master_name`.
    pub fn set_master(
        &self,
        sentinel: &Endpoint,
        master_name: &str,
        master: Address,
        replicas: Vec<Address>,
    ) {
        let mut state = self.state.lock();
        let entry = state
            .sentinels
            .entry(sentinel.key())
            .or_default()
            .entry(master_name.to_string())
            .or_default();
        entry.master = Some(master);
        entry.replicas = replicas
            .into_iter()
            .map(|r| (r, "slave".to_string()))
            .collect();
    }

    /// Add a replica with explicit flags.
    pub fn add_replica(&self, sentinel: &Endpoint, master_name: &str, replica: Address, flags: &str) {
        self.state
            .lock()
            .sentinels
            .entry(sentinel.key())
            .or_default()
            .entry(master_name.to_string())
            .or_default()
            .replicas
            .push((replica, flags.to_string()));
    }

    /// Make `sentinel` report `peers` for `master_name`.
    pub fn set_peers(&self, sentinel: &Endpoint, master_name: &str, peers: Vec<Address>) {
        self.state
            .lock()
            .sentinels
            .entry(sentinel.key())
            .or_default()
            .entry(master_name.to_string())
            .or_default()
            .peers = peers;
    }

    /// Set the role reported by a data node.
    pub fn set_role(&self, node: &Address, role: &str) {
        self.state.lock().roles.insert(node.clone(), role.to_string());
    }

    /// Make every call to `endpoint` fail.
    pub fn set_unreachable(&self, endpoint: &Endpoint, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(endpoint.key());
        } else {
            state.unreachable.remove(&endpoint.key());
        }
    }

    /// Delay every command to `endpoint`.
    pub fn set_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.state.lock().delays.insert(endpoint.key(), delay);
    }

    /// Make subscriptions to `endpoint` fail while keeping commands working.
    pub fn fail_subscriptions(&self, endpoint: &Endpoint, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_subscriptions.insert(endpoint.key());
        } else {
            state.failing_subscriptions.remove(&endpoint.key());
        }
    }

    /// Deliver a message to every open subscription on `endpoint`.
    /// Returns the number of receivers.
    pub fn publish(&self, endpoint: &Endpoint, channel: &str, payload: &str) -> usize {
        let mut state = self.state.lock();
        let Some(senders) = state.streams.get_mut(&endpoint.key()) else {
            return 0;
        };
        senders.retain(|tx| tx.send(PubSubMessage::message(channel, payload)).is_ok());
        senders.len()
    }

    /// End every open subscription on `endpoint`.
    pub fn close_subscriptions(&self, endpoint: &Endpoint) {
        self.state.lock().streams.remove(&endpoint.key());
    }

    /// Number of subscription attempts against `endpoint`.
    pub fn subscribe_count(&self, endpoint: &Endpoint) -> usize {
        self.state
            .lock()
            .subscribe_counts
            .get(&endpoint.key())
            .copied()
            .unwrap_or(0)
    }

    /// Number of `SENTINEL <subcommand>` calls across all endpoints.
    pub fn sentinel_calls(&self, subcommand: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, c)| c.sentinel_subcommand().as_deref() == Some(subcommand))
            .count()
    }

    /// Number of commands sent to `endpoint`.
    pub fn calls_to(&self, endpoint: &Address) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(key, _)| key == endpoint)
            .count()
    }

    /// Number of commands sent anywhere.
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn reply(state: &MockState, key: &EndpointKey, command: &Command) -> Result<Reply, TransportError> {
        if command.name.eq_ignore_ascii_case("ROLE") {
            return match state.roles.get(key) {
                Some(role) => Ok(Reply::Array(vec![
                    Reply::Bulk(role.clone()),
                    Reply::Int(0),
                    Reply::Array(vec![]),
                ])),
                None => Err(TransportError::ConnectionFailed {
                    addr: key.to_string(),
                    reason: "no such node".into(),
                }),
            };
        }

        let Some(sub) = command.sentinel_subcommand() else {
            return Ok(Reply::Error(format!("ERR unknown command '{}'", command.name)));
        };
        let master_name = command.args.get(1).cloned().unwrap_or_default();
        let monitored = state.sentinels.get(key).and_then(|m| m.get(&master_name));

        let reply = match (sub.as_str(), monitored) {
            ("get-master-addr-by-name", Some(MonitoredMaster { master: Some(m), .. })) => {
                Reply::strings([m.host.clone(), m.port.to_string()])
            }
            ("get-master-addr-by-name", _) => Reply::Nil,
            ("slaves" | "replicas", Some(m)) => Reply::Array(
                m.replicas
                    .iter()
                    .map(|(addr, flags)| {
                        Reply::strings([
                            "name".to_string(),
                            addr.to_string(),
                            "ip".to_string(),
                            addr.host.clone(),
                            "port".to_string(),
                            addr.port.to_string(),
                            "flags".to_string(),
                            flags.clone(),
                        ])
                    })
                    .collect(),
            ),
            ("sentinels", Some(m)) => Reply::Array(
                m.peers
                    .iter()
                    .map(|addr| {
                        Reply::strings([
                            "ip".to_string(),
                            addr.host.clone(),
                            "port".to_string(),
                            addr.port.to_string(),
                        ])
                    })
                    .collect(),
            ),
            ("sentinels", None) => Reply::Array(vec![]),
            _ => Reply::Error("ERR No such master with that name".into()),
        };
        Ok(reply)
    }
}

#[async_trait]
impl SentinelTransport for MockTransport {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        commands: &[Command],
    ) -> Result<Vec<Reply>, TransportError> {
        let key = endpoint.key();
        let delay = {
            let mut state = self.state.lock();
            for command in commands {
                state.calls.push((key.clone(), command.clone()));
            }
            state.delays.get(&key).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if state.unreachable.contains(&key) {
            return Err(TransportError::Timeout(key.to_string()));
        }
        commands
            .iter()
            .map(|c| Self::reply(&state, &key, c))
            .collect()
    }

    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        _channel: &str,
    ) -> Result<Box<dyn MessageStream>, TransportError> {
        let key = endpoint.key();
        let mut state = self.state.lock();
        *state.subscribe_counts.entry(key.clone()).or_default() += 1;

        if state.unreachable.contains(&key) || state.failing_subscriptions.contains(&key) {
            return Err(TransportError::ConnectionFailed {
                addr: key.to_string(),
                reason: "subscription refused".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.entry(key).or_default().push(tx);
        Ok(Box::new(MockStream { rx }))
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.total_calls())
            .finish()
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

#[async_trait]
impl MessageStream for MockStream {
    async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
