//! Core types shared by the resolver components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::resolver::selector::Balancer;

/// Network address of a master or replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of an endpoint: host and port only.
pub type EndpointKey = Address;

/// A server the resolver talks to, usually a sentinel.
///
/// Identity is `(host, port)`; password and timeout ride along but do not
/// take part in deduplication (see [`Endpoint::key`]).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Endpoint {
    /// Create an endpoint with no password.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            timeout,
        }
    }

    /// Set the password used to authenticate.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Identity used for subscription deduplication and peer merging.
    pub fn key(&self) -> EndpointKey {
        Address::new(self.host.clone(), self.port)
    }

    /// Build an endpoint for `addr` carrying this endpoint's credentials.
    pub fn sibling(&self, addr: &Address) -> Self {
        Self {
            host: addr.host.clone(),
            port: addr.port,
            password: self.password.clone(),
            timeout: self.timeout,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Cached resolution result for a `(group, master name)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEntry {
    /// The master was verified and its replicas listed.
    Resolved {
        master: Address,
        replicas: Vec<Address>,
    },

    /// Every sentinel of the group failed. Sticky until removed.
    Failed,
}

impl ResolvedEntry {
    /// The master address, if resolved.
    pub fn master(&self) -> Option<&Address> {
        match self {
            ResolvedEntry::Resolved { master, .. } => Some(master),
            ResolvedEntry::Failed => None,
        }
    }

    /// The replica addresses, if resolved.
    pub fn replicas(&self) -> Option<&[Address]> {
        match self {
            ResolvedEntry::Resolved { replicas, .. } => Some(replicas),
            ResolvedEntry::Failed => None,
        }
    }

    /// Check if this is the error marker.
    pub fn is_failed(&self) -> bool {
        matches!(self, ResolvedEntry::Failed)
    }
}

/// Per-lookup options for [`SentinelResolver::get_resolved_address`](crate::SentinelResolver::get_resolved_address).
#[derive(Clone, Default)]
pub struct LookupOptions {
    /// Return a replica when one is available.
    pub prefer_replica: bool,
    /// Replica selection policy. Defaults to the first replica.
    pub balancer: Option<Arc<dyn Balancer>>,
}

impl LookupOptions {
    /// Options that return the master.
    pub fn master() -> Self {
        Self::default()
    }

    /// Options that prefer a replica.
    pub fn replica() -> Self {
        Self {
            prefer_replica: true,
            balancer: None,
        }
    }

    /// Set the replica balancer.
    pub fn with_balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }
}

impl fmt::Debug for LookupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupOptions")
            .field("prefer_replica", &self.prefer_replica)
            .field("balancer", &self.balancer.as_ref().map(|_| "<dyn Balancer>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key_ignores_credentials() {
        let a = Endpoint::new("10.0.0.1", 26379, Duration::from_millis(200));
        let b = a.clone().with_password("secret");
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_endpoint_debug_redacts_password() {
        let ep = Endpoint::new("h", 1, Duration::from_secs(1)).with_password("hunter2");
        let debug = format!("{:?}", ep);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_sibling_inherits_credentials() {
        let ep = Endpoint::new("h", 1, Duration::from_secs(2)).with_password("pw");
        let peer = ep.sibling(&Address::new("other", 2));
        assert_eq!(peer.key(), Address::new("other", 2));
        assert_eq!(peer.password.as_deref(), Some("pw"));
        assert_eq!(peer.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_resolved_entry_accessors() {
        let entry = ResolvedEntry::Resolved {
            master: Address::new("10.0.0.1", 6379),
            replicas: vec![Address::new("10.0.0.2", 6379)],
        };
        assert_eq!(entry.master().map(|a| a.to_string()), Some("10.0.0.1:6379".into()));
        assert_eq!(entry.replicas().map(|r| r.len()), Some(1));
        assert!(!entry.is_failed());
        assert!(ResolvedEntry::Failed.master().is_none());
    }
}
