//! Configuration types for the resolver.

use crate::error::{Error, Result};
use crate::types::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default pub/sub channel carrying failover notifications.
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Main configuration for the resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Channel the subscribers listen on.
    pub switch_master_channel: String,

    /// Sleep between subscription attempts against a sentinel.
    pub resubscribe_backoff: Duration,

    /// Timeout for endpoints created via [`ResolverConfig::endpoint`].
    pub default_timeout: Duration,

    /// Interval of the maintenance loop that prunes stale masters.
    /// None disables the loop.
    pub prune_interval: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            switch_master_channel: SWITCH_MASTER_CHANNEL.to_string(),
            resubscribe_backoff: Duration::from_secs(1),
            default_timeout: Duration::from_millis(500),
            prune_interval: None,
        }
    }
}

impl ResolverConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failover notification channel.
    pub fn with_switch_master_channel(mut self, channel: impl Into<String>) -> Self {
        self.switch_master_channel = channel.into();
        self
    }

    /// Set the backoff between resubscription attempts.
    pub fn with_resubscribe_backoff(mut self, backoff: Duration) -> Self {
        self.resubscribe_backoff = backoff;
        self
    }

    /// Set the default endpoint timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Enable the periodic prune loop.
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = Some(interval);
        self
    }

    /// Build an endpoint using the default timeout.
    pub fn endpoint(&self, host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint::new(host, port, self.default_timeout)
    }

    /// Reject configurations the resolver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.switch_master_channel.is_empty() {
            return Err(Error::Config("switch-master channel must not be empty".into()));
        }
        if self.resubscribe_backoff.is_zero() {
            return Err(Error::Config("resubscribe backoff must be non-zero".into()));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::Config("default timeout must be non-zero".into()));
        }
        if matches!(self.prune_interval, Some(i) if i.is_zero()) {
            return Err(Error::Config("prune interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Options for the data-node connections behind a group.
///
/// Passed through to the embedding application; the password is also used
/// for the ROLE check against a resolved master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// A sentinel group: ordered endpoints plus pool options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Sentinel endpoints in query order.
    pub endpoints: Vec<Endpoint>,

    #[serde(default)]
    pub pool: PoolOptions,
}

impl GroupConfig {
    /// Create a group from its sentinel endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            pool: PoolOptions::default(),
        }
    }

    /// Set pool options.
    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Check the group can be queried with bounded cost.
    pub fn validate(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config("group name must not be empty".into()));
        }
        if self.endpoints.is_empty() {
            return Err(Error::MissingEndpoints(name.to_string()));
        }
        for endpoint in &self.endpoints {
            if endpoint.timeout.is_zero() {
                return Err(Error::Config(format!(
                    "endpoint {} in group {} has no timeout",
                    endpoint, name
                )));
            }
        }
        Ok(())
    }
}

/// Group name to group configuration.
pub type GroupsConfig = HashMap<String, GroupConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ResolverConfig::default();
        assert_eq!(config.switch_master_channel, "+switch-master");
        assert_eq!(config.resubscribe_backoff, Duration::from_secs(1));
        assert!(config.prune_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ResolverConfig::new()
            .with_resubscribe_backoff(Duration::from_millis(50))
            .with_default_timeout(Duration::from_millis(100))
            .with_prune_interval(Duration::from_secs(30));

        assert_eq!(config.resubscribe_backoff, Duration::from_millis(50));
        assert_eq!(config.endpoint("h", 26379).timeout, Duration::from_millis(100));
        assert_eq!(config.prune_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = ResolverConfig::new().with_default_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let group = GroupConfig::new(vec![Endpoint::new("h", 1, Duration::ZERO)]);
        assert!(matches!(group.validate("g"), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_group_rejected() {
        let group = GroupConfig::new(vec![]);
        assert!(matches!(group.validate("g"), Err(Error::MissingEndpoints(_))));
    }

    #[test]
    fn test_group_config_from_json() {
        let json = r#"{
            "endpoints": [
                {"host": "10.0.0.1", "port": 26379, "timeout": {"secs": 1, "nanos": 0}}
            ],
            "pool": {"password": "pw"}
        }"#;
        let group: GroupConfig = serde_json::from_str(json).unwrap();
        assert_eq!(group.endpoints.len(), 1);
        assert_eq!(group.endpoints[0].timeout, Duration::from_secs(1));
        assert_eq!(group.pool.password.as_deref(), Some("pw"));
        assert!(group.validate("g").is_ok());
    }
}
