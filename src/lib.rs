//! Client-side resolver for Redis Sentinel groups.
//!
//! This crate answers one question for a connection layer: *which address
//! should I connect to right now for master `m` of sentinel group `g`?*
//!
//! - **Cached lookups**: resolved masters and replicas are served from memory
//! - **Single-flight resolution**: concurrent cold lookups of the same key
//!   share one round of sentinel queries
//! - **Failover tracking**: every sentinel in use is watched for
//!   `+switch-master` and stale entries are dropped as soon as it fires
//! - **Ordered fallback**: sentinels that answer move to the front of their
//!   group, the ones that fail move to the back
//!
//! # Example
//!
//! ```rust,no_run
//! use sentinel_resolver::{GroupConfig, LookupOptions, ResolverConfig, SentinelResolver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ResolverConfig::new();
//!     let sentinels = vec![
//!         config.endpoint("10.0.0.10", 26379),
//!         config.endpoint("10.0.0.11", 26379),
//!     ];
//!
//!     let resolver = SentinelResolver::with_redis(config)?;
//!     resolver.add_group("cache", GroupConfig::new(sentinels)).await?;
//!
//!     // Master for writes
//!     let master = resolver
//!         .get_resolved_address("cache", "mymaster", &LookupOptions::master())
//!         .await?;
//!     println!("master at {}", master);
//!
//!     // A replica for reads, falling back to the master if there is none
//!     let replica = resolver
//!         .get_resolved_address("cache", "mymaster", &LookupOptions::replica())
//!         .await?;
//!     println!("reading from {}", replica);
//!
//!     resolver.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Failure model
//!
//! - A sentinel that times out or answers with an unusable master is skipped
//!   and reported through an `error` event.
//! - When every sentinel of a group fails, the key is marked as failed.
//!   Lookups then fail fast with [`Error::NoEndpointsFound`] until a failover
//!   message or [`SentinelResolver::remove_last_resolved_spec`] clears it.

pub mod config;
pub mod error;
pub mod events;
pub mod resolver;
pub mod testing;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{GroupConfig, GroupsConfig, PoolOptions, ResolverConfig, SWITCH_MASTER_CHANNEL};
pub use error::{Error, Result, TransportError};
pub use events::{EventListener, ListenerId, LoggingEventListener, ResolverEvent};
pub use types::{Address, Endpoint, EndpointKey, LookupOptions, ResolvedEntry};

// Resolver
pub use resolver::{
    Balancer, FirstReplica, RandomReplica, RoundRobin, SentinelResolver, Subscription,
    SubscriptionState,
};

// Transport
pub use transport::{
    Command, MessageStream, PubSubMessage, RedisTransport, Reply, SentinelTransport,
};
