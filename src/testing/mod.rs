//! Testing utilities for the resolver.
//!
//! [`MockTransport`] stands in for a set of sentinels and the data nodes they
//! monitor. Tests script what each sentinel reports, make endpoints slow or
//! unreachable, publish failover messages and then count the commands the
//! resolver sent.
//!
//! # Example
//!
//! ```rust,ignore
//! use sentinel_resolver::testing::MockTransport;
//! use sentinel_resolver::{Address, Endpoint, ResolverConfig, SentinelResolver};
//! use std::sync::Arc;
//!
//! let transport = MockTransport::new();
//! let sentinel = Endpoint::new("s1", 26379, Duration::from_millis(100));
//! transport.set_master(&sentinel, "m1", Address::new("10.0.0.1", 6379), vec![]);
//! transport.set_role(&Address::new("10.0.0.1", 6379), "master");
//!
//! let resolver = SentinelResolver::new(ResolverConfig::new(), Arc::new(transport.clone()))?;
//! ```

mod mock;


pub use mock::MockTransport;
