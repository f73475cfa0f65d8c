//! Master/replica selection from a resolved entry.

use crate::error::{Error, Result};
use crate::types::{Address, LookupOptions, ResolvedEntry};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one replica out of a non-empty list.
pub trait Balancer: Send + Sync {
    /// Choose a replica. None falls back to the master.
    fn select(&self, replicas: &[Address]) -> Option<Address>;
}

impl<F> Balancer for F
where
    F: Fn(&[Address]) -> Address + Send + Sync,
{
    fn select(&self, replicas: &[Address]) -> Option<Address> {
        if replicas.is_empty() {
            None
        } else {
            Some(self(replicas))
        }
    }
}

/// Always the first replica.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstReplica;

impl Balancer for FirstReplica {
    fn select(&self, replicas: &[Address]) -> Option<Address> {
        replicas.first().cloned()
    }
}

/// Cycles through replicas.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn select(&self, replicas: &[Address]) -> Option<Address> {
        if replicas.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % replicas.len();
        replicas.get(idx).cloned()
    }
}

/// Uniformly random replica.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomReplica;

impl Balancer for RandomReplica {
    fn select(&self, replicas: &[Address]) -> Option<Address> {
        if replicas.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..replicas.len());
        replicas.get(idx).cloned()
    }
}

/// Choose the address to hand out for `entry`.
///
/// The error marker fails with [`Error::NoEndpointsFound`]. With
/// `prefer_replica` and at least one replica, the balancer decides;
/// otherwise the master is returned.
pub fn choose(
    group: &str,
    master_name: &str,
    entry: &ResolvedEntry,
    options: &LookupOptions,
) -> Result<Address> {
    let ResolvedEntry::Resolved { master, replicas } = entry else {
        return Err(Error::NoEndpointsFound {
            group: group.to_string(),
            master_name: master_name.to_string(),
        });
    };

    if options.prefer_replica && !replicas.is_empty() {
        let balancer: &dyn Balancer = options.balancer.as_deref().unwrap_or(&FirstReplica);
        if let Some(replica) = balancer.select(replicas) {
            return Ok(replica);
        }
    }
    Ok(master.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(replicas: usize) -> ResolvedEntry {
        ResolvedEntry::Resolved {
            master: Address::new("10.0.0.1", 6379),
            replicas: (0..replicas)
                .map(|i| Address::new(format!("10.0.0.{}", i + 2), 6379))
                .collect(),
        }
    }

    #[test]
    fn test_master_when_replica_not_preferred() {
        let addr = choose("g", "m", &entry(2), &LookupOptions::master()).unwrap();
        assert_eq!(addr, Address::new("10.0.0.1", 6379));
    }

    #[test]
    fn test_first_replica_by_default() {
        let addr = choose("g", "m", &entry(2), &LookupOptions::replica()).unwrap();
        assert_eq!(addr, Address::new("10.0.0.2", 6379));
    }

    #[test]
    fn test_master_when_no_replicas() {
        let addr = choose("g", "m", &entry(0), &LookupOptions::replica()).unwrap();
        assert_eq!(addr, Address::new("10.0.0.1", 6379));
    }

    #[test]
    fn test_custom_balancer() {
        let last = |replicas: &[Address]| replicas[replicas.len() - 1].clone();
        let options = LookupOptions::replica().with_balancer(Arc::new(last));
        let addr = choose("g", "m", &entry(3), &options).unwrap();
        assert_eq!(addr, Address::new("10.0.0.4", 6379));
    }

    #[test]
    fn test_round_robin_cycles() {
        let options = LookupOptions::replica().with_balancer(Arc::new(RoundRobin::new()));
        let picks: Vec<_> = (0..4)
            .map(|_| choose("g", "m", &entry(2), &options).unwrap().host)
            .collect();
        assert_eq!(picks, vec!["10.0.0.2", "10.0.0.3", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_random_picks_a_replica() {
        let options = LookupOptions::replica().with_balancer(Arc::new(RandomReplica));
        let resolved = entry(3);
        for _ in 0..20 {
            let addr = choose("g", "m", &resolved, &options).unwrap();
            assert!(resolved.replicas().unwrap().contains(&addr));
        }
    }

    #[test]
    fn test_error_marker_fails() {
        let err = choose("g", "m", &ResolvedEntry::Failed, &LookupOptions::replica()).unwrap_err();
        assert!(matches!(err, Error::NoEndpointsFound { .. }));
    }
}
