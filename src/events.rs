//! Resolver events and listener fan-out.

use crate::error::Error;
use crate::types::{Address, EndpointKey, ResolvedEntry};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events emitted by the resolver.
#[derive(Debug, Clone)]
pub enum ResolverEvent {
    /// A resolution pass finished, successfully or with the error marker.
    Resolved {
        group: String,
        master_name: String,
        entry: ResolvedEntry,
    },

    /// A sentinel announced a failover.
    SwitchMaster {
        group: String,
        master_name: String,
        old: Address,
        new: Address,
    },

    /// A sentinel failed to resolve the master.
    Error {
        group: String,
        master_name: String,
        /// The sentinel that failed.
        endpoint: EndpointKey,
        error: Arc<Error>,
    },
}

impl ResolverEvent {
    /// Event kind as a short name.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolverEvent::Resolved { .. } => "resolved",
            ResolverEvent::SwitchMaster { .. } => "switch-master",
            ResolverEvent::Error { .. } => "error",
        }
    }

    /// The sentinel group this event concerns.
    pub fn group(&self) -> &str {
        match self {
            ResolverEvent::Resolved { group, .. }
            | ResolverEvent::SwitchMaster { group, .. }
            | ResolverEvent::Error { group, .. } => group,
        }
    }

    /// The master name this event concerns.
    pub fn master_name(&self) -> &str {
        match self {
            ResolverEvent::Resolved { master_name, .. }
            | ResolverEvent::SwitchMaster { master_name, .. }
            | ResolverEvent::Error { master_name, .. } => master_name,
        }
    }
}

/// Listener for resolver events.
pub trait EventListener: Send + Sync + 'static {
    /// Called synchronously for every event.
    fn on_event(&self, event: &ResolverEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ResolverEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ResolverEvent) {
        self(event)
    }
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ResolverEvent) {
        match event {
            ResolverEvent::Resolved {
                group,
                master_name,
                entry: ResolvedEntry::Resolved { master, replicas },
            } => {
                tracing::info!(group, master_name, %master, replicas = replicas.len(), "Master resolved");
            }
            ResolverEvent::Resolved {
                group,
                master_name,
                entry: ResolvedEntry::Failed,
            } => {
                tracing::warn!(group, master_name, "Master unresolvable");
            }
            ResolverEvent::SwitchMaster {
                group,
                master_name,
                old,
                new,
            } => {
                tracing::info!(group, master_name, %old, %new, "Master switched");
            }
            ResolverEvent::Error {
                group,
                master_name,
                endpoint,
                error,
            } => {
                tracing::warn!(group, master_name, %endpoint, %error, "Sentinel failed to resolve master");
            }
        }
    }
}

/// Handle returned by [`EventNotifier::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of events to registered listeners, in registration order.
#[derive(Default)]
pub struct EventNotifier {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn register(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver an event to every listener.
    ///
    /// A panicking listener is logged and skipped; the rest still run.
    pub fn notify(&self, event: ResolverEvent) {
        // Snapshot so listeners may (un)register from inside a callback.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                tracing::warn!(listener = id.0, kind = event.kind(), "Event listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.len())
            .finish()
    }
}
