//! Builder events and listener registries
//!
//! Builders publish lifecycle events through [`Listeners`]: callback listeners
//! are invoked synchronously on the publishing thread, and every event is also
//! sent on a broadcast channel for subscribers that prefer a receiver.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel behind every listener registry
const EVENT_BUS_CAPACITY: usize = 100;

/// Kind of builder event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderEventType {
    /// A fresh configuration was loaded and published
    ResultCreated,
    /// The cached configuration was discarded
    Reset,
    /// Loading the backing source failed
    LoadFailed,
}

impl std::fmt::Display for BuilderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResultCreated => write!(f, "result_created"),
            Self::Reset => write!(f, "reset"),
            Self::LoadFailed => write!(f, "load_failed"),
        }
    }
}

/// Event emitted by a configuration builder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderEvent {
    /// What happened
    pub event_type: BuilderEventType,
    /// Location (file name or pattern) of the emitting builder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Timestamp of the event
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Error message for failed loads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuilderEvent {
    /// Create a new builder event
    pub fn new(event_type: BuilderEventType, location: Option<&str>) -> Self {
        Self {
            event_type,
            location: location.map(str::to_string),
            timestamp: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    pub fn result_created(location: Option<&str>) -> Self {
        Self::new(BuilderEventType::ResultCreated, location)
    }

    pub fn reset(location: Option<&str>) -> Self {
        Self::new(BuilderEventType::Reset, location)
    }

    pub fn load_failed(location: Option<&str>, error: &dyn std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(BuilderEventType::LoadFailed, location)
        }
    }
}

/// Receives events of type `E`
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// Shared handle to a builder event listener
pub type BuilderListener = Arc<dyn Listener<BuilderEvent>>;

/// Copy-on-write listener registry with a broadcast side channel
pub struct Listeners<E> {
    listeners: ArcSwap<Vec<Arc<dyn Listener<E>>>>,
    bus: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> Listeners<E> {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
            bus,
        }
    }

    /// Register a listener. Registering the same `Arc` twice delivers twice.
    pub fn add(&self, listener: Arc<dyn Listener<E>>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            next
        });
    }

    /// Remove every registration of `listener`; returns whether one existed
    pub fn remove(&self, listener: &Arc<dyn Listener<E>>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|l| !same_listener(l, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn contains(&self, listener: &Arc<dyn Listener<E>>) -> bool {
        self.listeners
            .load()
            .iter()
            .any(|l| same_listener(l, listener))
    }

    /// Current registrations, in registration order
    pub fn snapshot(&self) -> Vec<Arc<dyn Listener<E>>> {
        Vec::clone(&self.listeners.load_full())
    }

    /// Deliver `event` to all listeners, then to broadcast subscribers
    pub fn fire(&self, event: E) {
        let listeners = self.listeners.load_full();
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
        // No subscribers is the common case
        let _ = self.bus.send(event);
    }

    /// Deliver `event` to broadcast subscribers only
    pub fn broadcast(&self, event: E) {
        let _ = self.bus.send(event);
    }

    /// Subscribe to events fired after this call
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.bus.subscribe()
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone + Send + 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("listeners", &self.listeners.load().len())
            .field("subscribers", &self.bus.receiver_count())
            .finish()
    }
}

fn same_listener<E>(a: &Arc<dyn Listener<E>>, b: &Arc<dyn Listener<E>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
