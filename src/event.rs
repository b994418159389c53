//! Structured pool events.
//!
//! Every pool operation reports what happened through an [`EventSink`]. The
//! default sink forwards to `tracing`; [`MemorySink`] keeps events in memory
//! for audit trails and tests.

use std::fmt;

use parking_lot::Mutex;

/// Events emitted by pools, connections and the pool manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PoolEvent {
    /// A connection was handed to a caller.
    Acquired,
    /// No connection became available within the acquisition timeout.
    AcquireTimedOut,
    /// A connection was returned by its caller.
    Released,
    /// A connection was closed and removed from the pool.
    Discarded,
    /// A replacement idle member was created.
    Replenished,
    /// An idle member failed its periodic health check.
    HealthCheckFailed,
    /// The pool was closed.
    PoolClosed,
    /// A reconnection attempt is starting.
    ReconnectAttempt,
    /// A reconnection sequence succeeded.
    ReconnectSucceeded,
    /// A reconnection sequence ran out of attempts.
    ReconnectExhausted,
    /// The session factory produced a new session.
    SessionCreated,
    /// An idle session was handed out again.
    SessionReused,
    /// A session was returned to its keyed pool.
    SessionReleased,
    /// A reconciliation sweep could not recover a connection.
    ReconcileFailed,
}

impl PoolEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquired => "pool.acquire",
            Self::AcquireTimedOut => "pool.acquire_timeout",
            Self::Released => "pool.release",
            Self::Discarded => "pool.discard",
            Self::Replenished => "pool.replenish",
            Self::HealthCheckFailed => "pool.health_check_failed",
            Self::PoolClosed => "pool.closed",
            Self::ReconnectAttempt => "reconnect.attempt",
            Self::ReconnectSucceeded => "reconnect.succeeded",
            Self::ReconnectExhausted => "reconnect.exhausted",
            Self::SessionCreated => "session.created",
            Self::SessionReused => "session.reused",
            Self::SessionReleased => "session.released",
            Self::ReconcileFailed => "manager.reconcile_failed",
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attribute list attached to an event.
pub type Attributes<'a> = &'a [(&'static str, String)];

/// Destination for structured pool events.
pub trait EventSink: Send + Sync {
    /// Record one event with its attributes.
    fn emit(&self, event: PoolEvent, attributes: Attributes<'_>);
}

/// Sink that forwards events to `tracing` under the `opcua_pool::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PoolEvent, attributes: Attributes<'_>) {
        let attrs = attributes
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(target: "opcua_pool::events", event = event.name(), "{}", attrs);
    }
}

/// An event captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// The event kind.
    pub event: PoolEvent,
    /// Attributes in emission order.
    pub attributes: Vec<(&'static str, String)>,
}

impl RecordedEvent {
    /// Look up an attribute value by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events of the given kind.
    pub fn count(&self, event: PoolEvent) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PoolEvent, attributes: Attributes<'_>) {
        self.events.lock().push(RecordedEvent {
            event,
            attributes: attributes.to_vec(),
        });
    }
}
