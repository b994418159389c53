//! Connection state machine and health telemetry.

use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Lifecycle status of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ConnectionStatus {
    /// Never connected.
    #[default]
    Unknown,
    /// A session-level connect is in progress.
    Connecting,
    /// Connected and answering.
    Connected,
    /// A session-level disconnect is in progress.
    Disconnecting,
    /// Not connected.
    Disconnected,
    /// Being re-established after a failure.
    Reconnecting,
    /// The last operation failed.
    Error,
    /// Timed out or failed validation too often. The pool replaces it.
    Failed,
    /// A reconnection policy ran out of attempts.
    ReconnectionFailed,
    /// Connected, but the last ping read nothing back.
    NoResponse,
}

impl ConnectionStatus {
    /// Every status, in declaration order.
    pub const ALL: [ConnectionStatus; 10] = [
        Self::Unknown,
        Self::Connecting,
        Self::Connected,
        Self::Disconnecting,
        Self::Disconnected,
        Self::Reconnecting,
        Self::Error,
        Self::Failed,
        Self::ReconnectionFailed,
        Self::NoResponse,
    ];

    /// Statuses reachable from this one by a regular transition.
    pub fn allowed_targets(&self) -> &'static [ConnectionStatus] {
        use ConnectionStatus::*;
        match self {
            Unknown => &[Connecting],
            Connecting => &[Connected, Disconnected, Error],
            Connected => &[Disconnecting, Error, Reconnecting, NoResponse],
            Disconnecting => &[Disconnected, Error],
            Disconnected => &[Connecting, Error],
            Error => &[Reconnecting, Disconnected],
            Reconnecting => &[Connected, Error],
            Failed => &[Reconnecting, Error],
            NoResponse => &[Connected, Reconnecting, Error, Disconnecting],
            ReconnectionFailed => &[Reconnecting, Disconnected],
        }
    }

    /// Check whether `target` is a legal next status.
    pub fn can_transition_to(&self, target: ConnectionStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Check if the connection is usable.
    pub fn is_connected(&self) -> bool {
        *self == ConnectionStatus::Connected
    }

    /// Check if a connection attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Check if the connection has failed and should be replaced.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::ReconnectionFailed)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
            Self::Failed => "FAILED",
            Self::ReconnectionFailed => "RECONNECTION_FAILED",
            Self::NoResponse => "NO_RESPONSE",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health counters and timestamps of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthMetrics {
    /// Time of the last transition to `Connected`.
    pub last_connected: Option<Instant>,
    /// Time of the last transition to `Connecting`.
    pub last_connecting: Option<Instant>,
    /// Time of the last transition to `Disconnected`.
    pub last_disconnected: Option<Instant>,
    /// Time of the last transition to `Disconnecting`.
    pub last_disconnecting: Option<Instant>,
    /// Time of the last transition to `Reconnecting`.
    pub last_reconnecting: Option<Instant>,
    /// Time of the last transition to `Failed`.
    pub last_failed: Option<Instant>,
    /// Number of transitions to `Connected`.
    pub connection_count: u64,
    /// Number of transitions to `Connecting`.
    pub connecting_count: u64,
    /// Number of transitions to `Error`.
    pub error_count: u64,
    /// Number of transitions to `Unknown`.
    pub unknown_status_count: u64,
    /// Number of transitions to `Reconnecting`.
    pub reconnecting_count: u64,
    /// Number of transitions to `Failed`.
    pub failed_count: u64,
}

impl HealthMetrics {
    /// Time since the last successful connection.
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.last_connected.map(|t| t.elapsed())
    }
}

type MetricsHandler = fn(&mut HealthMetrics, Instant);

/// Effect applied to the metrics when `status` is entered.
fn metrics_handler(status: ConnectionStatus) -> Option<MetricsHandler> {
    use ConnectionStatus::*;
    let handler: MetricsHandler = match status {
        Connected => |m, now| {
            m.last_connected = Some(now);
            m.connection_count += 1;
        },
        Connecting => |m, now| {
            m.last_connecting = Some(now);
            m.connecting_count += 1;
        },
        Disconnected => |m, now| m.last_disconnected = Some(now),
        Disconnecting => |m, now| m.last_disconnecting = Some(now),
        Reconnecting => |m, now| {
            m.last_reconnecting = Some(now);
            m.reconnecting_count += 1;
        },
        Error => |m, _| m.error_count += 1,
        Failed => |m, now| {
            m.last_failed = Some(now);
            m.failed_count += 1;
        },
        Unknown => |m, _| m.unknown_status_count += 1,
        NoResponse | ReconnectionFailed => return None,
    };
    Some(handler)
}

#[derive(Debug, Default)]
struct StateInner {
    status: ConnectionStatus,
    metrics: HealthMetrics,
}

impl StateInner {
    fn enter(&mut self, target: ConnectionStatus) -> ConnectionStatus {
        let previous = self.status;
        self.status = target;
        match metrics_handler(target) {
            Some(handler) => handler(&mut self.metrics, Instant::now()),
            None => tracing::trace!(status = %target, "no metrics handler for status"),
        }
        previous
    }
}

/// Validated status of one connection together with its health metrics.
///
/// Status and metrics live under one lock, so a reader never sees a status
/// without the metrics update that came with it.
#[derive(Debug, Default)]
pub struct ConnectionState {
    inner: Mutex<StateInner>,
}

impl ConnectionState {
    /// Create a state starting at `Unknown` with zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `target` if the table allows it. Returns the previous status.
    ///
    /// An illegal move leaves status and metrics untouched.
    pub fn transition(&self, target: ConnectionStatus) -> Result<ConnectionStatus> {
        let mut inner = self.inner.lock();
        let from = inner.status;
        if !from.can_transition_to(target) {
            tracing::warn!(%from, to = %target, "rejected state transition");
            return Err(PoolError::InvalidTransition { from, to: target });
        }
        inner.enter(target);
        tracing::debug!(%from, to = %target, "state transition");
        Ok(from)
    }

    /// Like [`transition`](Self::transition), but a no-op when already at `target`.
    pub fn advance(&self, target: ConnectionStatus) -> Result<ConnectionStatus> {
        let mut inner = self.inner.lock();
        let from = inner.status;
        if from == target {
            return Ok(from);
        }
        if !from.can_transition_to(target) {
            tracing::warn!(%from, to = %target, "rejected state transition");
            return Err(PoolError::InvalidTransition { from, to: target });
        }
        inner.enter(target);
        tracing::debug!(%from, to = %target, "state transition");
        Ok(from)
    }

    /// Impose `target` without consulting the table. Metrics are still applied.
    ///
    /// Reserved for outcomes the runtime decides on, such as timeouts and
    /// exhausted reconnection.
    pub fn force(&self, target: ConnectionStatus) -> ConnectionStatus {
        let from = self.inner.lock().enter(target);
        tracing::debug!(%from, to = %target, "forced state transition");
        from
    }

    /// Always settle on `target`, applying its metrics, and log whether the
    /// table allowed the move. A no-op when already at `target`.
    pub fn transition_or_force(&self, target: ConnectionStatus) -> ConnectionStatus {
        let mut inner = self.inner.lock();
        let from = inner.status;
        if from != target {
            inner.enter(target);
            tracing::debug!(
                %from,
                to = %target,
                legal = from.can_transition_to(target),
                "settled state"
            );
        }
        from
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    /// Copy of the current metrics.
    pub fn metrics(&self) -> HealthMetrics {
        self.inner.lock().metrics.clone()
    }

    /// Status and metrics read together.
    pub fn snapshot(&self) -> (ConnectionStatus, HealthMetrics) {
        let inner = self.inner.lock();
        (inner.status, inner.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    fn state_at(status: ConnectionStatus) -> ConnectionState {
        let state = ConnectionState::new();
        state.force(status);
        state
    }

    fn changed_fields(before: &HealthMetrics, after: &HealthMetrics) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let stamps = [
            ("last_connected", before.last_connected != after.last_connected),
            ("last_connecting", before.last_connecting != after.last_connecting),
            ("last_disconnected", before.last_disconnected != after.last_disconnected),
            ("last_disconnecting", before.last_disconnecting != after.last_disconnecting),
            ("last_reconnecting", before.last_reconnecting != after.last_reconnecting),
            ("last_failed", before.last_failed != after.last_failed),
            ("connection_count", before.connection_count != after.connection_count),
            ("connecting_count", before.connecting_count != after.connecting_count),
            ("error_count", before.error_count != after.error_count),
            ("unknown_status_count", before.unknown_status_count != after.unknown_status_count),
            ("reconnecting_count", before.reconnecting_count != after.reconnecting_count),
            ("failed_count", before.failed_count != after.failed_count),
        ];
        for (name, differs) in stamps {
            if differs {
                changed.push(name);
            }
        }
        changed
    }

    fn expected_fields(target: ConnectionStatus) -> Vec<&'static str> {
        match target {
            Connected => vec!["last_connected", "connection_count"],
            Connecting => vec!["last_connecting", "connecting_count"],
            Disconnected => vec!["last_disconnected"],
            Disconnecting => vec!["last_disconnecting"],
            Reconnecting => vec!["last_reconnecting", "reconnecting_count"],
            Error => vec!["error_count"],
            Failed => vec!["last_failed", "failed_count"],
            Unknown => vec!["unknown_status_count"],
            NoResponse | ReconnectionFailed => vec![],
        }
    }

    #[test]
    fn test_transition_table_legality() {
        for from in ConnectionStatus::ALL {
            for to in ConnectionStatus::ALL {
                let state = state_at(from);
                let result = state.transition(to);
                if from.can_transition_to(to) {
                    assert_eq!(result.unwrap(), from, "{from} -> {to}");
                    assert_eq!(state.status(), to);
                } else {
                    assert!(
                        matches!(result, Err(PoolError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn test_illegal_transition_leaves_state_untouched() {
        for from in ConnectionStatus::ALL {
            for to in ConnectionStatus::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let state = state_at(from);
                let before = state.snapshot();
                assert!(state.transition(to).is_err());
                assert_eq!(state.snapshot(), before);
            }
        }
    }

    #[test]
    fn test_exactly_target_metrics_change() {
        for from in ConnectionStatus::ALL {
            for &to in from.allowed_targets() {
                let state = state_at(from);
                let before = state.metrics();
                std::thread::sleep(std::time::Duration::from_millis(1));
                state.transition(to).unwrap();
                let after = state.metrics();
                assert_eq!(changed_fields(&before, &after), expected_fields(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_unknown_to_connecting() {
        let state = ConnectionState::new();
        assert_eq!(state.status(), Unknown);

        state.transition(Connecting).unwrap();
        let metrics = state.metrics();
        assert_eq!(metrics.connecting_count, 1);
        assert!(metrics.last_connecting.is_some());
        assert_eq!(metrics.connection_count, 0);
        assert!(metrics.last_connected.is_none());
    }

    #[test]
    fn test_table_rows() {
        assert_eq!(Unknown.allowed_targets(), &[Connecting]);
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(!Connected.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(NoResponse.can_transition_to(Connected));
        assert!(Connected.can_transition_to(NoResponse));
    }

    #[test]
    fn test_advance_is_noop_at_target() {
        let state = state_at(Connected);
        let before = state.metrics();
        assert_eq!(state.advance(Connected).unwrap(), Connected);
        assert_eq!(state.metrics(), before);
        assert!(state.advance(Unknown).is_err());
    }

    #[test]
    fn test_force_skips_table_but_applies_metrics() {
        let state = state_at(Connecting);
        assert!(!Connecting.can_transition_to(Failed));
        assert_eq!(state.force(Failed), Connecting);
        assert_eq!(state.status(), Failed);
        assert_eq!(state.metrics().failed_count, 1);
    }

    #[test]
    fn test_transition_or_force() {
        let state = state_at(Connecting);
        state.transition_or_force(Disconnected);
        assert_eq!(state.status(), Disconnected);

        let state = state_at(Reconnecting);
        state.transition_or_force(Disconnected);
        assert_eq!(state.status(), Disconnected);
        assert!(state.metrics().last_disconnected.is_some());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ReconnectionFailed.to_string(), "RECONNECTION_FAILED");
        assert_eq!(NoResponse.to_string(), "NO_RESPONSE");
        assert!(ReconnectionFailed.is_failed());
        assert!(Reconnecting.is_connecting());
    }
}
