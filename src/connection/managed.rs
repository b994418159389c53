//! A single managed connection with validated state and recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::timeout;

use crate::error::{PoolError, Result};
use crate::event::{EventSink, PoolEvent, TracingSink};
use crate::session::{SERVER_STATE_NODE, Session, SessionProvider};
use crate::types::{ConnectionId, EndpointUrl, new_connection_id};

use super::reconnect::{AttemptOutcome, ReconnectOutcome, ReconnectionPolicy};
use super::state::{ConnectionState, ConnectionStatus, HealthMetrics};

/// Result of [`ManagedConnection::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// No session was attached.
    AlreadyDisconnected,
    /// The attached session was closed and released.
    Disconnected,
}

/// One logical connection to an endpoint.
///
/// Every operation that drives the session (connect, ping, disconnect,
/// reconnect, close) is serialized per connection, and every session call is
/// bounded by the connection timeout.
pub struct ManagedConnection {
    id: ConnectionId,
    state: ConnectionState,
    session: Mutex<Option<Arc<dyn Session>>>,
    provider: Arc<dyn SessionProvider>,
    target: Mutex<Option<EndpointUrl>>,
    failure_count: AtomicU32,
    last_used: Mutex<Instant>,
    timeout: Duration,
    policy: ReconnectionPolicy,
    op_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl ManagedConnection {
    /// Create a disconnected connection that opens sessions through `provider`.
    pub fn new(provider: Arc<dyn SessionProvider>, timeout: Duration) -> Self {
        Self {
            id: new_connection_id(),
            state: ConnectionState::new(),
            session: Mutex::new(None),
            provider,
            target: Mutex::new(None),
            failure_count: AtomicU32::new(0),
            last_used: Mutex::new(Instant::now()),
            timeout,
            policy: ReconnectionPolicy::default(),
            op_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            sink: Arc::new(TracingSink),
        }
    }

    /// Set the policy used by [`reconnect`](Self::reconnect).
    pub fn with_policy(mut self, policy: ReconnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the event sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Health metrics.
    pub fn metrics(&self) -> HealthMetrics {
        self.state.metrics()
    }

    /// Target of the last connect.
    pub fn target(&self) -> Option<EndpointUrl> {
        self.target.lock().clone()
    }

    /// Check whether a session handle is attached.
    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    /// The attached session, if any.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.lock().clone()
    }

    /// Consecutive failed validations.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Time the connection was last handed out or returned.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Stamp the last-used time.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Check whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Policy used by [`reconnect`](Self::reconnect).
    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    /// Connect to `target`.
    ///
    /// Already connected to `target` is a no-op. A session bound elsewhere is
    /// disconnected first. A timeout forces `Failed`.
    pub async fn connect(&self, target: &EndpointUrl) -> Result<()> {
        target.validate()?;
        let _guard = self.op_lock.lock().await;
        self.ensure_open()?;

        if self.has_session() {
            if self.target().as_ref() == Some(target) && self.status().is_connected() {
                return Ok(());
            }
            if let Err(e) = self.teardown().await {
                tracing::warn!(id = %self.id, error = %e, "disconnect before rebind failed");
            }
        }

        *self.target.lock() = Some(target.clone());
        if !self.status().can_transition_to(ConnectionStatus::Connecting) {
            self.state.transition_or_force(ConnectionStatus::Disconnected);
        }
        self.state.transition(ConnectionStatus::Connecting)?;

        if self.establish(target, "connect").await? {
            tracing::info!(id = %self.id, %target, "connected");
            Ok(())
        } else {
            Err(PoolError::not_connected(format!("session to {target} did not open")))
        }
    }

    /// Open a session and connect it. The state must already be `Connecting`
    /// or `Reconnecting`.
    ///
    /// `Ok(false)` is a clean failure: the session connected without error
    /// but does not report itself open.
    async fn establish(&self, target: &EndpointUrl, operation: &'static str) -> Result<bool> {
        let attempt = async {
            let session = self
                .provider
                .open_session(target)
                .await
                .map_err(|e| PoolError::session("open_session", e))?;
            session
                .connect(target)
                .await
                .map_err(|e| PoolError::session(operation, e))?;
            Ok::<_, PoolError>(session)
        };

        match timeout(self.timeout, attempt).await {
            Ok(Ok(session)) if self.is_closed() => {
                match timeout(self.timeout, session.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(id = %self.id, error = %e, "late session disconnect failed")
                    }
                    Err(_) => tracing::debug!(id = %self.id, "late session disconnect timed out"),
                }
                self.state.transition_or_force(ConnectionStatus::Disconnected);
                Err(PoolError::not_connected("connection closed while connecting"))
            }
            Ok(Ok(session)) if session.is_session_open() => {
                self.state.transition(ConnectionStatus::Connected)?;
                *self.session.lock() = Some(session);
                self.failure_count.store(0, Ordering::Release);
                self.touch();
                Ok(true)
            }
            Ok(Ok(_)) => {
                if self.status() == ConnectionStatus::Connecting {
                    self.state.transition_or_force(ConnectionStatus::Disconnected);
                } else {
                    self.state.transition_or_force(ConnectionStatus::Error);
                }
                Ok(false)
            }
            Ok(Err(err)) => {
                tracing::warn!(id = %self.id, %target, error = %err, "{operation} failed");
                self.state.transition_or_force(ConnectionStatus::Error);
                Err(err)
            }
            Err(_) => {
                tracing::warn!(
                    id = %self.id,
                    %target,
                    timeout = ?self.timeout,
                    "{operation} timed out"
                );
                self.state.force(ConnectionStatus::Failed);
                Err(PoolError::ConnectionTimeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Close the attached session and release it.
    ///
    /// The connection ends `Disconnected` and without a session even when the
    /// close fails; the failure is still returned.
    pub async fn disconnect(&self) -> Result<DisconnectOutcome> {
        let _guard = self.op_lock.lock().await;
        self.teardown().await
    }

    async fn teardown(&self) -> Result<DisconnectOutcome> {
        let Some(session) = self.session.lock().take() else {
            return Ok(DisconnectOutcome::AlreadyDisconnected);
        };
        if self.status().can_transition_to(ConnectionStatus::Disconnecting) {
            self.state.transition(ConnectionStatus::Disconnecting).ok();
        }

        let result = timeout(self.timeout, session.disconnect()).await;
        self.state.transition_or_force(ConnectionStatus::Disconnected);

        match result {
            Ok(Ok(())) => {
                tracing::debug!(id = %self.id, "disconnected");
                Ok(DisconnectOutcome::Disconnected)
            }
            Ok(Err(e)) => Err(PoolError::session("disconnect", e)),
            Err(_) => Err(PoolError::ConnectionTimeout {
                operation: "disconnect",
                timeout: self.timeout,
            }),
        }
    }

    /// Read the server state to check the session is alive.
    ///
    /// Returns `Connected` when a value came back and `NoResponse` when the
    /// read was empty. A read error moves to `Error`; a timeout forces `Failed`.
    pub async fn ping(&self) -> Result<ConnectionStatus> {
        let _guard = self.op_lock.lock().await;

        let status = self.status();
        let Some(session) = self.session() else {
            return Err(PoolError::not_connected("no session attached"));
        };
        if !matches!(status, ConnectionStatus::Connected | ConnectionStatus::NoResponse) {
            return Err(PoolError::not_connected(format!("status is {status}")));
        }

        match timeout(self.timeout, session.read_diagnostic(SERVER_STATE_NODE)).await {
            Ok(Ok(Some(value))) if !value.is_empty() => {
                self.state.advance(ConnectionStatus::Connected)?;
                Ok(ConnectionStatus::Connected)
            }
            Ok(Ok(_)) => {
                tracing::debug!(id = %self.id, "ping returned no value");
                self.state.advance(ConnectionStatus::NoResponse)?;
                Ok(ConnectionStatus::NoResponse)
            }
            Ok(Err(e)) => {
                self.state.transition_or_force(ConnectionStatus::Error);
                Err(PoolError::session("ping", e))
            }
            Err(_) => {
                self.state.force(ConnectionStatus::Failed);
                Err(PoolError::ConnectionTimeout {
                    operation: "ping",
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Ping and track consecutive failures.
    ///
    /// Reaching `failure_threshold` failures forces `Failed`. Returns whether
    /// the connection answered.
    pub async fn validate(&self, failure_threshold: u32) -> bool {
        let failure = match self.ping().await {
            Ok(ConnectionStatus::Connected) => {
                self.failure_count.store(0, Ordering::Release);
                return true;
            }
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };

        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(id = %self.id, failures, reason = %failure, "validation failed");
        if failures >= failure_threshold.max(1) && !self.status().is_failed() {
            tracing::warn!(id = %self.id, failures, "failure threshold reached");
            self.state.force(ConnectionStatus::Failed);
        }
        false
    }

    /// Reconnect to the last target using the connection's own policy.
    pub async fn reconnect(&self) -> Result<ReconnectOutcome> {
        let policy = self.policy;
        self.reconnect_with(&policy).await
    }

    /// Reconnect to the last target using `policy`.
    ///
    /// Fails with `NoTarget` before any attempt when the connection was never
    /// connected. An exhausted policy is not an error: the outcome says so and
    /// the status becomes `ReconnectionFailed`. A [`close`](Self::close) while
    /// the sequence runs stops it before the next attempt; the connection ends
    /// `Disconnected` without a session and `NotConnected` is returned.
    pub async fn reconnect_with(&self, policy: &ReconnectionPolicy) -> Result<ReconnectOutcome> {
        let target = self.target().ok_or(PoolError::NoTarget)?;
        let _guard = self.op_lock.lock().await;
        self.ensure_open()?;

        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            match timeout(self.timeout, stale.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(id = %self.id, error = %e, "stale session disconnect failed")
                }
                Err(_) => tracing::debug!(id = %self.id, "stale session disconnect timed out"),
            }
        }

        let label = target.to_string();
        let this = self;
        let target_ref = &target;
        let outcome = policy
            .run(&label, move |attempt| async move {
                this.reconnect_attempt(target_ref, attempt).await
            })
            .await;

        if self.is_closed() {
            let late = self.session.lock().take();
            if let Some(late) = late {
                if timeout(self.timeout, late.disconnect()).await.is_err() {
                    tracing::debug!(id = %self.id, "late session disconnect timed out");
                }
            }
            self.state.transition_or_force(ConnectionStatus::Disconnected);
            tracing::info!(id = %self.id, "reconnect abandoned, connection closed");
            return Err(PoolError::not_connected("connection closed during reconnect"));
        }

        match &outcome {
            ReconnectOutcome::Reconnected { attempts } => {
                self.emit(
                    PoolEvent::ReconnectSucceeded,
                    &[("attempts", attempts.to_string())],
                );
            }
            ReconnectOutcome::Exhausted {
                attempts,
                last_error,
                ..
            } => {
                self.state.force(ConnectionStatus::ReconnectionFailed);
                let error = last_error
                    .as_ref()
                    .map_or_else(|| "not connected".to_string(), ToString::to_string);
                self.emit(
                    PoolEvent::ReconnectExhausted,
                    &[("attempts", attempts.to_string()), ("error", error)],
                );
            }
        }
        Ok(outcome)
    }

    async fn reconnect_attempt(&self, target: &EndpointUrl, attempt: u32) -> AttemptOutcome {
        if self.is_closed() {
            return AttemptOutcome::Abandoned(PoolError::not_connected("connection is closed"));
        }
        self.emit(PoolEvent::ReconnectAttempt, &[("attempt", attempt.to_string())]);

        let status = self.status();
        let entry = if status == ConnectionStatus::Reconnecting
            || status.can_transition_to(ConnectionStatus::Reconnecting)
        {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        if let Err(e) = self.state.advance(entry) {
            return AttemptOutcome::Errored(e);
        }

        match self.establish(target, "reconnect").await {
            Ok(true) => AttemptOutcome::Connected,
            Ok(false) => AttemptOutcome::NotConnected,
            Err(e) if self.is_closed() => AttemptOutcome::Abandoned(e),
            Err(e) => AttemptOutcome::Errored(e),
        }
    }

    /// Disconnect with a bounded wait and drop the session handle. Idempotent.
    ///
    /// The handle is gone afterwards even if the disconnect failed or timed out.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match timeout(self.timeout, self.op_lock.lock()).await {
            Ok(_guard) => {
                if let Err(e) = self.teardown().await {
                    tracing::warn!(id = %self.id, error = %e, "close: disconnect failed");
                }
            }
            Err(_) => tracing::warn!(id = %self.id, "close: connection busy, dropping session"),
        }

        let detached = self.session.lock().take().is_some();
        if detached || self.status() == ConnectionStatus::Disconnecting {
            self.state.transition_or_force(ConnectionStatus::Disconnected);
        }
        tracing::debug!(id = %self.id, "connection closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::not_connected("connection is closed"));
        }
        Ok(())
    }

    fn emit(&self, event: PoolEvent, extra: &[(&'static str, String)]) {
        let mut attributes = vec![("connection_id", self.id.to_string())];
        if let Some(target) = self.target() {
            attributes.push(("target", target.to_string()));
        }
        attributes.extend_from_slice(extra);
        self.sink.emit(event, &attributes);
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("target", &self.target())
            .field("status", &self.status())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}
