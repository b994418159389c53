//! Session pool keyed by client configuration.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::timeout;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionState, ConnectionStatus, HealthMetrics};
use crate::error::{PoolError, Result};
use crate::event::{EventSink, PoolEvent, TracingSink};
use crate::types::{ConnectionId, new_connection_id};

use super::{
    ClientConfig, ClientKey, EstablishedSession, Session, SessionFactory, SubscriptionHandle,
};

/// Session pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SessionPoolConfig {
    /// Bound on session creation, reconnect and disconnect.
    pub operation_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionPoolConfig {
    /// Set the operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// A session handed out by [`SessionPool`].
pub struct PooledSession {
    id: ConnectionId,
    key: ClientKey,
    config: ClientConfig,
    session: Arc<dyn Session>,
    subscriptions: Vec<SubscriptionHandle>,
    state: ConnectionState,
    last_used: Mutex<Instant>,
    valid: AtomicBool,
    timeout: Duration,
    op_lock: tokio::sync::Mutex<()>,
}

impl PooledSession {
    fn new(
        config: ClientConfig,
        established: EstablishedSession,
        timeout: Duration,
    ) -> Result<Self> {
        let state = ConnectionState::new();
        state.transition(ConnectionStatus::Connecting)?;
        state.transition(ConnectionStatus::Connected)?;
        Ok(Self {
            id: new_connection_id(),
            key: config.key(),
            config,
            session: established.session,
            subscriptions: established.subscriptions,
            state,
            last_used: Mutex::new(Instant::now()),
            valid: AtomicBool::new(true),
            timeout,
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Connection id assigned when the session was created.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Key the session is pooled under.
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    /// Configuration the session was created from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Subscriptions attached at creation.
    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscriptions
    }

    /// Current status. A session that closed on its own reports `Error`.
    pub fn status(&self) -> ConnectionStatus {
        if self.state.status() == ConnectionStatus::Connected
            && !self.session.is_session_open()
            && self.state.transition(ConnectionStatus::Error).is_ok()
        {
            tracing::warn!(id = %self.id, key = %self.key, "session closed underneath the pool");
        }
        self.state.status()
    }

    /// Health metrics.
    pub fn metrics(&self) -> HealthMetrics {
        self.state.metrics()
    }

    /// Time of the last obtain or release.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Check whether the session may be handed out again.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the session unusable. It is discarded when released.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Run the session-level connect against the configured endpoint again.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let entry = if self.state.status().can_transition_to(ConnectionStatus::Reconnecting) {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        self.state.advance(entry)?;

        match timeout(self.timeout, self.session.connect(&self.config.endpoint_url)).await {
            Ok(Ok(())) => {
                self.state.transition(ConnectionStatus::Connected)?;
                self.valid.store(true, Ordering::Release);
                tracing::info!(id = %self.id, key = %self.key, "session reconnected");
                Ok(())
            }
            Ok(Err(source)) => {
                self.state.transition_or_force(ConnectionStatus::Error);
                Err(PoolError::session("reconnect", source))
            }
            Err(_) => {
                self.state.force(ConnectionStatus::Failed);
                Err(PoolError::ConnectionTimeout {
                    operation: "reconnect",
                    timeout: self.timeout,
                })
            }
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Disconnect for good. Settles on `Disconnected` whatever the session says.
    async fn shutdown(&self) {
        let _guard = self.op_lock.lock().await;
        self.valid.store(false, Ordering::Release);
        if self.state.status().can_transition_to(ConnectionStatus::Disconnecting) {
            self.state.transition(ConnectionStatus::Disconnecting).ok();
        }
        match timeout(self.timeout, self.session.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(id = %self.id, error = %e, "session disconnect failed"),
            Err(_) => tracing::warn!(
                id = %self.id,
                timeout = ?self.timeout,
                "session disconnect timed out"
            ),
        }
        self.state.transition_or_force(ConnectionStatus::Disconnected);
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.state.status())
            .field("valid", &self.is_valid())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Snapshot of session pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPoolStats {
    /// Idle sessions across all keys.
    pub idle: usize,
    /// Sessions currently handed out.
    pub active: usize,
    /// Keys with at least one idle session.
    pub keys: usize,
    /// Whether `close` was called.
    pub shut_down: bool,
}

#[derive(Default)]
struct SessionMembers {
    idle: HashMap<ClientKey, VecDeque<Arc<PooledSession>>>,
    active: HashMap<ConnectionId, Arc<PooledSession>>,
}

struct SessionPoolInner {
    config: SessionPoolConfig,
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn EventSink>,
    members: Mutex<SessionMembers>,
    shutdown: AtomicBool,
}

/// Pool that reuses negotiated sessions per [`ClientKey`].
///
/// Creation failures are returned to the caller untouched; retrying belongs to
/// whoever called [`obtain`](Self::obtain).
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<SessionPoolInner>,
}

impl SessionPool {
    /// Create a pool over `factory`.
    pub fn new(
        config: SessionPoolConfig,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionPoolInner {
                config,
                factory,
                sink,
                members: Mutex::new(SessionMembers::default()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Create a pool with default configuration that logs events through `tracing`.
    pub fn with_defaults(factory: Arc<dyn SessionFactory>) -> Self {
        Self::new(SessionPoolConfig::default(), factory, Arc::new(TracingSink))
    }

    /// Get a session for `config`, reusing an idle one with the same key.
    pub async fn obtain(&self, config: &ClientConfig) -> Result<Arc<PooledSession>> {
        if self.is_shut_down() {
            return Err(PoolError::PoolShutdown);
        }
        let key = config.key();

        loop {
            let candidate = self
                .inner
                .members
                .lock()
                .idle
                .get_mut(&key)
                .and_then(VecDeque::pop_front);
            let Some(session) = candidate else { break };

            if !session.is_valid() {
                session.shutdown().await;
                self.emit(PoolEvent::Discarded, &session, "invalid");
                continue;
            }

            session.touch();
            let registered = {
                let mut members = self.inner.members.lock();
                if self.is_shut_down() {
                    false
                } else {
                    members.active.insert(session.id(), session.clone());
                    true
                }
            };
            if !registered {
                session.shutdown().await;
                return Err(PoolError::PoolShutdown);
            }
            tracing::debug!(id = %session.id(), key = %key, "reusing idle session");
            self.emit(PoolEvent::SessionReused, &session, "idle");
            return Ok(session);
        }

        let session = Arc::new(self.create(config).await?);
        let registered = {
            let mut members = self.inner.members.lock();
            if self.is_shut_down() {
                false
            } else {
                members.active.insert(session.id(), session.clone());
                true
            }
        };
        if !registered {
            session.shutdown().await;
            return Err(PoolError::PoolShutdown);
        }
        tracing::info!(
            id = %session.id(),
            key = %key,
            subscriptions = session.subscriptions().len(),
            "created session"
        );
        self.emit(PoolEvent::SessionCreated, &session, "new");
        Ok(session)
    }

    async fn create(&self, config: &ClientConfig) -> Result<PooledSession> {
        let limit = self.inner.config.operation_timeout;
        let established = match timeout(limit, self.inner.factory.create(config)).await {
            Ok(Ok(established)) => established,
            Ok(Err(source)) => {
                tracing::warn!(
                    endpoint = %config.endpoint_url,
                    error = %source,
                    "session creation failed"
                );
                return Err(PoolError::SessionCreation {
                    endpoint: config.endpoint_url.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(PoolError::ConnectionTimeout {
                    operation: "create_session",
                    timeout: limit,
                });
            }
        };
        PooledSession::new(config.clone(), established, limit)
    }

    /// Return a session to the idle queue of its key.
    ///
    /// The session stays open. An invalidated session is disconnected instead.
    pub async fn release(&self, session: &Arc<PooledSession>) -> Result<()> {
        if self.is_shut_down() {
            return Err(PoolError::PoolShutdown);
        }
        let removed = self.inner.members.lock().active.remove(&session.id());
        if removed.is_none() {
            return Err(PoolError::UnknownConnection(session.id()));
        }
        session.touch();

        if !session.is_valid() {
            session.shutdown().await;
            self.emit(PoolEvent::Discarded, session, "invalid");
            return Ok(());
        }

        self.inner
            .members
            .lock()
            .idle
            .entry(session.key().clone())
            .or_default()
            .push_back(session.clone());
        tracing::debug!(id = %session.id(), key = %session.key(), "session released");
        self.emit(PoolEvent::SessionReleased, session, "idle");
        Ok(())
    }

    /// Evict idle sessions that are invalid or no longer open.
    ///
    /// Returns the number of sessions evicted.
    pub async fn prune(&self) -> usize {
        let stale: Vec<Arc<PooledSession>> = {
            let mut members = self.inner.members.lock();
            let mut stale = Vec::new();
            for queue in members.idle.values_mut() {
                let (keep, evict): (VecDeque<_>, VecDeque<_>) = queue
                    .drain(..)
                    .partition(|s| s.is_valid() && s.session().is_session_open());
                *queue = keep;
                stale.extend(evict);
            }
            members.idle.retain(|_, queue| !queue.is_empty());
            stale
        };

        for session in &stale {
            session.shutdown().await;
            self.emit(PoolEvent::Discarded, session, "stale");
        }
        if !stale.is_empty() {
            tracing::info!(evicted = stale.len(), "pruned idle sessions");
        }
        stale.len()
    }

    /// Disconnect every session and refuse further use. Idempotent.
    pub async fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<PooledSession>> = {
            let mut members = self.inner.members.lock();
            let idle = std::mem::take(&mut members.idle);
            let active = std::mem::take(&mut members.active);
            idle.into_values()
                .flatten()
                .chain(active.into_values())
                .collect()
        };
        join_all(drained.iter().map(|s| s.shutdown())).await;
        tracing::info!(closed = drained.len(), "session pool closed");
        self.inner
            .sink
            .emit(PoolEvent::PoolClosed, &[("closed", drained.len().to_string())]);
    }

    /// Number of idle sessions across all keys.
    pub fn idle_count(&self) -> usize {
        self.inner.members.lock().idle.values().map(VecDeque::len).sum()
    }

    /// Number of idle sessions under `key`.
    pub fn idle_count_for(&self, key: &ClientKey) -> usize {
        self.inner.members.lock().idle.get(key).map_or(0, VecDeque::len)
    }

    /// Number of sessions handed out.
    pub fn active_count(&self) -> usize {
        self.inner.members.lock().active.len()
    }

    /// Check whether the pool was closed.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> SessionPoolStats {
        let members = self.inner.members.lock();
        SessionPoolStats {
            idle: members.idle.values().map(VecDeque::len).sum(),
            active: members.active.len(),
            keys: members.idle.len(),
            shut_down: self.is_shut_down(),
        }
    }

    fn emit(&self, event: PoolEvent, session: &PooledSession, reason: &str) {
        self.inner.sink.emit(
            event,
            &[
                ("connection_id", session.id().to_string()),
                ("endpoint", session.key().endpoint_url.to_string()),
                ("connection_name", session.key().connection_name.clone()),
                ("reason", reason.to_string()),
            ],
        );
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemorySink;
    use crate::session::SubscriptionConfig;
    use crate::test_support::MockControl;

    fn pool(control: &Arc<MockControl>) -> (SessionPool, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let pool = SessionPool::new(SessionPoolConfig::default(), control.factory(), sink.clone());
        (pool, sink)
    }

    fn line_config() -> ClientConfig {
        ClientConfig::new("opc.tcp://plc:4840", "line-1")
    }

    #[tokio::test]
    async fn test_obtain_release_reuses_session() {
        let control = MockControl::new();
        let (pool, sink) = pool(&control);
        let config = line_config();

        let first = pool.obtain(&config).await.unwrap();
        assert_eq!(pool.active_count(), 1);
        pool.release(&first).await.unwrap();
        assert_eq!(pool.idle_count_for(&config.key()), 1);

        let second = pool.obtain(&config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(first.session(), second.session()));
        assert_eq!(MockControl::count(&control.opened), 1);
        assert_eq!(sink.count(PoolEvent::SessionCreated), 1);
        assert_eq!(sink.count(PoolEvent::SessionReused), 1);
    }

    #[tokio::test]
    async fn test_release_keeps_session_open() {
        let control = MockControl::new();
        let (pool, _) = pool(&control);
        let session = pool.obtain(&line_config()).await.unwrap();

        pool.release(&session).await.unwrap();
        assert!(session.session().is_session_open());
        assert_eq!(MockControl::count(&control.disconnects), 0);
        assert_eq!(session.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_sessions() {
        let control = MockControl::new();
        let (pool, _) = pool(&control);

        let a = pool.obtain(&line_config()).await.unwrap();
        pool.release(&a).await.unwrap();
        let b = pool
            .obtain(&ClientConfig::new("opc.tcp://plc:4840", "line-2"))
            .await
            .unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(MockControl::count(&control.opened), 2);
    }

    #[tokio::test]
    async fn test_creation_failure_is_not_retried() {
        let control = MockControl::new();
        MockControl::set(&control.create_fails, true);
        let (pool, _) = pool(&control);

        let err = pool.obtain(&line_config()).await.unwrap_err();
        match err {
            PoolError::SessionCreation { endpoint, source } => {
                assert_eq!(endpoint, "opc.tcp://plc:4840");
                assert_eq!(source.to_string(), "BadIdentityTokenRejected");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(MockControl::count(&control.connects), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriptions_attached() {
        let control = MockControl::new();
        let (pool, _) = pool(&control);
        let config = line_config()
            .with_subscription(SubscriptionConfig::new("alarms"))
            .with_subscription(SubscriptionConfig::new("trends"));

        let session = pool.obtain(&config).await.unwrap();
        let names: Vec<_> = session.subscriptions().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["alarms", "trends"]);
        assert_eq!(session.subscriptions()[1].subscription_id, 2);
    }

    #[tokio::test]
    async fn test_invalidated_session_is_discarded_on_release() {
        let control = MockControl::new();
        let (pool, sink) = pool(&control);
        let config = line_config();

        let first = pool.obtain(&config).await.unwrap();
        first.invalidate();
        pool.release(&first).await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(first.status(), ConnectionStatus::Disconnected);
        assert_eq!(sink.count(PoolEvent::Discarded), 1);

        let second = pool.obtain(&config).await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_release_unknown_session() {
        let control = MockControl::new();
        let (pool, _) = pool(&control);
        let session = pool.obtain(&line_config()).await.unwrap();
        pool.release(&session).await.unwrap();

        assert!(matches!(
            pool.release(&session).await,
            Err(PoolError::UnknownConnection(id)) if id == session.id()
        ));
    }

    #[tokio::test]
    async fn test_silently_closed_session_reports_error_and_is_pruned() {
        let control = MockControl::new();
        let (pool, _) = pool(&control);
        let session = pool.obtain(&line_config()).await.unwrap();
        pool.release(&session).await.unwrap();

        control.sessions()[0].close_silently();
        assert_eq!(session.status(), ConnectionStatus::Error);
        assert_eq!(session.metrics().error_count, 1);

        assert_eq!(pool.prune().await, 1);
        assert_eq!(pool.stats().keys, 0);
    }

    #[tokio::test]
    async fn test_reconnect_after_error() {
        let control = MockControl::new();
        let (pool, _) = pool(&control);
        let session = pool.obtain(&line_config()).await.unwrap();

        control.sessions()[0].close_silently();
        assert_eq!(session.status(), ConnectionStatus::Error);

        session.reconnect().await.unwrap();
        assert_eq!(session.status(), ConnectionStatus::Connected);
        assert_eq!(session.metrics().reconnecting_count, 1);
    }

    #[tokio::test]
    async fn test_close_disconnects_everything() {
        let control = MockControl::new();
        let (pool, sink) = pool(&control);
        let idle = pool.obtain(&line_config()).await.unwrap();
        let active = pool
            .obtain(&ClientConfig::new("opc.tcp://plc:4840", "line-2"))
            .await
            .unwrap();
        pool.release(&idle).await.unwrap();

        pool.close().await;
        pool.close().await;

        assert_eq!(MockControl::count(&control.disconnects), 2);
        assert_eq!(active.status(), ConnectionStatus::Disconnected);
        assert_eq!(pool.stats(), SessionPoolStats { idle: 0, active: 0, keys: 0, shut_down: true });
        assert!(matches!(pool.obtain(&line_config()).await, Err(PoolError::PoolShutdown)));
        assert!(matches!(pool.release(&active).await, Err(PoolError::PoolShutdown)));
        assert_eq!(sink.count(PoolEvent::PoolClosed), 1);
    }
}
