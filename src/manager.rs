//! Supervision over a connection or session pool.
//!
//! [`PoolManager`] keeps per-member bookkeeping (usage counts, last errors)
//! on top of any pool that implements [`SupervisedPool`], and periodically
//! reconnects members whose status is not `Connected`.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionPool, ConnectionStatus, ManagedConnection};
use crate::error::{PoolError, Result};
use crate::event::{EventSink, PoolEvent, TracingSink};
use crate::session::{ClientConfig, PooledSession, SessionPool};
use crate::types::{ConnectionId, EndpointUrl};

/// A pool member the manager can inspect and recover.
#[async_trait]
pub trait Supervised: Send + Sync {
    /// Stable member id.
    fn id(&self) -> ConnectionId;

    /// Live status.
    fn status(&self) -> ConnectionStatus;

    /// Time the member was last handed out or returned.
    fn last_used(&self) -> Instant;

    /// Number of subscriptions attached to the member.
    fn subscription_count(&self) -> usize {
        0
    }

    /// Bring the member back to `Connected`.
    async fn recover(&self) -> Result<()>;
}

/// A pool the manager can check members out of and back into.
#[async_trait]
pub trait SupervisedPool: Send + Sync + 'static {
    /// What a caller asks the pool for.
    type Request: Send + Sync;
    /// What the pool hands out.
    type Member: Supervised + 'static;

    /// Get a member for `request`.
    async fn checkout(&self, request: &Self::Request) -> Result<Arc<Self::Member>>;

    /// Give a member back.
    async fn checkin(&self, member: &Arc<Self::Member>) -> Result<()>;
}

#[async_trait]
impl Supervised for ManagedConnection {
    fn id(&self) -> ConnectionId {
        ManagedConnection::id(self)
    }

    fn status(&self) -> ConnectionStatus {
        ManagedConnection::status(self)
    }

    fn last_used(&self) -> Instant {
        ManagedConnection::last_used(self)
    }

    async fn recover(&self) -> Result<()> {
        self.reconnect().await?.into_result().map(|_| ())
    }
}

#[async_trait]
impl Supervised for PooledSession {
    fn id(&self) -> ConnectionId {
        PooledSession::id(self)
    }

    fn status(&self) -> ConnectionStatus {
        PooledSession::status(self)
    }

    fn last_used(&self) -> Instant {
        PooledSession::last_used(self)
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    async fn recover(&self) -> Result<()> {
        self.reconnect().await
    }
}

#[async_trait]
impl SupervisedPool for ConnectionPool {
    type Request = EndpointUrl;
    type Member = ManagedConnection;

    async fn checkout(&self, request: &EndpointUrl) -> Result<Arc<ManagedConnection>> {
        self.acquire(request).await
    }

    async fn checkin(&self, member: &Arc<ManagedConnection>) -> Result<()> {
        self.release(member).await
    }
}

#[async_trait]
impl SupervisedPool for SessionPool {
    type Request = ClientConfig;
    type Member = PooledSession;

    async fn checkout(&self, request: &ClientConfig) -> Result<Arc<PooledSession>> {
        self.obtain(request).await
    }

    async fn checkin(&self, member: &Arc<PooledSession>) -> Result<()> {
        self.release(member).await
    }
}

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ManagerConfig {
    /// Period of the reconciliation sweep started by [`PoolManager::start`].
    pub reconcile_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

impl ManagerConfig {
    /// Set the reconciliation period.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// Read-only view of one managed member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    /// Successful obtains of this member through the manager.
    pub usage_count: u64,
    /// When an operation on this member last failed.
    pub last_error: Option<Instant>,
    /// Message of that failure.
    pub last_error_message: Option<String>,
    /// Time the member was last handed out or returned.
    pub last_used: Instant,
    /// Live status.
    pub status: ConnectionStatus,
    /// Attached subscriptions.
    pub subscription_count: usize,
}

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Managed members looked at.
    pub examined: usize,
    /// Members brought back to `Connected`.
    pub reconnected: usize,
    /// Members whose recovery failed.
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct LastError {
    at: Instant,
    message: String,
}

struct ManagerInner<P: SupervisedPool> {
    pool: P,
    config: ManagerConfig,
    sink: Arc<dyn EventSink>,
    managed: DashMap<ConnectionId, Arc<P::Member>>,
    usage: DashMap<ConnectionId, u64>,
    last_errors: DashMap<ConnectionId, LastError>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: SupervisedPool> ManagerInner<P> {
    fn record_error(&self, id: ConnectionId, error: &PoolError) {
        self.last_errors.insert(
            id,
            LastError {
                at: Instant::now(),
                message: error.to_string(),
            },
        );
    }

    async fn reconcile(&self) -> ReconcileReport {
        let members: Vec<Arc<P::Member>> =
            self.managed.iter().map(|entry| entry.value().clone()).collect();
        let stale: Vec<&Arc<P::Member>> = members
            .iter()
            .filter(|m| m.status() != ConnectionStatus::Connected)
            .collect();

        let results = join_all(stale.iter().map(|m| m.recover())).await;

        let mut report = ReconcileReport {
            examined: members.len(),
            ..ReconcileReport::default()
        };
        for (member, result) in stale.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    tracing::info!(id = %member.id(), "reconciled");
                    report.reconnected += 1;
                }
                Err(e) => {
                    tracing::warn!(id = %member.id(), error = %e, "reconciliation failed");
                    self.record_error(member.id(), &e);
                    self.sink.emit(
                        PoolEvent::ReconcileFailed,
                        &[("connection_id", member.id().to_string()), ("error", e.to_string())],
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

impl<P: SupervisedPool> Drop for ManagerInner<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Supervisory bookkeeping over a pool.
///
/// Members obtained through the manager are tracked until they are released.
/// Usage counts and last errors are kept per id across checkouts.
pub struct PoolManager<P: SupervisedPool> {
    inner: Arc<ManagerInner<P>>,
}

impl<P: SupervisedPool> Clone for PoolManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: SupervisedPool> PoolManager<P> {
    /// Create a manager over `pool`. The sweep does not run until
    /// [`start`](Self::start).
    pub fn new(pool: P, config: ManagerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                pool,
                config,
                sink,
                managed: DashMap::new(),
                usage: DashMap::new(),
                last_errors: DashMap::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Create a manager with default configuration that logs through `tracing`.
    pub fn with_pool(pool: P) -> Self {
        Self::new(pool, ManagerConfig::default(), Arc::new(TracingSink))
    }

    /// The supervised pool.
    pub fn pool(&self) -> &P {
        &self.inner.pool
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Check a member out of the pool and start tracking it.
    pub async fn obtain(&self, request: &P::Request) -> Result<Arc<P::Member>> {
        let member = match self.inner.pool.checkout(request).await {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(error = %e, "obtain failed");
                return Err(e);
            }
        };
        let id = member.id();
        self.inner.managed.insert(id, member.clone());
        *self.inner.usage.entry(id).or_insert(0) += 1;
        Ok(member)
    }

    /// Stop tracking a member and give it back to the pool.
    pub async fn release(&self, member: &Arc<P::Member>) -> Result<()> {
        let id = member.id();
        self.inner.managed.remove(&id);
        if let Err(e) = self.inner.pool.checkin(member).await {
            self.inner.record_error(id, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Recover one managed member now.
    pub async fn reconnect(&self, id: ConnectionId) -> Result<()> {
        let member = self
            .inner
            .managed
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(PoolError::UnknownConnection(id))?;
        if let Err(e) = member.recover().await {
            self.inner.record_error(id, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Statistics for a managed member, or `None` if it is not checked out
    /// through this manager.
    pub fn stats(&self, id: ConnectionId) -> Option<ClientStats> {
        let member = self.inner.managed.get(&id).map(|entry| entry.value().clone())?;
        let last_error = self.inner.last_errors.get(&id).map(|entry| entry.value().clone());
        Some(ClientStats {
            usage_count: self.inner.usage.get(&id).map_or(0, |entry| *entry.value()),
            last_error: last_error.as_ref().map(|e| e.at),
            last_error_message: last_error.map(|e| e.message),
            last_used: member.last_used(),
            status: member.status(),
            subscription_count: member.subscription_count(),
        })
    }

    /// Ids of the members currently tracked.
    pub fn managed_ids(&self) -> Vec<ConnectionId> {
        self.inner.managed.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of members currently tracked.
    pub fn managed_count(&self) -> usize {
        self.inner.managed.len()
    }

    /// Run one reconciliation sweep.
    ///
    /// Every managed member that is not `Connected` is recovered. A failure is
    /// recorded against that member and does not stop the sweep.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile().await
    }

    /// Start the periodic sweep. Calling it again while it runs is a no-op.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let period = self.inner.config.reconcile_interval;
        *task = Some(tokio::spawn(reconcile_loop(Arc::downgrade(&self.inner), period)));
        tracing::info!(?period, "reconciliation started");
    }

    /// Check whether the periodic sweep is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the sweep, give every tracked member back to the pool and clear
    /// the ledgers.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
        }

        let members: Vec<Arc<P::Member>> =
            self.inner.managed.iter().map(|entry| entry.value().clone()).collect();
        self.inner.managed.clear();
        for member in &members {
            if let Err(e) = self.inner.pool.checkin(member).await {
                tracing::debug!(id = %member.id(), error = %e, "checkin on shutdown failed");
            }
        }

        self.inner.usage.clear();
        self.inner.last_errors.clear();
        tracing::info!(returned = members.len(), "pool manager shut down");
    }
}

async fn reconcile_loop<P: SupervisedPool>(manager: Weak<ManagerInner<P>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = manager.upgrade() else { break };
        let report = inner.reconcile().await;
        if report.reconnected > 0 || report.failed > 0 {
            tracing::info!(?report, "reconciliation sweep");
        }
    }
}

impl<P: SupervisedPool> std::fmt::Debug for PoolManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.inner.config)
            .field("managed", &self.inner.managed.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PoolConfig;
    use crate::event::MemorySink;
    use crate::session::SubscriptionConfig;
    use crate::test_support::{MockControl, PingMode};

    fn endpoint() -> EndpointUrl {
        EndpointUrl::from("opc.tcp://plc:4840")
    }

    fn connection_manager(
        control: &Arc<MockControl>,
        config: ManagerConfig,
    ) -> (PoolManager<ConnectionPool>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let pool_config = PoolConfig::default()
            .with_max_pool_size(2)
            .with_connection_timeout(Duration::from_millis(100))
            .with_health_check_interval(Duration::from_secs(3600))
            .with_backoff(Duration::from_millis(10), 2.0);
        let pool = ConnectionPool::new(pool_config, control.provider(), sink.clone()).unwrap();
        (PoolManager::new(pool, config, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_usage_counted_across_checkouts() {
        let control = MockControl::new();
        let (manager, _) = connection_manager(&control, ManagerConfig::default());

        let conn = manager.obtain(&endpoint()).await.unwrap();
        manager.release(&conn).await.unwrap();
        assert!(manager.stats(conn.id()).is_none());

        let again = manager.obtain(&endpoint()).await.unwrap();
        assert_eq!(again.id(), conn.id());

        let stats = manager.stats(again.id()).unwrap();
        assert_eq!(stats.usage_count, 2);
        assert_eq!(stats.status, ConnectionStatus::Connected);
        assert_eq!(stats.last_error, None);
        assert_eq!(stats.subscription_count, 0);
    }

    #[tokio::test]
    async fn test_reconcile_reconnects_unhealthy_members() {
        let control = MockControl::new();
        let (manager, _) = connection_manager(&control, ManagerConfig::default());
        let healthy = manager.obtain(&endpoint()).await.unwrap();
        let broken = manager.obtain(&endpoint()).await.unwrap();

        control.set_ping(PingMode::Fail);
        let _ = broken.ping().await;
        control.set_ping(PingMode::Value);
        assert_eq!(broken.status(), ConnectionStatus::Error);

        let report = manager.reconcile().await;
        assert_eq!(report, ReconcileReport { examined: 2, reconnected: 1, failed: 0 });
        assert_eq!(broken.status(), ConnectionStatus::Connected);
        assert_eq!(healthy.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_reconcile_isolates_failures() {
        let control = MockControl::new();
        let (manager, sink) = connection_manager(&control, ManagerConfig::default());
        let closed = manager.obtain(&endpoint()).await.unwrap();
        let broken = manager.obtain(&endpoint()).await.unwrap();

        closed.close().await;
        control.set_ping(PingMode::Fail);
        let _ = broken.ping().await;

        let report = manager.reconcile().await;
        assert_eq!(report, ReconcileReport { examined: 2, reconnected: 1, failed: 1 });
        assert_eq!(broken.status(), ConnectionStatus::Connected);

        let stats = manager.stats(closed.id()).unwrap();
        assert!(stats.last_error.is_some());
        assert!(stats.last_error_message.is_some());
        assert!(manager.stats(broken.id()).unwrap().last_error.is_none());

        let failures = sink.events();
        let failure = failures
            .iter()
            .find(|e| e.event == PoolEvent::ReconcileFailed)
            .unwrap();
        assert_eq!(failure.attribute("connection_id"), Some(closed.id().to_string().as_str()));
    }

    #[tokio::test]
    async fn test_reconnect_unknown_id() {
        let control = MockControl::new();
        let (manager, _) = connection_manager(&control, ManagerConfig::default());
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            manager.reconnect(id).await,
            Err(PoolError::UnknownConnection(unknown)) if unknown == id
        ));
    }

    #[tokio::test]
    async fn test_session_reconnect_failure_recorded() {
        let control = MockControl::new();
        let manager = PoolManager::new(
            SessionPool::with_defaults(control.factory()),
            ManagerConfig::default(),
            Arc::new(MemorySink::new()),
        );
        let config = ClientConfig::new("opc.tcp://plc:4840", "line-1")
            .with_subscription(SubscriptionConfig::new("alarms"));

        let session = manager.obtain(&config).await.unwrap();
        assert_eq!(manager.stats(session.id()).unwrap().subscription_count, 1);

        MockControl::set(&control.connect_fails, true);
        assert!(manager.reconnect(session.id()).await.is_err());

        let stats = manager.stats(session.id()).unwrap();
        assert!(stats.last_error.is_some());
        assert_eq!(stats.status, ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reconciliation() {
        let control = MockControl::new();
        let (manager, _) = connection_manager(
            &control,
            ManagerConfig::default().with_reconcile_interval(Duration::from_secs(1)),
        );
        let conn = manager.obtain(&endpoint()).await.unwrap();
        control.set_ping(PingMode::Fail);
        let _ = conn.ping().await;
        assert_eq!(conn.status(), ConnectionStatus::Error);

        manager.start();
        manager.start();
        assert!(manager.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_returns_members() {
        let control = MockControl::new();
        let (manager, _) = connection_manager(&control, ManagerConfig::default());
        let a = manager.obtain(&endpoint()).await.unwrap();
        let _b = manager.obtain(&endpoint()).await.unwrap();
        manager.start();

        manager.shutdown().await;
        assert!(!manager.is_running());
        assert_eq!(manager.managed_count(), 0);
        assert_eq!(manager.pool().active_count(), 0);
        assert_eq!(manager.pool().idle_count(), 2);
        assert!(manager.stats(a.id()).is_none());
    }
}
