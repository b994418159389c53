//! Bounded pool of managed connections.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout_at};

use crate::error::{PoolError, Result};
use crate::event::{EventSink, PoolEvent, TracingSink};
use crate::session::SessionProvider;
use crate::types::{ConnectionId, EndpointUrl};

use super::config::PoolConfig;
use super::managed::ManagedConnection;
use super::reconnect::ReconnectionPolicy;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Members waiting in the idle queue.
    pub idle: usize,
    /// Members checked out.
    pub active: usize,
    /// Members reserved by an acquire that has not finished yet.
    pub in_flight: usize,
    /// Configured upper bound.
    pub max_pool_size: usize,
    /// Configured lower bound.
    pub min_pool_size: usize,
    /// Whether `close` was called.
    pub shut_down: bool,
}

/// Result of one health-check sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Idle members pinged.
    pub checked: usize,
    /// Members that failed and were closed.
    pub evicted: usize,
    /// Replacement members created.
    pub replenished: usize,
}

#[derive(Default)]
struct Members {
    idle: VecDeque<Arc<ManagedConnection>>,
    active: HashMap<ConnectionId, Arc<ManagedConnection>>,
    in_flight: usize,
}

impl Members {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.in_flight
    }
}

struct PoolInner {
    config: PoolConfig,
    policy: ReconnectionPolicy,
    provider: Arc<dyn SessionProvider>,
    sink: Arc<dyn EventSink>,
    members: Mutex<Members>,
    available: Notify,
    shutdown: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn new_member(&self) -> Arc<ManagedConnection> {
        Arc::new(
            ManagedConnection::new(self.provider.clone(), self.config.connection_timeout)
                .with_policy(self.policy)
                .with_event_sink(self.sink.clone()),
        )
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Capacity held by an acquire in progress. Dropping it without
/// [`commit`](Reservation::commit) gives the slot back.
struct Reservation<'a> {
    inner: &'a PoolInner,
    member: Option<Arc<ManagedConnection>>,
    committed: bool,
}

impl Reservation<'_> {
    /// Move `conn` into the active set. Fails if the pool closed meanwhile.
    fn commit(mut self, conn: &Arc<ManagedConnection>) -> bool {
        let mut members = self.inner.members.lock();
        members.in_flight -= 1;
        self.committed = true;
        self.member = None;
        if self.inner.is_shut_down() {
            return false;
        }
        members.active.insert(conn.id(), conn.clone());
        true
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let orphan = {
            let mut members = self.inner.members.lock();
            members.in_flight -= 1;
            match self.member.take() {
                Some(member) if !self.inner.is_shut_down() && !member.status().is_failed() => {
                    members.idle.push_back(member);
                    None
                }
                other => other,
            }
        };
        self.inner.available.notify_one();

        if let Some(member) = orphan {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { member.close().await });
            }
        }
    }
}

/// A bounded pool of [`ManagedConnection`]s.
///
/// Idle members are served FIFO and validated before they are handed out. A
/// background task pings idle members every `health_check_interval` and
/// replaces the ones that fail.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool and start its health check.
    ///
    /// `min_pool_size` members are created up front without a session. Must
    /// be called from within a Tokio runtime.
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn SessionProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.reconnection_policy();
        let inner = Arc::new(PoolInner {
            config,
            policy,
            provider,
            sink,
            members: Mutex::new(Members::default()),
            available: Notify::new(),
            shutdown: AtomicBool::new(false),
            health_task: Mutex::new(None),
        });

        {
            let mut members = inner.members.lock();
            for _ in 0..inner.config.min_pool_size {
                members.idle.push_back(inner.new_member());
            }
        }

        let handle = tokio::spawn(health_loop(
            Arc::downgrade(&inner),
            inner.config.health_check_interval,
        ));
        *inner.health_task.lock() = Some(handle);

        tracing::info!(
            min = inner.config.min_pool_size,
            max = inner.config.max_pool_size,
            "connection pool created"
        );
        Ok(Self { inner })
    }

    /// Create a pool that logs events through `tracing`.
    pub fn with_provider(config: PoolConfig, provider: Arc<dyn SessionProvider>) -> Result<Self> {
        Self::new(config, provider, Arc::new(TracingSink))
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get a connection bound to `target`.
    ///
    /// Waits up to `connection_timeout` for an idle member or free capacity.
    /// An idle member that fails validation is recovered with the pool's
    /// reconnection policy, or discarded if recovery fails.
    pub async fn acquire(&self, target: &EndpointUrl) -> Result<Arc<ManagedConnection>> {
        target.validate()?;
        let started = Instant::now();
        let deadline = started + self.inner.config.connection_timeout;

        loop {
            let mut reservation = self.reserve(started, deadline).await?;

            let conn = match reservation.member.clone() {
                Some(member) => {
                    if member.has_session() && !self.recover(&member).await {
                        reservation.member = None;
                        drop(reservation);
                        self.discard(&member, "validation_failed").await;
                        self.replenish();
                        continue;
                    }
                    member
                }
                None => {
                    let member = self.inner.new_member();
                    reservation.member = Some(member.clone());
                    member
                }
            };

            if let Err(err) = conn.connect(target).await {
                if conn.status().is_failed() {
                    reservation.member = None;
                    drop(reservation);
                    self.discard(&conn, "connect_failed").await;
                    self.replenish();
                }
                return Err(err);
            }

            conn.touch();
            if !reservation.commit(&conn) {
                conn.close().await;
                return Err(PoolError::PoolShutdown);
            }
            tracing::debug!(id = %conn.id(), %target, "connection acquired");
            self.emit(PoolEvent::Acquired, &conn, &[]);
            return Ok(conn);
        }
    }

    /// Take an idle member or a free slot, waiting until `deadline`.
    async fn reserve(&self, started: Instant, deadline: Instant) -> Result<Reservation<'_>> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut members = self.inner.members.lock();
                if self.inner.is_shut_down() {
                    return Err(PoolError::PoolShutdown);
                }
                let member = members.idle.pop_front();
                if member.is_some() || members.total() < self.inner.config.max_pool_size {
                    members.in_flight += 1;
                    return Ok(Reservation {
                        inner: &self.inner,
                        member,
                        committed: false,
                    });
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                if self.inner.is_shut_down() {
                    return Err(PoolError::PoolShutdown);
                }
                let waited = started.elapsed();
                tracing::warn!(
                    ?waited,
                    max = self.inner.config.max_pool_size,
                    "connection pool exhausted"
                );
                self.inner.sink.emit(
                    PoolEvent::AcquireTimedOut,
                    &[("waited_ms", waited.as_millis().to_string())],
                );
                return Err(PoolError::PoolExhausted {
                    max_pool_size: self.inner.config.max_pool_size,
                    waited,
                });
            }
        }
    }

    /// Validate an idle member, falling back to the reconnection policy.
    async fn recover(&self, member: &ManagedConnection) -> bool {
        if member.validate(self.inner.config.max_retry_attempts).await {
            return true;
        }
        match member.reconnect_with(&self.inner.policy).await {
            Ok(outcome) => outcome.is_success(),
            Err(e) => {
                tracing::warn!(id = %member.id(), error = %e, "recovery failed");
                false
            }
        }
    }

    /// Return a checked-out connection.
    ///
    /// Healthy connections go back to the idle queue. Failed ones are closed
    /// and replaced up to `min_pool_size`.
    pub async fn release(&self, conn: &Arc<ManagedConnection>) -> Result<()> {
        if self.inner.is_shut_down() {
            return Err(PoolError::PoolShutdown);
        }
        let removed = self.inner.members.lock().active.remove(&conn.id());
        if removed.is_none() {
            return Err(PoolError::UnknownConnection(conn.id()));
        }
        conn.touch();

        if conn.status().is_failed() {
            self.discard(conn, "failed").await;
            self.replenish();
            return Ok(());
        }

        self.inner.members.lock().idle.push_back(conn.clone());
        self.inner.available.notify_one();
        tracing::debug!(id = %conn.id(), "connection released");
        self.emit(PoolEvent::Released, conn, &[]);
        Ok(())
    }

    /// Ping every idle member that has a session, and replace the failures.
    ///
    /// Active members are left alone.
    pub async fn health_check(&self) -> HealthReport {
        let candidates: Vec<Arc<ManagedConnection>> = self
            .inner
            .members
            .lock()
            .idle
            .iter()
            .filter(|m| m.has_session())
            .cloned()
            .collect();
        let threshold = self.inner.config.max_retry_attempts;
        let results = join_all(candidates.iter().map(|m| m.validate(threshold))).await;

        let mut report = HealthReport {
            checked: candidates.len(),
            ..HealthReport::default()
        };
        for (member, healthy) in candidates.iter().zip(results) {
            if healthy {
                continue;
            }
            let removed = {
                let mut members = self.inner.members.lock();
                match members.idle.iter().position(|m| Arc::ptr_eq(m, member)) {
                    Some(pos) => members.idle.remove(pos).is_some(),
                    None => false,
                }
            };
            if removed {
                self.emit(
                    PoolEvent::HealthCheckFailed,
                    member,
                    &[("status", member.status().to_string())],
                );
                self.discard(member, "health_check").await;
                report.evicted += 1;
            }
        }
        if report.evicted > 0 {
            report.replenished = self.replenish();
        }
        if report.checked > 0 {
            tracing::debug!(?report, "health check finished");
        }
        report
    }

    /// Close a member that has already left the pool's sets.
    async fn discard(&self, conn: &ManagedConnection, reason: &str) {
        self.inner.available.notify_one();
        conn.close().await;
        tracing::info!(id = %conn.id(), reason, "connection discarded");
        self.emit(PoolEvent::Discarded, conn, &[("reason", reason.to_string())]);
    }

    /// Top the pool up to `min_pool_size` with fresh members.
    fn replenish(&self) -> usize {
        let created = {
            let mut members = self.inner.members.lock();
            let mut created = 0;
            if !self.inner.is_shut_down() {
                while members.total() < self.inner.config.min_pool_size {
                    members.idle.push_back(self.inner.new_member());
                    created += 1;
                }
            }
            created
        };
        for _ in 0..created {
            self.inner.available.notify_one();
        }
        if created > 0 {
            self.inner
                .sink
                .emit(PoolEvent::Replenished, &[("created", created.to_string())]);
        }
        created
    }

    /// Close every member and refuse further use. Idempotent.
    pub async fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.health_task.lock().take() {
            handle.abort();
        }

        let drained: Vec<Arc<ManagedConnection>> = {
            let mut members = self.inner.members.lock();
            let idle = std::mem::take(&mut members.idle);
            let active = std::mem::take(&mut members.active);
            idle.into_iter().chain(active.into_values()).collect()
        };
        self.inner.available.notify_waiters();

        join_all(drained.iter().map(|m| m.close())).await;
        tracing::info!(closed = drained.len(), "connection pool closed");
        self.inner
            .sink
            .emit(PoolEvent::PoolClosed, &[("closed", drained.len().to_string())]);
    }

    /// Number of idle members.
    pub fn idle_count(&self) -> usize {
        self.inner.members.lock().idle.len()
    }

    /// Number of checked-out members.
    pub fn active_count(&self) -> usize {
        self.inner.members.lock().active.len()
    }

    /// Check whether the pool was closed.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let members = self.inner.members.lock();
        PoolStats {
            idle: members.idle.len(),
            active: members.active.len(),
            in_flight: members.in_flight,
            max_pool_size: self.inner.config.max_pool_size,
            min_pool_size: self.inner.config.min_pool_size,
            shut_down: self.inner.is_shut_down(),
        }
    }

    fn emit(&self, event: PoolEvent, conn: &ManagedConnection, extra: &[(&'static str, String)]) {
        let mut attributes = vec![("connection_id", conn.id().to_string())];
        if let Some(target) = conn.target() {
            attributes.push(("target", target.to_string()));
        }
        attributes.extend_from_slice(extra);
        self.inner.sink.emit(event, &attributes);
    }
}

async fn health_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else { break };
        if inner.is_shut_down() {
            break;
        }
        ConnectionPool { inner }.health_check().await;
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}
