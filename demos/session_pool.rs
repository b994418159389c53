//! Session and connection pooling example.
//!
//! This example runs the pools against a simulated OPC UA server: an
//! in-memory session that can be told to go silent or refuse connections.
//! It shows connection reuse, recovery after an outage, keyed session reuse
//! and the events every step emits.
//!
//! Run: cargo run --example session_pool

use async_trait::async_trait;
use opcua_pool::manager::ManagerConfig;
use opcua_pool::session::{
    DiagnosticValue, EstablishedSession, Session, SessionFactory, SessionProvider,
    SubscriptionConfig, SubscriptionHandle,
};
use opcua_pool::{
    ClientConfig, ConnectionPool, EndpointUrl, MemorySink, PoolConfig, PoolManager, SessionError,
    SessionPool,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

const ENDPOINT: &str = "opc.tcp://127.0.0.1:4840";

/// Simulated server shared by every session it opens.
#[derive(Default)]
struct Server {
    down: AtomicBool,
    sessions_opened: AtomicU32,
}

struct SimulatedSession {
    server: Arc<Server>,
    endpoint: EndpointUrl,
    open: AtomicBool,
}

#[async_trait]
impl Session for SimulatedSession {
    async fn connect(&self, _endpoint: &EndpointUrl) -> Result<(), SessionError> {
        if self.server.down.load(Ordering::SeqCst) {
            return Err("BadCommunicationError: connection refused".into());
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read_diagnostic(&self, _node: &str) -> Result<Option<DiagnosticValue>, SessionError> {
        if self.server.down.load(Ordering::SeqCst) {
            return Err("BadTimeout".into());
        }
        // ServerState::Running
        Ok(Some(DiagnosticValue::Int32(0)))
    }

    fn is_session_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<EndpointUrl> {
        Some(self.endpoint.clone())
    }
}

struct SimulatedStack(Arc<Server>);

impl SimulatedStack {
    fn open(&self, endpoint: &EndpointUrl) -> Arc<SimulatedSession> {
        self.0.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(SimulatedSession {
            server: self.0.clone(),
            endpoint: endpoint.clone(),
            open: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionProvider for SimulatedStack {
    async fn open_session(&self, endpoint: &EndpointUrl) -> Result<Arc<dyn Session>, SessionError> {
        let session: Arc<dyn Session> = self.open(endpoint);
        Ok(session)
    }
}

#[async_trait]
impl SessionFactory for SimulatedStack {
    async fn create(&self, config: &ClientConfig) -> Result<EstablishedSession, SessionError> {
        let session = self.open(&config.endpoint_url);
        session.connect(&config.endpoint_url).await?;
        let subscriptions = config
            .subscriptions
            .iter()
            .zip(1..)
            .map(|(sub, subscription_id)| SubscriptionHandle {
                subscription_id,
                name: sub.name.clone(),
            })
            .collect();
        Ok(EstablishedSession {
            session,
            subscriptions,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(Server::default());
    let stack = Arc::new(SimulatedStack(server.clone()));
    let events = Arc::new(MemorySink::new());
    let endpoint = EndpointUrl::from(ENDPOINT);

    // Example 1: Connection reuse
    println!("--- Example 1: Connection Pool ---");
    let config = PoolConfig::default()
        .with_max_pool_size(2)
        .with_connection_timeout(Duration::from_secs(2))
        .with_backoff(Duration::from_millis(200), 2.0);
    let pool = ConnectionPool::new(config, stack.clone(), events.clone())?;

    let conn = pool.acquire(&endpoint).await?;
    println!("Acquired {} ({})", conn.id(), conn.status());
    pool.release(&conn).await?;

    let again = pool.acquire(&endpoint).await?;
    println!(
        "Acquired {} again, sessions opened so far: {}",
        again.id(),
        server.sessions_opened.load(Ordering::SeqCst)
    );

    // Example 2: Recovery after an outage
    println!("\n--- Example 2: Reconciliation ---");
    let manager = PoolManager::new(pool.clone(), ManagerConfig::default(), events.clone());
    pool.release(&again).await?;
    let conn = manager.obtain(&endpoint).await?;

    server.down.store(true, Ordering::SeqCst);
    let ping = conn.ping().await;
    println!("Ping while the server is down: {ping:?}, status {}", conn.status());

    server.down.store(false, Ordering::SeqCst);
    let report = manager.reconcile().await;
    println!("Reconciled: {report:?}, status {}", conn.status());
    if let Some(stats) = manager.stats(conn.id()) {
        println!("Usage count: {}", stats.usage_count);
    }
    manager.shutdown().await;
    pool.close().await;

    // Example 3: Keyed sessions
    println!("\n--- Example 3: Session Pool ---");
    let sessions = SessionPool::new(Default::default(), stack.clone(), events.clone());
    let client = ClientConfig::new(ENDPOINT, "line-1")
        .with_subscription(SubscriptionConfig::new("alarms").with_node("ns=2;s=Line1.Alarm"));

    let first = sessions.obtain(&client).await?;
    println!("Session {} under {}", first.id(), first.key());
    sessions.release(&first).await?;

    let second = sessions.obtain(&client).await?;
    println!(
        "Reused the same session: {}, subscriptions: {}",
        Arc::ptr_eq(first.session(), second.session()),
        second.subscriptions().len()
    );
    sessions.release(&second).await?;
    sessions.close().await;

    println!("\n--- Events ---");
    for event in events.events() {
        println!("{} {:?}", event.event, event.attributes);
    }

    println!("\nDone!");
    Ok(())
}
