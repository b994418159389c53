//! Scripted in-memory sessions for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SessionError;
use crate::session::{
    ClientConfig, DiagnosticValue, EstablishedSession, Session, SessionFactory, SessionProvider,
    SubscriptionHandle,
};
use crate::types::EndpointUrl;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum PingMode {
    #[default]
    Value,
    Empty,
    Fail,
    Hang,
}

/// Knobs and counters shared by every session a control hands out.
#[derive(Default)]
pub(crate) struct MockControl {
    pub connect_fails: AtomicBool,
    pub connect_hangs: AtomicBool,
    pub disconnect_fails: AtomicBool,
    pub disconnect_hangs: AtomicBool,
    pub create_fails: AtomicBool,
    pub opened: AtomicU32,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    ping: Mutex<PingMode>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ping(&self, mode: PingMode) {
        *self.ping.lock() = mode;
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn provider(self: &Arc<Self>) -> Arc<dyn SessionProvider> {
        Arc::new(MockProvider(self.clone()))
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn SessionFactory> {
        Arc::new(MockFactory(self.clone()))
    }

    fn open(self: &Arc<Self>) -> Result<Arc<MockSession>, SessionError> {
        if self.create_fails.load(Ordering::SeqCst) {
            return Err("BadIdentityTokenRejected".into());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession {
            control: self.clone(),
            endpoint: Mutex::new(None),
            open: AtomicBool::new(false),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

pub(crate) struct MockSession {
    control: Arc<MockControl>,
    endpoint: Mutex<Option<EndpointUrl>>,
    open: AtomicBool,
}

impl MockSession {
    pub fn close_silently(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MockSession {
    async fn connect(&self, endpoint: &EndpointUrl) -> Result<(), SessionError> {
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        if self.control.connect_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.control.connect_fails.load(Ordering::SeqCst) {
            return Err("BadCommunicationError: connection refused".into());
        }
        *self.endpoint.lock() = Some(endpoint.clone());
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.control.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.control.disconnect_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.open.store(false, Ordering::SeqCst);
        if self.control.disconnect_fails.load(Ordering::SeqCst) {
            return Err("BadSessionIdInvalid".into());
        }
        Ok(())
    }

    async fn read_diagnostic(&self, _node: &str) -> Result<Option<DiagnosticValue>, SessionError> {
        let mode = *self.control.ping.lock();
        match mode {
            PingMode::Value => Ok(Some(DiagnosticValue::Int32(0))),
            PingMode::Empty => Ok(None),
            PingMode::Fail => Err("BadTimeout".into()),
            PingMode::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    fn is_session_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<EndpointUrl> {
        self.endpoint.lock().clone()
    }
}

struct MockProvider(Arc<MockControl>);

#[async_trait]
impl SessionProvider for MockProvider {
    async fn open_session(
        &self,
        _endpoint: &EndpointUrl,
    ) -> Result<Arc<dyn Session>, SessionError> {
        let session: Arc<dyn Session> = self.0.open()?;
        Ok(session)
    }
}

struct MockFactory(Arc<MockControl>);

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self, config: &ClientConfig) -> Result<EstablishedSession, SessionError> {
        let session = self.0.open()?;
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
