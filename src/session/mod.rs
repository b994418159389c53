//! Seams to the underlying OPC UA stack, and the keyed session pool.
//!
//! The pool never speaks the wire protocol itself. An embedding application
//! implements [`Session`] over its protocol stack and hands the pool either a
//! [`SessionProvider`] (for [`ConnectionPool`](crate::ConnectionPool)) or a
//! [`SessionFactory`] (for [`SessionPool`]).

mod config;
mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SessionError;
use crate::types::EndpointUrl;

pub use config::{ClientConfig, ClientKey, SubscriptionConfig};
pub use pool::{PooledSession, SessionPool, SessionPoolConfig, SessionPoolStats};

/// Node read by a ping: `Server_ServerStatus_State`.
pub const SERVER_STATE_NODE: &str = "ns=0;i=2259";

/// Value read from a diagnostic node.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticValue {
    /// Null variant.
    Null,
    /// Boolean.
    Boolean(bool),
    /// Signed 32-bit integer, used by enumerations such as `ServerState`.
    Int32(i32),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Double.
    Double(f64),
    /// String.
    String(String),
    /// Raw bytes.
    ByteString(Bytes),
}

impl DiagnosticValue {
    /// Check whether the value carries nothing a ping can use.
    pub fn is_empty(&self) -> bool {
        match self {
            DiagnosticValue::Null => true,
            DiagnosticValue::String(s) => s.is_empty(),
            DiagnosticValue::ByteString(b) => b.is_empty(),
            _ => false,
        }
    }
}

/// An established session with a remote endpoint.
///
/// Implementations must be cancel-safe: the pool wraps every call in a
/// timeout and drops the future when it expires.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the secure channel and activate the session.
    async fn connect(&self, endpoint: &EndpointUrl) -> Result<(), SessionError>;

    /// Close the session.
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Read the value attribute of `node`. `Ok(None)` means nothing came back.
    async fn read_diagnostic(&self, node: &str) -> Result<Option<DiagnosticValue>, SessionError>;

    /// Check whether the session is still open on the client side.
    fn is_session_open(&self) -> bool;

    /// Endpoint the session is bound to, once known.
    fn endpoint(&self) -> Option<EndpointUrl>;
}

/// Opens fresh sessions for managed connections.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Build a session for `endpoint`. The session is not connected yet.
    async fn open_session(&self, endpoint: &EndpointUrl) -> Result<Arc<dyn Session>, SessionError>;
}

/// A subscription attached by the session factory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscriptionHandle {
    /// Server-assigned subscription id.
    pub subscription_id: u32,
    /// Name from the subscription configuration.
    pub name: String,
}

/// Output of a [`SessionFactory`]: a connected session plus its subscriptions.
#[derive(Clone)]
pub struct EstablishedSession {
    /// The connected session.
    pub session: Arc<dyn Session>,
    /// Subscriptions created during setup.
    pub subscriptions: Vec<SubscriptionHandle>,
}

impl std::fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("endpoint", &self.session.endpoint())
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

/// Builds connected sessions from a validated configuration.
///
/// The factory performs the full handshake and attaches the configured
/// subscriptions. Its errors reach callers as
/// [`PoolError::SessionCreation`](crate::PoolError::SessionCreation).
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create and connect a session for `config`.
    async fn create(&self, config: &ClientConfig) -> Result<EstablishedSession, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_diagnostic_values() {
        assert!(DiagnosticValue::Null.is_empty());
        assert!(DiagnosticValue::String(String::new()).is_empty());
        assert!(DiagnosticValue::ByteString(Bytes::new()).is_empty());
        assert!(!DiagnosticValue::Int32(0).is_empty());
        assert!(!DiagnosticValue::ByteString(Bytes::from_static(b"\x00")).is_empty());
    }
}
