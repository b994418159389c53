//! Error types for connection lifecycle and pooling operations.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionStatus;
use crate::types::ConnectionId;

/// Error produced by an external session implementation.
///
/// The pool never exposes these directly; they always arrive wrapped in a
/// [`PoolError`] that names the failing operation.
pub type SessionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while managing connections and sessions.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Illegal state-machine move. Always a logic defect, never retried.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    /// A connect, ping or disconnect exceeded its bound.
    #[error("{operation} timed out after {timeout:?}")]
    ConnectionTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Reconnection requested on a connection that never had a target.
    #[error("No previous target available for reconnection")]
    NoTarget,

    /// The target identity is empty or blank.
    #[error("Invalid target identity: {0:?}")]
    InvalidTarget(String),

    /// No idle member became available and the pool is at capacity.
    #[error("Connection pool exhausted: {max_pool_size} connections in use, waited {waited:?}")]
    PoolExhausted {
        max_pool_size: usize,
        waited: Duration,
    },

    /// Operation attempted after the pool was closed.
    #[error("Pool is shut down")]
    PoolShutdown,

    /// The session factory failed to build a session.
    #[error("Failed to create session for {endpoint}: {source}")]
    SessionCreation {
        endpoint: String,
        #[source]
        source: SessionError,
    },

    /// Every attempt of a reconnection policy failed.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    /// The underlying session reported an error.
    #[error("Session {operation} failed: {source}")]
    Session {
        operation: &'static str,
        #[source]
        source: SessionError,
    },

    /// The operation requires a live session and none is attached.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Release of a connection the pool does not consider checked out.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Wrap an error returned by the external session.
    pub fn session(operation: &'static str, source: SessionError) -> Self {
        Self::Session { operation, source }
    }

    /// Create a new not-connected error.
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    /// Create a new invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Check if this error is transient and worth another attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::PoolExhausted { .. }
                | Self::Session { .. }
                | Self::NotConnected(_)
        )
    }
}
