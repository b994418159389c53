//! Connection lifecycle and pooling for OPC UA clients.
//!
//! This crate manages the client side of OPC UA connectivity above the
//! protocol stack: it tracks every connection through a validated state
//! machine, recovers dropped connections with a configurable retry policy,
//! and pools connections and sessions so callers reuse them instead of
//! negotiating new ones.
//!
//! # Features
//!
//! - Validated connection state machine with per-state health metrics
//! - Exponential-backoff and fixed-interval reconnection
//! - Bounded connection pool with FIFO reuse and background health checks
//! - Session pool keyed by endpoint, application name and security profile
//! - Supervisor with usage accounting and periodic reconciliation
//! - Structured pool events through a pluggable [`EventSink`]
//!
//! The wire protocol is not part of this crate. Implement
//! [`Session`](session::Session) and [`SessionProvider`](session::SessionProvider)
//! (or [`SessionFactory`](session::SessionFactory)) over the stack in use.
//!
//! # Example
//!
//! ```no_run
//! use opcua_pool::{ConnectionPool, EndpointUrl, PoolConfig, PoolManager};
//! use opcua_pool::manager::ManagerConfig;
//! use opcua_pool::session::SessionProvider;
//! use std::sync::Arc;
//!
//! # async fn example(provider: Arc<dyn SessionProvider>) -> opcua_pool::Result<()> {
//! let pool = ConnectionPool::with_provider(PoolConfig::default(), provider)?;
//! let manager = PoolManager::with_pool(pool);
//! manager.start();
//!
//! let conn = manager.obtain(&EndpointUrl::from("opc.tcp://plc:4840")).await?;
//! if let Some(stats) = manager.stats(conn.id()) {
//!     println!("used {} times, {}", stats.usage_count, stats.status);
//! }
//! manager.release(&conn).await?;
//!
//! manager.shutdown().await;
//! manager.pool().close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Connection states
//!
//! ```text
//! Unknown ──> Connecting ──> Connected ──> Disconnecting ──> Disconnected
//!                 │             │  ▲                              │
//!                 │             ▼  │                              ▼
//!                 │          NoResponse                       Connecting
//!                 ▼             │
//!               Error <─────────┴──> Reconnecting ──> Connected
//! ```

pub mod connection;
pub mod error;
pub mod event;
pub mod manager;
pub mod session;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at the crate root
pub use connection::{
    ConnectionPool, ConnectionStatus, ManagedConnection, PoolConfig, ReconnectionPolicy,
};
pub use error::{PoolError, Result, SessionError};
pub use event::{EventSink, MemorySink, PoolEvent, TracingSink};
pub use manager::PoolManager;
pub use session::{ClientConfig, ClientKey, SessionPool};
pub use types::{ConnectionId, EndpointUrl, IdentityKind, MessageSecurityMode, SecurityPolicy};
