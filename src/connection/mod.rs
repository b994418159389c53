//! Connection lifecycle and pooling.
//!
//! This module provides:
//! - The validated connection state machine with health metrics
//! - Reconnection policies (exponential backoff and fixed interval)
//! - [`ManagedConnection`], one recoverable connection to an endpoint
//! - [`ConnectionPool`], a bounded pool with background health checks
//!
//! # Example
//!
//! ```no_run
//! use opcua_pool::connection::{ConnectionPool, PoolConfig};
//! use opcua_pool::session::SessionProvider;
//! use opcua_pool::EndpointUrl;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(provider: Arc<dyn SessionProvider>) -> opcua_pool::Result<()> {
//! let config = PoolConfig::default()
//!     .with_max_pool_size(4)
//!     .with_connection_timeout(Duration::from_secs(5));
//!
//! let pool = ConnectionPool::with_provider(config, provider)?;
//!
//! let conn = pool.acquire(&EndpointUrl::from("opc.tcp://plc:4840")).await?;
//! let status = conn.ping().await?;
//! println!("{} is {status}", conn.id());
//!
//! pool.release(&conn).await?;
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod managed;
mod pool;
mod reconnect;
mod state;

pub use config::PoolConfig;
pub use managed::{DisconnectOutcome, ManagedConnection};
pub use pool::{ConnectionPool, HealthReport, PoolStats};
pub use reconnect::{
    AttemptOutcome, BackoffPolicy, LinearPolicy, ReconnectOutcome, ReconnectionPolicy,
};
pub use state::{ConnectionState, ConnectionStatus, HealthMetrics};
