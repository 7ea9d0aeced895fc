//! Adapter Connections
//!
//! [`ConnectionManager`] owns the lifecycle of one adapter and its
//! diagnostic state machine. [`ConnectionPool`] shares several of them
//! between vehicles with FIFO fairness and periodic health checks.

mod error;
mod manager;
mod pool;
mod state;

pub use error::{ConnectionError, PoolError};
pub use manager::{ConnectOptions, ConnectionManager, ConnectionSnapshot, ReconnectPolicy};
pub use pool::{ConnectionPool, PoolConfig, PoolEvent, PoolStats, PooledConnection, SlotInfo, SlotOptions};
pub use state::{Activity, DiagnosticState, StateTransition};
