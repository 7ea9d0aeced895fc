//! Connection and pool errors

use crate::state::DiagnosticState;
use obd_protocol::ObdError;
use thiserror::Error;

/// Errors from the connection manager
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Adapter not connected (state: {state})")]
    NotConnected { state: DiagnosticState },
    #[error("Cannot {action} while {state}")]
    InvalidState {
        state: DiagnosticState,
        action: &'static str,
    },
    #[error("Connect failed: {0}")]
    Connect(ObdError),
    #[error("Reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
    #[error(transparent)]
    Driver(#[from] ObdError),
}

impl ConnectionError {
    /// Whether the adapter link is gone and a reconnect may help
    pub fn is_link_failure(&self) -> bool {
        match self {
            ConnectionError::Connect(e) | ConnectionError::Driver(e) => e.is_transport(),
            ConnectionError::ReconnectExhausted { .. } => true,
            _ => false,
        }
    }
}

/// Errors from the connection pool
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("Vehicle {0} already holds a connection")]
    AlreadyConnected(String),
    #[error("Timed out after {waited_ms}ms waiting for a connection for {vehicle}")]
    AcquireTimeout { vehicle: String, waited_ms: u64 },
    #[error("No connection held by vehicle {0}")]
    SlotNotFound(String),
    #[error("Pool is shutting down")]
    ShuttingDown,
    #[error("Slot {slot} failed to connect: {source}")]
    Connect {
        slot: usize,
        #[source]
        source: ConnectionError,
    },
}
