//! Scheduler errors

use obd_connection::DiagnosticState;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("No adapter attached (state: {state})")]
    NotConnected { state: DiagnosticState },

    #[error("Unknown PID '{0}'")]
    UnknownPid(String),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}
