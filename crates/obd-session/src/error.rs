//! Session errors

use crate::timeline::OperationKind;
use obd_connection::{ConnectionError, DiagnosticState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection could not enter the operation's state
    #[error("Cannot run {kind}: {source}")]
    InvalidState {
        kind: OperationKind,
        #[source]
        source: ConnectionError,
    },
    /// Every attempt failed; `error` is the last attempt's error
    #[error("{kind} failed after {attempts} attempt(s): {error:#}")]
    Exhausted {
        kind: OperationKind,
        attempts: u32,
        error: anyhow::Error,
    },
}

impl SessionError {
    pub fn kind(&self) -> OperationKind {
        match self {
            SessionError::InvalidState { kind, .. } | SessionError::Exhausted { kind, .. } => *kind,
        }
    }

    /// No adapter was attached, or it was lost during the operation
    pub fn is_not_connected(&self) -> bool {
        match self {
            SessionError::InvalidState {
                source: ConnectionError::NotConnected { .. },
                ..
            } => true,
            SessionError::InvalidState { .. } => false,
            SessionError::Exhausted { error, .. } => error
                .downcast_ref::<ConnectionError>()
                .is_some_and(|e| e.is_link_failure() || matches!(e, ConnectionError::NotConnected { .. })),
        }
    }

    /// State the connection refused from, if that was the failure
    pub fn refused_state(&self) -> Option<DiagnosticState> {
        match self {
            SessionError::InvalidState {
                source: ConnectionError::NotConnected { state } | ConnectionError::InvalidState { state, .. },
                ..
            } => Some(*state),
            _ => None,
        }
    }
}
