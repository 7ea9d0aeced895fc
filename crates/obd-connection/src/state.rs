//! Diagnostic state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single authoritative state of a connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reading,
    Clearing,
    Error,
}

impl DiagnosticState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticState::Disconnected => "disconnected",
            DiagnosticState::Connecting => "connecting",
            DiagnosticState::Authenticating => "authenticating",
            DiagnosticState::Ready => "ready",
            DiagnosticState::Reading => "reading",
            DiagnosticState::Clearing => "clearing",
            DiagnosticState::Error => "error",
        }
    }

    /// An operation currently owns the driver
    pub fn is_busy(&self) -> bool {
        matches!(self, DiagnosticState::Reading | DiagnosticState::Clearing)
    }

    /// Connect or handshake in progress
    pub fn is_connecting(&self) -> bool {
        matches!(self, DiagnosticState::Connecting | DiagnosticState::Authenticating)
    }

    /// A driver is attached and usable
    pub fn has_driver(&self) -> bool {
        matches!(
            self,
            DiagnosticState::Ready | DiagnosticState::Reading | DiagnosticState::Clearing
        )
    }

    /// Allowed edges of the state machine
    pub fn can_transition(self, to: DiagnosticState) -> bool {
        use DiagnosticState::*;
        match (self, to) {
            (Disconnected, Connecting) => true,
            (Connecting, Authenticating | Error | Disconnected) => true,
            (Authenticating, Ready | Error | Disconnected) => true,
            (Ready, Reading | Clearing | Connecting | Disconnected | Error) => true,
            (Reading | Clearing, Ready | Error | Disconnected) => true,
            (Error, Connecting | Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DiagnosticState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operation does with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Reading,
    Clearing,
}

impl Activity {
    pub fn state(self) -> DiagnosticState {
        match self {
            Activity::Reading => DiagnosticState::Reading,
            Activity::Clearing => DiagnosticState::Clearing,
        }
    }
}

/// One edge taken by the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: DiagnosticState,
    pub to: DiagnosticState,
    pub reason: String,
    pub reconnect_attempts: u32,
    pub at: DateTime<Utc>,
}
