//! OBD-II Error Types

use thiserror::Error;

/// Errors raised by a transport while opening, writing or receiving
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No adapter matched the configured path or name
    #[error("Adapter not found: {0}")]
    DeviceNotFound(String),

    /// Opening the link did not complete in time
    #[error("Timed out connecting to adapter after {0}ms")]
    ConnectTimeout(u64),

    /// The link could not be established
    #[error("Failed to connect to adapter: {0}")]
    ConnectFailed(String),

    /// Bytes could not be written to the link
    #[error("Write to adapter failed: {0}")]
    WriteFailed(String),

    /// The link was closed underneath us
    #[error("Adapter link closed")]
    Closed,

    /// The transport kind is not available in this build
    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether a reconnect can be expected to clear this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::Unsupported(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransportError::DeviceNotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => TransportError::ConnectTimeout(0),
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::WriteFailed(err.to_string()),
        }
    }
}

/// Errors that can occur during OBD-II communication
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObdError {
    /// Link level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Timeout waiting for response
    #[error("Timeout waiting for response to {command} after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Payload width did not match the PID definition
    #[error("PID {pid:02X} expected {expected} data bytes, got {actual}")]
    ParseError {
        pid: u8,
        expected: usize,
        actual: usize,
    },

    /// Protocol not supported
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// PID not supported by vehicle
    #[error("PID {0:02X} not supported by vehicle")]
    PidNotSupported(u8),

    /// Adapter rejected the command with `?`
    #[error("Adapter rejected command {0}")]
    UnknownCommand(String),

    /// Adapter not responding
    #[error("OBD adapter not responding")]
    AdapterNotResponding,

    /// Adapter answered but no ECU did
    #[error("Vehicle ignition is off or not connected")]
    VehicleNotConnected,
}

impl ObdError {
    /// Whether this error means the adapter link itself is gone
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ObdError::Transport(_) | ObdError::AdapterNotResponding
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "/dev/ttyUSB9").into();
        assert!(matches!(err, TransportError::DeviceNotFound(_)));

        let err: TransportError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, TransportError::Closed);
    }

    #[test]
    fn test_transport_classification() {
        assert!(ObdError::from(TransportError::Closed).is_transport());
        assert!(!ObdError::PidNotSupported(0x0C).is_transport());
        assert!(!TransportError::Unsupported("ble".into()).is_recoverable());
        assert!(TransportError::WriteFailed("x".into()).is_recoverable());
    }
}
