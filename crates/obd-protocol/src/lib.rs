//! OBD-II Protocol Implementation
//!
//! This crate provides async communication with ELM327-compatible OBD-II
//! adapters over serial, Bluetooth LE or a simulated link. It supports
//! ISO 15765-4 (CAN) and legacy protocols.

mod client;
pub mod dtc;
pub mod elm;
mod error;
mod pid;
mod protocol;
pub mod transport;

pub use client::{
    ClientConfig, DriverMetrics, HandshakeInfo, LiveData, MetricsHandle, ObdClient, SelfCheckReport,
    VehicleStatus,
};
pub use dtc::{Dtc, DtcCategory, DtcSeverity};
pub use error::{ObdError, TransportError};
pub use pid::{LiveReading, Pid, PidDefinition, PID_TABLE};
pub use protocol::ObdProtocol;
pub use transport::{
    BleConfig, SerialConfig, SimulatedAdapter, SimulatedVehicle, Transport, TransportConfig, TransportEvent,
    TransportKind,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
