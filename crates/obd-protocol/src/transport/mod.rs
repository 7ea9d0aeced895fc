//! Adapter Transports
//!
//! A transport moves raw bytes between the driver and a physical (or
//! simulated) adapter. Incoming bytes, link closure and link errors are
//! delivered on the channel returned by [`Transport::open`]; dropping the
//! receiver unsubscribes.

#[cfg(feature = "ble")]
mod ble;
mod mock;
mod serial;

#[cfg(feature = "ble")]
pub use ble::BleTransport;
pub use mock::{MockTransport, SimulatedAdapter, SimulatedVehicle};
pub use serial::SerialTransport;

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of the event channel between a transport and its driver
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Link type of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Serial,
    Ble,
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Serial => "serial",
            TransportKind::Ble => "ble",
            TransportKind::Simulated => "simulated",
        })
    }
}

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Bytes received from the adapter
    Data(Vec<u8>),
    /// The link closed
    Closed,
    /// The link reported an error; it may still be open
    Error(TransportError),
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub path: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
        }
    }
}

/// Bluetooth LE bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Substring matched against advertised local names
    pub name_filter: String,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub service_uuid: String,
    /// Characteristic the adapter notifies responses on
    pub notify_uuid: String,
    /// Characteristic commands are written to
    pub write_uuid: String,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name_filter: "OBDII".to_string(),
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            service_uuid: "0000fff0-0000-1000-8000-00805f9b34fb".to_string(),
            notify_uuid: "0000fff1-0000-1000-8000-00805f9b34fb".to_string(),
            write_uuid: "0000fff2-0000-1000-8000-00805f9b34fb".to_string(),
        }
    }
}

/// How to reach an adapter, chosen once from validated configuration
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Serial(SerialConfig),
    Ble(BleConfig),
    Simulated(SimulatedAdapter),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Serial(_) => TransportKind::Serial,
            TransportConfig::Ble(_) => TransportKind::Ble,
            TransportConfig::Simulated(_) => TransportKind::Simulated,
        }
    }
}

/// An adapter link
pub enum Transport {
    Serial(SerialTransport),
    #[cfg(feature = "ble")]
    Ble(BleTransport),
    Simulated(MockTransport),
}

impl Transport {
    /// Build an unopened transport for the given configuration
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        match config {
            TransportConfig::Serial(cfg) => Ok(Transport::Serial(SerialTransport::new(cfg.clone()))),
            #[cfg(feature = "ble")]
            TransportConfig::Ble(cfg) => Ok(Transport::Ble(BleTransport::new(cfg.clone()))),
            #[cfg(not(feature = "ble"))]
            TransportConfig::Ble(_) => Err(TransportError::Unsupported(
                "built without the `ble` feature".to_string(),
            )),
            TransportConfig::Simulated(adapter) => {
                Ok(Transport::Simulated(MockTransport::new(adapter.clone())))
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Serial(_) => TransportKind::Serial,
            #[cfg(feature = "ble")]
            Transport::Ble(_) => TransportKind::Ble,
            Transport::Simulated(_) => TransportKind::Simulated,
        }
    }

    /// Open the link and subscribe to its events
    pub async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        match self {
            Transport::Serial(t) => t.open().await,
            #[cfg(feature = "ble")]
            Transport::Ble(t) => t.open().await,
            Transport::Simulated(t) => t.open().await,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match self {
            Transport::Serial(t) => t.write(bytes).await,
            #[cfg(feature = "ble")]
            Transport::Ble(t) => t.write(bytes).await,
            Transport::Simulated(t) => t.write(bytes).await,
        }
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Transport::Serial(t) => t.close().await,
            #[cfg(feature = "ble")]
            Transport::Ble(t) => t.close().await,
            Transport::Simulated(t) => t.close().await,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Transport::Serial(t) => t.is_open(),
            #[cfg(feature = "ble")]
            Transport::Ble(t) => t.is_open(),
            Transport::Simulated(t) => t.is_open(),
        }
    }

    /// Advertised name of the connected BLE peripheral
    pub fn device_name(&self) -> Option<String> {
        match self {
            #[cfg(feature = "ble")]
            Transport::Ble(t) => t.device_name(),
            _ => None,
        }
    }
}
