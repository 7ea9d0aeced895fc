//! Bluetooth LE ELM327 bridge
//!
//! BLE adapters expose the serial dialect through a write characteristic
//! and a notify characteristic on a vendor service.

use super::{BleConfig, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::error::TransportError;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval between peripheral list polls while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Largest write the bridge accepts without long-write support
const MAX_WRITE_CHUNK: usize = 20;

/// Stops an active scan when dropped, so a cancelled `open` still releases
/// the radio.
struct ScanGuard {
    adapter: Option<Adapter>,
}

impl ScanGuard {
    async fn stop(mut self) {
        if let Some(adapter) = self.adapter.take() {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if let Some(adapter) = self.adapter.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = adapter.stop_scan().await;
                });
            }
        }
    }
}

/// BLE transport backed by `btleplug`
pub struct BleTransport {
    config: BleConfig,
    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    device_name: Option<String>,
    notify_task: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            peripheral: None,
            write_char: None,
            device_name: None,
            notify_task: None,
        }
    }

    pub async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.peripheral.is_some() {
            self.close().await?;
        }

        let service = parse_uuid(&self.config.service_uuid)?;
        let notify_uuid = parse_uuid(&self.config.notify_uuid)?;
        let write_uuid = parse_uuid(&self.config.write_uuid)?;

        let manager = Manager::new().await.map_err(ble_error)?;
        let central = manager
            .adapters()
            .await
            .map_err(ble_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::DeviceNotFound("no bluetooth radio".to_string()))?;

        let (peripheral, name) = self.scan(&central, service).await?;
        info!("Connecting to BLE adapter {}", name);

        tokio::time::timeout(self.config.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout.as_millis() as u64))?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let chars = peripheral.characteristics();
        let notify_char = chars
            .iter()
            .find(|c| c.uuid == notify_uuid)
            .cloned()
            .ok_or_else(|| TransportError::ConnectFailed(format!("missing characteristic {}", notify_uuid)))?;
        let write_char = chars
            .iter()
            .find(|c| c.uuid == write_uuid)
            .cloned()
            .ok_or_else(|| TransportError::ConnectFailed(format!("missing characteristic {}", write_uuid)))?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid != notify_uuid {
                    continue;
                }
                if tx.send(TransportEvent::Data(n.value)).await.is_err() {
                    return;
                }
            }
            debug!("BLE notification stream ended");
            let _ = tx.send(TransportEvent::Closed).await;
        });

        self.peripheral = Some(peripheral);
        self.write_char = Some(write_char);
        self.device_name = Some(name);
        self.notify_task = Some(task);
        Ok(rx)
    }

    /// Scan until a peripheral whose name matches the filter shows up
    async fn scan(&self, central: &Adapter, service: Uuid) -> Result<(Peripheral, String), TransportError> {
        info!(
            "Scanning for BLE adapter matching '{}' ({}ms)",
            self.config.name_filter,
            self.config.scan_timeout.as_millis()
        );
        central
            .start_scan(ScanFilter { services: vec![service] })
            .await
            .map_err(ble_error)?;
        let guard = ScanGuard {
            adapter: Some(central.clone()),
        };

        let deadline = Instant::now() + self.config.scan_timeout;
        let filter = self.config.name_filter.to_lowercase();
        loop {
            for p in central.peripherals().await.map_err(ble_error)? {
                let name = p
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|props| props.local_name);
                if let Some(name) = name {
                    if name.to_lowercase().contains(&filter) {
                        guard.stop().await;
                        return Ok((p, name));
                    }
                }
            }

            if Instant::now() >= deadline {
                guard.stop().await;
                return Err(TransportError::DeviceNotFound(format!(
                    "no BLE adapter named '{}' within {}ms",
                    self.config.name_filter,
                    self.config.scan_timeout.as_millis()
                )));
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let (Some(peripheral), Some(ch)) = (self.peripheral.as_ref(), self.write_char.as_ref()) else {
            return Err(TransportError::Closed);
        };
        for chunk in bytes.chunks(MAX_WRITE_CHUNK) {
            peripheral
                .write(ch, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.write_char = None;
        if let Some(peripheral) = self.peripheral.take() {
            info!("Disconnecting BLE adapter {:?}", self.device_name);
            peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.peripheral.is_some()
    }

    pub fn device_name(&self) -> Option<String> {
        self.device_name.clone()
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(s).map_err(|e| TransportError::Unsupported(format!("bad uuid {}: {}", s, e)))
}

fn ble_error(err: btleplug::Error) -> TransportError {
    match err {
        btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound("ble peripheral".to_string()),
        btleplug::Error::NotConnected => TransportError::Closed,
        btleplug::Error::TimedOut(d) => TransportError::ConnectTimeout(d.as_millis() as u64),
        other => TransportError::ConnectFailed(other.to_string()),
    }
}
