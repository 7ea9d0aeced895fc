//! OBD-II Client for ELM327 Adapters
//!
//! Drives the adapter's AT dialect over a [`Transport`]. Commands are strictly
//! sequential: `&mut self` on every exchange means one command/response pair
//! is in flight per adapter.

use crate::dtc::{dedupe_codes, decode_dtc_bytes, Dtc};
use crate::elm::{self, PROMPT};
use crate::error::{ObdError, TransportError};
use crate::mode;
use crate::pid::{LiveReading, Pid};
use crate::protocol::ObdProtocol;
use crate::transport::{MockTransport, SimulatedAdapter, Transport, TransportEvent, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// `ATZ` reboots the adapter and takes longer than a normal command
const RESET_TIMEOUT_MS: u64 = 5000;

/// The first OBD request triggers a protocol search
const PROBE_TIMEOUT_MS: u64 = 10000;

/// Driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout applied to commands without an explicit one
    pub command_timeout: Duration,
    pub reset_timeout: Duration,
    pub probe_timeout: Duration,
    /// Protocol requested during the handshake
    pub protocol: ObdProtocol,
    /// Restrict negotiation to ISO 15765-4 CAN
    pub can_fd_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            reset_timeout: Duration::from_millis(RESET_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            protocol: ObdProtocol::Auto,
            can_fd_enabled: false,
        }
    }
}

/// Command counters, readable at any time without touching the adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverMetrics {
    pub commands_attempted: u64,
    pub commands_failed: u64,
    pub timeouts: u64,
    pub parse_errors: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub detected_protocol: Option<ObdProtocol>,
    pub last_command_at: Option<DateTime<Utc>>,
}

/// Shared, lock-protected metrics of one driver
pub type MetricsHandle = Arc<RwLock<DriverMetrics>>;

/// Result of the adapter handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Answer to `ATI`, when the adapter gave one
    pub identity: Option<String>,
    /// Protocol reported after negotiation, `None` if no ECU answered
    pub protocol: Option<ObdProtocol>,
    pub transport: TransportKind,
    pub device_name: Option<String>,
}

/// Mode 01 PID 01 summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleStatus {
    /// Malfunction indicator lamp lit
    pub mil_on: bool,
    pub dtc_count: u8,
}

/// One pass over a set of live PIDs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub readings: Vec<LiveReading>,
    /// PIDs the vehicle answered `NO DATA` for
    pub unsupported: Vec<Pid>,
}

impl LiveData {
    /// Values keyed by PID name
    pub fn values(&self) -> BTreeMap<String, f64> {
        self.readings
            .iter()
            .map(|r| (r.pid.name().to_string(), r.value))
            .collect()
    }

    pub fn get(&self, pid: Pid) -> Option<f64> {
        self.readings.iter().find(|r| r.pid == pid).map(|r| r.value)
    }
}

/// Outcome of the adapter self check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfCheckReport {
    pub identity: Option<String>,
    pub battery_voltage: Option<f64>,
    pub protocol: Option<ObdProtocol>,
    pub status: Option<VehicleStatus>,
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    transport: Transport,
    events: Option<mpsc::Receiver<TransportEvent>>,
    config: ClientConfig,
    identity: Option<String>,
    protocol: Option<ObdProtocol>,
    metrics: MetricsHandle,
    /// Commands that timed out and may still answer late
    stale_responses: u32,
    link_lost: bool,
}

impl ObdClient {
    /// Create a new OBD client on an unopened transport
    pub fn new(transport: Transport, config: ClientConfig) -> Self {
        info!("Creating OBD client on {} transport", transport.kind());
        Self {
            transport,
            events: None,
            config,
            identity: None,
            protocol: None,
            metrics: Arc::new(RwLock::new(DriverMetrics::default())),
            stale_responses: 0,
            link_lost: false,
        }
    }

    /// Create a client on a default simulated adapter (no hardware required)
    pub fn mock() -> Self {
        info!("Creating mock OBD client for testing");
        Self::new(
            Transport::Simulated(MockTransport::new(SimulatedAdapter::default())),
            ClientConfig {
                command_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    /// Open the transport and run the handshake
    pub async fn connect(&mut self) -> Result<HandshakeInfo, ObdError> {
        self.open().await?;
        self.initialize().await
    }

    /// Open the transport and subscribe to its events
    pub async fn open(&mut self) -> Result<(), ObdError> {
        let rx = self.transport.open().await.map_err(|e| self.fail(e.into()))?;
        self.events = Some(rx);
        self.link_lost = false;
        self.stale_responses = 0;
        Ok(())
    }

    /// Initialize the ELM327 adapter.
    ///
    /// Reset, configure the output format, identify (non-fatal), select the
    /// protocol and probe the bus with `0100`. A silent bus is not fatal: the
    /// adapter is usable and reads degrade individually.
    pub async fn initialize(&mut self) -> Result<HandshakeInfo, ObdError> {
        info!("Initializing OBD adapter over {}", self.transport.kind());
        let reset_timeout = self.config.reset_timeout;
        self.command("ATZ", reset_timeout, None).await?;
        for cmd in ["ATE0", "ATL0", "ATS1", "ATH0"] {
            self.expect_ok(cmd).await?;
        }

        self.identity = match self.command("ATI", self.config.command_timeout, None).await {
            Ok(lines) if elm::status_error(&lines, "ATI").is_none() => {
                lines.into_iter().find(|l| l != "OK")
            }
            Ok(lines) => {
                warn!("Adapter identification rejected: {:?}", lines);
                None
            }
            Err(e) => {
                warn!("Adapter identification failed: {}", e);
                None
            }
        };

        let requested = if self.config.can_fd_enabled {
            ObdProtocol::Iso15765_4Can11bit500
        } else {
            self.config.protocol
        };
        self.expect_ok(requested.to_elm_command()).await?;

        let probe_timeout = self.config.probe_timeout;
        self.protocol = match self.query(mode::CURRENT_DATA, Some(0x00), probe_timeout).await {
            Ok(_) => self.detect_protocol().await,
            Err(ObdError::VehicleNotConnected) => {
                warn!("Adapter ready but no vehicle bus answered the probe");
                None
            }
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                warn!("Protocol probe failed: {}", e);
                None
            }
        };
        self.update_metrics(|m| m.detected_protocol = self.protocol);

        let info = HandshakeInfo {
            identity: self.identity.clone(),
            protocol: self.protocol,
            transport: self.transport.kind(),
            device_name: self.transport.device_name(),
        };
        info!(
            "OBD adapter initialized: identity={:?} protocol={:?}",
            info.identity, info.protocol
        );
        Ok(info)
    }

    async fn detect_protocol(&mut self) -> Option<ObdProtocol> {
        match self.command("ATDPN", self.config.command_timeout, None).await {
            Ok(lines) => lines.iter().find_map(|l| ObdProtocol::from_elm_number(l)),
            Err(e) => {
                warn!("Could not read detected protocol: {}", e);
                None
            }
        }
    }

    async fn expect_ok(&mut self, cmd: &str) -> Result<(), ObdError> {
        let lines = self.command(cmd, self.config.command_timeout, None).await?;
        if lines.iter().any(|l| l == "OK") {
            Ok(())
        } else {
            Err(self.fail(ObdError::InvalidResponse(format!("{} answered {:?}", cmd, lines))))
        }
    }

    /// Send a raw command and return the cleaned response lines.
    ///
    /// `timeout` overrides the configured command timeout.
    pub async fn send_command(&mut self, cmd: &str, timeout: Option<Duration>) -> Result<Vec<String>, ObdError> {
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let lines = self.command(cmd, timeout, None).await?;
        match elm::status_error(&lines, cmd) {
            Some(err) => Err(self.fail(err)),
            None => Ok(lines),
        }
    }

    /// One command/response exchange.
    ///
    /// `expect` is the mode (and PID) the answer must echo; while an earlier
    /// command is known to have timed out, prompt-terminated answers without
    /// that echo are treated as its late response and dropped.
    async fn command(
        &mut self,
        cmd: &str,
        timeout: Duration,
        expect: Option<(u8, Option<u8>)>,
    ) -> Result<Vec<String>, ObdError> {
        self.drain_stale();
        if self.link_lost || self.events.is_none() {
            return Err(self.fail(TransportError::Closed.into()));
        }

        self.update_metrics(|m| {
            m.commands_attempted += 1;
            m.last_command_at = Some(Utc::now());
        });
        metrics::counter!("obd_commands_total").increment(1);
        debug!("-> {}", cmd);

        let mut wire = cmd.as_bytes().to_vec();
        wire.push(b'\r');
        if let Err(e) = self.transport.write(&wire).await {
            return Err(self.fail(e.into()));
        }

        let deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let Some(events) = self.events.as_mut() else {
                return Err(self.fail(TransportError::Closed.into()));
            };
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    self.stale_responses += 1;
                    metrics::counter!("obd_command_timeouts_total").increment(1);
                    return Err(self.fail(ObdError::Timeout {
                        command: cmd.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }));
                }
            };

            match event {
                Some(TransportEvent::Data(data)) => {
                    buf.extend(data);
                    while let Some(pos) = buf.iter().position(|b| *b == PROMPT) {
                        let chunk: Vec<u8> = buf.drain(..=pos).collect();
                        let lines = elm::clean_lines(&String::from_utf8_lossy(&chunk), cmd);

                        if self.stale_responses > 0 {
                            let late = match expect {
                                Some((mode, pid)) => !elm::carries_echo(&lines, mode, pid),
                                None => elm::is_obd_answer(&lines),
                            };
                            self.stale_responses -= 1;
                            if late {
                                debug!("Discarding late response {:?}", lines);
                                continue;
                            }
                        }

                        debug!("<- {:?}", lines);
                        self.update_metrics(|m| m.consecutive_failures = 0);
                        return Ok(lines);
                    }
                }
                Some(TransportEvent::Error(e)) => {
                    return Err(self.fail(e.into()));
                }
                Some(TransportEvent::Closed) | None => {
                    self.link_lost = true;
                    return Err(self.fail(TransportError::Closed.into()));
                }
            }
        }
    }

    /// Drop bytes that arrived between commands
    fn drain_stale(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        loop {
            match events.try_recv() {
                Ok(TransportEvent::Data(data)) => {
                    let prompts = data.iter().filter(|b| **b == PROMPT).count() as u32;
                    self.stale_responses = self.stale_responses.saturating_sub(prompts);
                    debug!("Dropping {} stale bytes", data.len());
                }
                Ok(TransportEvent::Error(e)) => warn!("Adapter reported {} between commands", e),
                Ok(TransportEvent::Closed) => {
                    self.link_lost = true;
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => return,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.link_lost = true;
                    return;
                }
            }
        }
    }

    /// Request `mode`/`pid` and return the payload after the echo header.
    ///
    /// `NO DATA` becomes `PidNotSupported` and is not counted as a failure.
    async fn query(&mut self, mode: u8, pid: Option<u8>, timeout: Duration) -> Result<Vec<u8>, ObdError> {
        let cmd = match pid {
            Some(p) => format!("{:02X}{:02X}", mode, p),
            None => format!("{:02X}", mode),
        };
        let lines = self.command(&cmd, timeout, Some((mode, pid))).await?;
        if let Some(err) = elm::status_error(&lines, &cmd) {
            return Err(self.fail(err));
        }
        if elm::is_no_data(&lines) {
            return Err(ObdError::PidNotSupported(pid.unwrap_or(mode)));
        }
        elm::extract_payload(&lines, mode, pid).map_err(|e| self.fail(e))
    }

    /// Query a PID and return the decoded reading
    pub async fn read_pid(&mut self, pid: Pid) -> Result<LiveReading, ObdError> {
        let def = pid.definition();
        let payload = self
            .query(def.mode, Some(pid.as_hex()), self.config.command_timeout)
            .await?;
        LiveReading::decode(pid, &payload).map_err(|e| self.fail(e))
    }

    /// MIL flag and stored DTC count
    pub async fn read_status(&mut self) -> Result<VehicleStatus, ObdError> {
        let payload = self.query(mode::CURRENT_DATA, Some(0x01), self.config.command_timeout).await?;
        if payload.len() != 4 {
            return Err(self.fail(ObdError::ParseError {
                pid: 0x01,
                expected: 4,
                actual: payload.len(),
            }));
        }
        Ok(VehicleStatus {
            mil_on: payload[0] & 0x80 != 0,
            dtc_count: payload[0] & 0x7F,
        })
    }

    /// Read each PID once. PIDs the vehicle does not support are skipped;
    /// any other failure fails the whole read.
    pub async fn read_live_data(&mut self, pids: &[Pid]) -> Result<LiveData, ObdError> {
        let mut data = LiveData::default();
        for pid in pids {
            match self.read_pid(*pid).await {
                Ok(reading) => data.readings.push(reading),
                Err(ObdError::PidNotSupported(_)) => {
                    debug!("PID {} not supported by vehicle", pid);
                    data.unsupported.push(*pid);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    /// Stored trouble codes, deduplicated and sorted by code.
    ///
    /// `UNABLE TO CONNECT` means no ECU answered rather than an adapter
    /// fault, so it degrades to an empty list.
    pub async fn read_dtc(&mut self) -> Result<Vec<Dtc>, ObdError> {
        let lines = self.command("03", self.config.command_timeout, Some((mode::READ_DTC, None))).await?;
        if elm::is_no_bus(&lines) {
            warn!("No vehicle bus response to DTC request, reporting no codes");
            return Ok(Vec::new());
        }
        if let Some(err) = elm::status_error(&lines, "03") {
            return Err(self.fail(err));
        }
        if elm::is_no_data(&lines) {
            return Ok(Vec::new());
        }

        let mut raw = Vec::new();
        let mut saw_header = false;
        for frame in elm::frames(&lines) {
            if frame.first() != Some(&0x43) {
                continue;
            }
            saw_header = true;
            let mut data = &frame[1..];
            // CAN answers carry a count byte before the code pairs; guess
            // from the length while the protocol is unknown
            let counted = match self.protocol {
                Some(protocol) if protocol != ObdProtocol::Auto => protocol.is_can(),
                _ => data.len() % 2 == 1,
            };
            if counted && !data.is_empty() {
                data = &data[1..];
            }
            raw.extend(data.chunks_exact(2).filter_map(|p| decode_dtc_bytes(p[0], p[1])));
        }
        if !saw_header {
            return Err(self.fail(ObdError::InvalidResponse(format!(
                "expected header 43 in {:?}",
                lines
            ))));
        }

        let mut codes: Vec<Dtc> = dedupe_codes(raw).iter().filter_map(|c| Dtc::parse(c)).collect();
        codes.sort_by(|a, b| a.code.cmp(&b.code));
        info!("Read {} DTC(s)", codes.len());
        Ok(codes)
    }

    /// Clear stored codes. `true` once the ECU acknowledged, `false` when the
    /// acknowledgement never came.
    pub async fn clear_dtc(&mut self) -> Result<bool, ObdError> {
        let timeout = self.config.command_timeout;
        match self.query(mode::CLEAR_DTC, None, timeout).await {
            Ok(_) => {
                info!("DTCs cleared");
                Ok(true)
            }
            Err(ObdError::Timeout { .. }) | Err(ObdError::PidNotSupported(_)) => {
                warn!("Clear DTC was not acknowledged");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Vehicle identification number (mode 09 PID 02)
    pub async fn read_vin(&mut self) -> Result<String, ObdError> {
        let timeout = self.config.command_timeout * 2;
        let lines = self.command("0902", timeout, Some((mode::VEHICLE_INFO, Some(0x02)))).await?;
        if let Some(err) = elm::status_error(&lines, "0902") {
            return Err(self.fail(err));
        }

        let mut bytes = Vec::new();
        for frame in elm::frames(&lines) {
            if frame.len() > 3 && frame[0] == 0x49 && frame[1] == 0x02 {
                bytes.extend_from_slice(&frame[3..]);
            }
        }
        let vin: String = bytes
            .into_iter()
            .filter(|b| b.is_ascii_alphanumeric())
            .map(char::from)
            .collect();
        if vin.len() < 17 {
            return Err(self.fail(ObdError::InvalidResponse(format!("short VIN '{}'", vin))));
        }
        Ok(vin[vin.len() - 17..].to_string())
    }

    /// Supply voltage measured by the adapter (`ATRV`)
    pub async fn read_battery_voltage(&mut self) -> Result<f64, ObdError> {
        let lines = self.send_command("ATRV", None).await?;
        lines
            .iter()
            .find_map(|l| l.trim_end_matches(['V', 'v']).trim().parse::<f64>().ok())
            .ok_or_else(|| self.fail(ObdError::InvalidResponse(format!("ATRV answered {:?}", lines))))
    }

    /// Identity, supply voltage and MIL status in one pass. Fails only if
    /// the adapter itself stops answering.
    pub async fn self_check(&mut self) -> Result<SelfCheckReport, ObdError> {
        let identity = match self.send_command("ATI", None).await {
            Ok(lines) => lines.into_iter().next(),
            Err(e) if e.is_transport() => return Err(e),
            Err(_) => self.identity.clone(),
        };
        let battery_voltage = match self.read_battery_voltage().await {
            Ok(v) => Some(v),
            Err(e) if e.is_transport() => return Err(e),
            Err(_) => None,
        };
        let status = match self.read_status().await {
            Ok(s) => Some(s),
            Err(e) if e.is_transport() => return Err(e),
            Err(_) => None,
        };
        Ok(SelfCheckReport {
            identity,
            battery_voltage,
            protocol: self.protocol,
            status,
        })
    }

    /// Record a failed command and hand the error back
    fn fail(&self, err: ObdError) -> ObdError {
        warn!("OBD command failed: {}", err);
        self.update_metrics(|m| {
            m.commands_failed += 1;
            m.consecutive_failures += 1;
            m.last_error = Some(err.to_string());
            match &err {
                ObdError::Timeout { .. } => m.timeouts += 1,
                ObdError::ParseError { .. } | ObdError::InvalidResponse(_) => m.parse_errors += 1,
                _ => {}
            }
        });
        err
    }

    fn update_metrics(&self, f: impl FnOnce(&mut DriverMetrics)) {
        let mut guard = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// Point-in-time copy of the command counters
    pub fn metrics(&self) -> DriverMetrics {
        self.metrics.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Shared handle so owners can read metrics without locking the driver
    pub fn metrics_handle(&self) -> MetricsHandle {
        Arc::clone(&self.metrics)
    }

    /// Set command timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.command_timeout = timeout;
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.events.is_some() && !self.link_lost && self.transport.is_open()
    }

    /// Whether the link dropped underneath the driver
    pub fn link_lost(&self) -> bool {
        self.link_lost
    }

    /// Get detected protocol
    pub fn protocol(&self) -> Option<ObdProtocol> {
        self.protocol
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn device_name(&self) -> Option<String> {
        self.transport.device_name()
    }

    /// Disconnect from the OBD adapter
    pub async fn disconnect(&mut self) {
        if self.events.take().is_some() {
            info!("Disconnecting OBD client");
        }
        if let Err(e) = self.transport.close().await {
            warn!("Error closing adapter link: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedVehicle;

    fn client_for(adapter: &SimulatedAdapter) -> ObdClient {
        ObdClient::new(
            Transport::Simulated(MockTransport::new(adapter.clone())),
            ClientConfig {
                command_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    async fn connected(adapter: &SimulatedAdapter) -> ObdClient {
        let mut client = client_for(adapter);
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_handshake_sends_dialect_in_order() {
        let adapter = SimulatedAdapter::default();
        let client = connected(&adapter).await;

        assert_eq!(
            adapter.commands(),
            vec!["ATZ", "ATE0", "ATL0", "ATS1", "ATH0", "ATI", "ATSP0", "0100", "ATDPN"]
        );
        assert_eq!(client.identity(), Some("ELM327 v1.5"));
        assert_eq!(client.protocol(), Some(ObdProtocol::Iso15765_4Can11bit500));
        assert_eq!(client.metrics().detected_protocol, client.protocol());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_identify_is_not_fatal() {
        let adapter = SimulatedAdapter::default();
        adapter.override_response("ATI", "?");
        let client = connected(&adapter).await;
        assert_eq!(client.identity(), None);
        assert_eq!(client.protocol(), Some(ObdProtocol::Iso15765_4Can11bit500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_identify_is_not_fatal() {
        let adapter = SimulatedAdapter::default();
        adapter.silence("ATI");
        let mut client = client_for(&adapter);
        let info = client.connect().await.unwrap();
        assert_eq!(info.identity, None);
        assert_eq!(client.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_can_fd_restricts_negotiation() {
        let adapter = SimulatedAdapter::default();
        let mut client = ObdClient::new(
            Transport::Simulated(MockTransport::new(adapter.clone())),
            ClientConfig {
                can_fd_enabled: true,
                ..Default::default()
            },
        );
        client.connect().await.unwrap();
        assert!(adapter.commands().contains(&"ATSP6".to_string()));
        assert!(!adapter.commands().contains(&"ATSP0".to_string()));
        assert_eq!(client.protocol(), Some(ObdProtocol::Iso15765_4Can11bit500));
    }

    #[tokio::test]
    async fn test_silent_bus_still_connects() {
        let adapter = SimulatedAdapter::default();
        adapter.update_vehicle(|v| v.bus_connected = false);
        let mut client = connected(&adapter).await;
        assert_eq!(client.protocol(), None);

        // no vehicle bus: DTC read degrades to an empty list
        assert!(client.read_dtc().await.unwrap().is_empty());
        assert!(matches!(
            client.read_pid(Pid::Rpm).await,
            Err(ObdError::VehicleNotConnected)
        ));
    }

    #[tokio::test]
    async fn test_read_dtc_sorted_and_deduplicated() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0420", "P0300", "P0420"]));
        let mut client = connected(&adapter).await;
        let codes: Vec<String> = client.read_dtc().await.unwrap().into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["P0300", "P0420"]);
    }

    #[tokio::test]
    async fn test_read_dtc_multi_frame_legacy() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle {
            protocol: ObdProtocol::Iso9141_2,
            ..Default::default()
        });
        let mut client = connected(&adapter).await;
        assert_eq!(client.metrics().detected_protocol, Some(ObdProtocol::Iso9141_2));
        adapter.override_response("03", "43 01 33 00 00 00 00\r43 03 00 04 20 01 71");
        let codes: Vec<String> = client.read_dtc().await.unwrap().into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["P0133", "P0171", "P0300", "P0420"]);
    }

    #[tokio::test]
    async fn test_can_count_byte_follows_detected_protocol() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;
        // padded CAN answer: count 01, one code, trailing filler
        adapter.override_response("03", "43 01 03 00 00");
        let codes: Vec<String> = client.read_dtc().await.unwrap().into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["P0300"]);
    }

    #[tokio::test]
    async fn test_clear_then_read_is_empty() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0300", "P0420"]));
        let mut client = connected(&adapter).await;
        assert_eq!(client.read_dtc().await.unwrap().len(), 2);
        assert!(client.clear_dtc().await.unwrap());
        assert!(client.read_dtc().await.unwrap().is_empty());
        assert_eq!(client.read_status().await.unwrap(), VehicleStatus { mil_on: false, dtc_count: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_timeout_reports_false() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0300"]));
        let mut client = connected(&adapter).await;
        adapter.silence("04");
        assert!(!client.clear_dtc().await.unwrap());
        let m = client.metrics();
        assert_eq!(m.timeouts, 1);
        assert!(m.commands_failed >= 1);
    }

    #[tokio::test]
    async fn test_status_and_live_data() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0300"]));
        let mut client = connected(&adapter).await;

        let status = client.read_status().await.unwrap();
        assert!(status.mil_on);
        assert_eq!(status.dtc_count, 1);

        let data = client
            .read_live_data(&[Pid::Rpm, Pid::CoolantTemp, Pid::FuelLevel])
            .await
            .unwrap();
        assert_eq!(data.get(Pid::Rpm), Some(800.0));
        assert_eq!(data.get(Pid::CoolantTemp), Some(75.0));
        assert_eq!(data.unsupported, vec![Pid::FuelLevel]);
        assert_eq!(data.values().len(), 2);
    }

    #[tokio::test]
    async fn test_width_mismatch_fails_operation_not_driver() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;
        adapter.override_response("010C", "41 0C 1A");

        let err = client.read_pid(Pid::Rpm).await.unwrap_err();
        assert!(matches!(err, ObdError::ParseError { pid: 0x0C, expected: 2, actual: 1 }));
        assert_eq!(client.metrics().parse_errors, 1);

        // the driver keeps working
        assert_eq!(client.read_pid(Pid::Speed).await.unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn test_wrong_header_is_invalid_response() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;
        adapter.override_response("010D", "41 0C 00");
        assert!(matches!(
            client.read_pid(Pid::Speed).await,
            Err(ObdError::InvalidResponse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_and_late_response_is_not_applied() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;
        let before = client.metrics();

        adapter.delay("010C", Duration::from_millis(150));
        let err = client.read_pid(Pid::Rpm).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout { .. }));

        let m = client.metrics();
        assert_eq!(m.timeouts, before.timeouts + 1);
        assert_eq!(m.commands_failed, before.commands_failed + 1);

        // late RPM answer lands while the speed request is waiting
        adapter.delay("010D", Duration::from_millis(80));
        let reading = client.read_pid(Pid::Speed).await.unwrap();
        assert_eq!(reading.pid, Pid::Speed);
        assert_eq!(reading.value, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answers_are_not_taken_by_at_commands() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;

        // three RPM requests; the first two time out, the third gets the
        // first late answer and two more answers are still in flight
        adapter.delay("010C", Duration::from_millis(250));
        assert!(client.read_pid(Pid::Rpm).await.is_err());
        assert!(client.read_pid(Pid::Rpm).await.is_err());
        assert_eq!(client.read_pid(Pid::Rpm).await.unwrap().pid, Pid::Rpm);

        // the second late answer lands while ATRV is waiting
        tokio::time::sleep(Duration::from_millis(50)).await;
        adapter.delay("ATRV", Duration::from_millis(80));
        assert_eq!(client.read_battery_voltage().await.unwrap(), 12.6);
    }

    #[tokio::test]
    async fn test_link_drop_is_transport_error() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;
        adapter.drop_link_after(0);

        let err = client.read_pid(Pid::Rpm).await.unwrap_err();
        assert!(err.is_transport());
        assert!(client.link_lost());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_vin_and_voltage() {
        let adapter = SimulatedAdapter::default();
        let mut client = connected(&adapter).await;
        assert_eq!(client.read_vin().await.unwrap(), "1HGCM82633A004352");
        assert_eq!(client.read_battery_voltage().await.unwrap(), 12.6);

        let report = client.self_check().await.unwrap();
        assert_eq!(report.battery_voltage, Some(12.6));
        assert_eq!(report.status.map(|s| s.mil_on), Some(false));
    }

    #[tokio::test]
    async fn test_mock_client_creation() {
        let mut client = ObdClient::mock();
        assert!(!client.is_connected());
        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.disconnect().await;
        assert!(!client.is_connected());
    }
}
