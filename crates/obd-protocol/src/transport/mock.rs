//! Simulated ELM327 adapter
//!
//! Emulates the adapter's AT dialect in front of a virtual vehicle so the
//! whole stack can run without hardware. Faults (silence, late answers,
//! malformed payloads, link loss) can be injected per command.

use super::{TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::dtc::encode_dtc_bytes;
use crate::error::TransportError;
use crate::pid::Pid;
use crate::protocol::ObdProtocol;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const ADAPTER_ID: &str = "ELM327 v1.5";

/// State of the virtual vehicle behind the simulated adapter
#[derive(Debug, Clone)]
pub struct SimulatedVehicle {
    /// Stored trouble codes, in the order the ECU reports them
    pub dtcs: Vec<String>,
    /// Raw payload bytes answered for each supported PID
    pub sensors: HashMap<Pid, Vec<u8>>,
    /// Whether an ECU answers on the bus (ignition on)
    pub bus_connected: bool,
    /// Protocol the ECU speaks
    pub protocol: ObdProtocol,
    pub vin: String,
    pub battery_voltage: f64,
}

impl Default for SimulatedVehicle {
    fn default() -> Self {
        let sensors = HashMap::from([
            (Pid::EngineLoad, vec![0x40]),
            (Pid::CoolantTemp, vec![0x73]),
            (Pid::ShortFuelTrim, vec![0x80]),
            (Pid::LongFuelTrim, vec![0x82]),
            (Pid::IntakeManifoldPressure, vec![0x21]),
            (Pid::Rpm, vec![0x0C, 0x80]),
            (Pid::Speed, vec![0x00]),
            (Pid::TimingAdvance, vec![0x8C]),
            (Pid::IntakeAirTemp, vec![0x41]),
            (Pid::Maf, vec![0x01, 0x90]),
            (Pid::ThrottlePosition, vec![0x26]),
            (Pid::O2Voltage, vec![0x5A, 0x80]),
            (Pid::ControlModuleVoltage, vec![0x31, 0x38]),
        ]);
        Self {
            dtcs: Vec::new(),
            sensors,
            bus_connected: true,
            protocol: ObdProtocol::Iso15765_4Can11bit500,
            vin: "1HGCM82633A004352".to_string(),
            battery_voltage: 12.6,
        }
    }
}

impl SimulatedVehicle {
    /// Vehicle with the given stored codes and default sensors
    pub fn with_dtcs<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dtcs: codes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    silent: HashSet<String>,
    delays: HashMap<String, Duration>,
    overrides: HashMap<String, String>,
    fail_open: Option<TransportError>,
    drop_after_writes: Option<usize>,
}

#[derive(Debug)]
struct SimState {
    vehicle: SimulatedVehicle,
    faults: FaultPlan,
    echo: bool,
    spaces: bool,
    protocol_setting: ObdProtocol,
    negotiated: Option<ObdProtocol>,
    log: Vec<String>,
    opens: usize,
}

/// Shared handle on a simulated adapter.
///
/// Clones share the same vehicle and fault plan, so a test can keep a handle
/// while transports built from it are owned by drivers.
#[derive(Clone)]
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
}

impl fmt::Debug for SimulatedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedAdapter").finish_non_exhaustive()
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new(SimulatedVehicle::default())
    }
}

impl SimulatedAdapter {
    pub fn new(vehicle: SimulatedVehicle) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                vehicle,
                faults: FaultPlan::default(),
                echo: true,
                spaces: true,
                protocol_setting: ObdProtocol::Auto,
                negotiated: None,
                log: Vec::new(),
                opens: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the virtual vehicle
    pub fn update_vehicle(&self, f: impl FnOnce(&mut SimulatedVehicle)) {
        f(&mut self.lock().vehicle);
    }

    /// Snapshot of the virtual vehicle
    pub fn vehicle(&self) -> SimulatedVehicle {
        self.lock().vehicle.clone()
    }

    /// Never answer the given command
    pub fn silence(&self, command: &str) {
        self.lock().faults.silent.insert(command.to_string());
    }

    /// Answer the given command only after `delay`
    pub fn delay(&self, command: &str, delay: Duration) {
        self.lock().faults.delays.insert(command.to_string(), delay);
    }

    /// Answer the given command with a fixed body instead of emulating it
    pub fn override_response(&self, command: &str, body: &str) {
        self.lock()
            .faults
            .overrides
            .insert(command.to_string(), body.to_string());
    }

    /// Make every subsequent `open` fail
    pub fn fail_open(&self, error: TransportError) {
        self.lock().faults.fail_open = Some(error);
    }

    /// Close the link once this many more commands have been written
    pub fn drop_link_after(&self, writes: usize) {
        self.lock().faults.drop_after_writes = Some(writes);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        self.lock().faults = FaultPlan::default();
    }

    /// Commands received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Number of times a transport opened this adapter
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Full framed answer (echo, body, prompt) for one command
    fn frame_response(&self, command: &str) -> String {
        let mut state = self.lock();
        let echo = state.echo;
        let overridden = state.faults.overrides.get(command).cloned();
        let body = match overridden {
            Some(body) => body,
            None => emulate(&mut state, command),
        };
        let body = if state.spaces { body } else { body.replace(' ', "") };
        if echo {
            format!("{}\r{}\r\r>", command, body)
        } else {
            format!("{}\r\r>", body)
        }
    }
}

fn emulate(state: &mut SimState, command: &str) -> String {
    let cmd = command.to_ascii_uppercase();
    if let Some(at) = cmd.strip_prefix("AT") {
        return emulate_at(state, at);
    }

    let Some(bytes) = crate::elm::hex_bytes(&cmd) else {
        return "?".to_string();
    };
    if !state.vehicle.bus_connected {
        return "SEARCHING...\rUNABLE TO CONNECT".to_string();
    }
    let searching = state.negotiated.is_none();
    if searching {
        state.negotiated = Some(match state.protocol_setting {
            ObdProtocol::Auto => state.vehicle.protocol,
            other => other,
        });
    }
    let prefix = if searching { "SEARCHING...\r" } else { "" };

    let vehicle = &mut state.vehicle;
    let is_can = vehicle.protocol.is_can();
    let body = match bytes.as_slice() {
        [0x01, 0x00] => "41 00 BE 3F B8 13".to_string(),
        [0x01, 0x01] => {
            let mil = if vehicle.dtcs.is_empty() { 0 } else { 0x80 };
            let count = vehicle.dtcs.len().min(0x7F) as u8;
            format!("41 01 {:02X} 07 E5 00", mil | count)
        }
        [0x01, pid] => match Pid::from_hex(*pid).and_then(|p| vehicle.sensors.get(&p)) {
            Some(data) => {
                let mut frame = vec![0x41, *pid];
                frame.extend_from_slice(data);
                hex_line(&frame)
            }
            None => "NO DATA".to_string(),
        },
        [0x03] => {
            let mut payload = vec![0x43];
            if is_can {
                payload.push(vehicle.dtcs.len() as u8);
            }
            for code in &vehicle.dtcs {
                if let Some((b1, b2)) = encode_dtc_bytes(code) {
                    payload.extend([b1, b2]);
                }
            }
            if !is_can {
                while payload.len() < 7 {
                    payload.push(0x00);
                }
            }
            framed(&payload)
        }
        [0x04] => {
            vehicle.dtcs.clear();
            "44".to_string()
        }
        [0x09, 0x02] => {
            let mut payload = vec![0x49, 0x02, 0x01];
            payload.extend(vehicle.vin.bytes());
            framed(&payload)
        }
        _ => "NO DATA".to_string(),
    };
    format!("{}{}", prefix, body)
}

fn emulate_at(state: &mut SimState, at: &str) -> String {
    match at {
        "Z" => {
            state.echo = true;
            state.spaces = true;
            state.protocol_setting = ObdProtocol::Auto;
            state.negotiated = None;
            format!("\r{}", ADAPTER_ID)
        }
        "I" => ADAPTER_ID.to_string(),
        "@1" => "OBDII to RS232 Interpreter".to_string(),
        "E0" | "E1" => {
            state.echo = at == "E1";
            "OK".to_string()
        }
        "S0" | "S1" => {
            state.spaces = at == "S1";
            "OK".to_string()
        }
        "L0" | "L1" | "H0" | "H1" | "AT1" | "AT2" => "OK".to_string(),
        "RV" => format!("{:.1}V", state.vehicle.battery_voltage),
        "DPN" => match state.negotiated {
            Some(p) if state.protocol_setting == ObdProtocol::Auto => {
                format!("A{}", &p.to_elm_command()[4..])
            }
            Some(p) => p.to_elm_command()[4..].to_string(),
            None => state.protocol_setting.to_elm_command()[4..].to_string(),
        },
        sp if sp.starts_with("SP") => {
            match crate::protocol::ObdProtocol::from_elm_number(&sp[2..]) {
                Some(p) => {
                    state.protocol_setting = p;
                    state.negotiated = None;
                    "OK".to_string()
                }
                None => "?".to_string(),
            }
        }
        _ => "?".to_string(),
    }
}

fn hex_line(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single line when it fits a CAN frame, ISO-TP segments otherwise
fn framed(payload: &[u8]) -> String {
    if payload.len() <= 7 {
        return hex_line(payload);
    }
    let mut lines = vec![format!("{:03X}", payload.len())];
    let mut rest = payload;
    let mut index = 0;
    while !rest.is_empty() {
        let take = (if index == 0 { 6 } else { 7 }).min(rest.len());
        lines.push(format!("{:X}: {}", index % 16, hex_line(&rest[..take])));
        rest = &rest[take..];
        index += 1;
    }
    lines.join("\r")
}

/// Transport talking to a [`SimulatedAdapter`]
pub struct MockTransport {
    adapter: SimulatedAdapter,
    tx: Option<mpsc::Sender<TransportEvent>>,
    pending: String,
}

impl MockTransport {
    pub fn new(adapter: SimulatedAdapter) -> Self {
        Self {
            adapter,
            tx: None,
            pending: String::new(),
        }
    }

    pub async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        {
            let mut state = self.adapter.lock();
            if let Some(err) = state.faults.fail_open.clone() {
                return Err(err);
            }
            state.opens += 1;
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.tx = Some(tx);
        self.pending.clear();
        Ok(rx)
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(tx) = self.tx.clone() else {
            return Err(TransportError::Closed);
        };
        self.pending.push_str(&String::from_utf8_lossy(bytes));

        while let Some(end) = self.pending.find('\r') {
            let command: String = self.pending.drain(..=end).collect();
            let command = command.trim().to_string();
            if command.is_empty() {
                continue;
            }

            let (silent, delay, drop_link) = {
                let mut state = self.adapter.lock();
                state.log.push(command.clone());
                let drop_link = match state.faults.drop_after_writes.as_mut() {
                    Some(0) => true,
                    Some(n) => {
                        *n -= 1;
                        false
                    }
                    None => false,
                };
                (
                    state.faults.silent.contains(&command),
                    state.faults.delays.get(&command).copied(),
                    drop_link,
                )
            };

            if drop_link {
                debug!("Simulated adapter dropping link on {}", command);
                let _ = tx.send(TransportEvent::Closed).await;
                self.tx = None;
                return Ok(());
            }
            if silent {
                continue;
            }

            let response = self.adapter.frame_response(&command).into_bytes();
            match delay {
                Some(d) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let _ = tx.send(TransportEvent::Data(response)).await;
                    });
                }
                None => {
                    // deliver in two chunks like a real UART would
                    let mid = response.len() / 2;
                    let _ = tx.send(TransportEvent::Data(response[..mid].to_vec())).await;
                    let _ = tx.send(TransportEvent::Data(response[mid..].to_vec())).await;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.pending.clear();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reports_mil_and_count() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0300", "P0420"]));
        let out = adapter.frame_response("0101");
        assert!(out.contains("41 01 82"), "{out}");
    }

    #[test]
    fn test_dtc_response_on_can_carries_count() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0300", "P0420"]));
        adapter.frame_response("ATE0");
        let out = adapter.frame_response("03");
        assert!(out.contains("43 02 03 00 04 20"), "{out}");
    }

    #[test]
    fn test_long_payload_is_segmented() {
        let framed = framed(&[0x49, 0x02, 0x01, 1, 2, 3, 4, 5, 6]);
        assert_eq!(framed, "009\r0: 49 02 01 01 02 03\r1: 04 05 06");
    }

    #[tokio::test]
    async fn test_transport_answers_with_prompt() {
        let adapter = SimulatedAdapter::default();
        let mut transport = MockTransport::new(adapter.clone());
        let mut rx = transport.open().await.unwrap();
        transport.write(b"ATI\r").await.unwrap();

        let mut received = Vec::new();
        while !received.contains(&b'>') {
            match rx.recv().await {
                Some(TransportEvent::Data(d)) => received.extend(d),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(String::from_utf8_lossy(&received).contains(ADAPTER_ID));
        assert_eq!(adapter.commands(), vec!["ATI"]);
    }

    #[tokio::test]
    async fn test_open_failure_injection() {
        let adapter = SimulatedAdapter::default();
        adapter.fail_open(TransportError::DeviceNotFound("sim".into()));
        let mut transport = MockTransport::new(adapter);
        assert!(matches!(
            transport.open().await,
            Err(TransportError::DeviceNotFound(_))
        ));
    }
}
