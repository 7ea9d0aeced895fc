//! Service configuration
//!
//! Loaded from an optional file plus `OBD_KIOSK__*` environment variables,
//! e.g. `OBD_KIOSK__POOL__MAX_CONNECTIONS=4`. Every field has a default.

use crate::error::ConfigError;
use obd_connection::{PoolConfig, ReconnectPolicy};
use obd_protocol::{BleConfig, ClientConfig, SerialConfig, SimulatedAdapter, TransportConfig};
use obd_scheduler::{PollPriority, PollTarget, SchedulerConfig};
use obd_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "OBD_KIOSK";

/// Adapter link, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    #[default]
    Serial,
    Ble,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub mode: AdapterMode,
    pub serial_path: String,
    pub baud_rate: u32,
    /// BLE advertised-name filter
    pub device_name: String,
    pub scan_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub can_fd_enabled: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        let serial = SerialConfig::default();
        Self {
            mode: AdapterMode::Serial,
            serial_path: serial.path,
            baud_rate: serial.baud_rate,
            device_name: BleConfig::default().name_filter,
            scan_timeout_ms: 10_000,
            command_timeout_ms: 2_000,
            connect_timeout_ms: 20_000,
            can_fd_enabled: false,
        }
    }
}

impl AdapterSettings {
    /// Link for `mode`; simulated links share `simulator`
    pub fn transport(&self, mode: AdapterMode, device_name: Option<&str>, simulator: &SimulatedAdapter) -> TransportConfig {
        match mode {
            AdapterMode::Serial => TransportConfig::Serial(SerialConfig {
                path: self.serial_path.clone(),
                baud_rate: self.baud_rate,
            }),
            AdapterMode::Ble => TransportConfig::Ble(BleConfig {
                name_filter: device_name.unwrap_or(&self.device_name).to_string(),
                scan_timeout: Duration::from_millis(self.scan_timeout_ms),
                ..Default::default()
            }),
            AdapterMode::Simulated => TransportConfig::Simulated(simulator.clone()),
        }
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            can_fd_enabled: self.can_fd_enabled,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Serve per-vehicle reads from a pool of adapters
    pub enabled: bool,
    pub max_connections: usize,
    pub max_failures: u32,
    pub health_check_interval_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_connections: 4,
            max_failures: 3,
            health_check_interval_ms: 30_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub insight_window: Option<usize>,
    pub max_timeline_events: usize,
    /// Events kept by the history sink; 0 disables history
    pub history_records: usize,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 250,
            insight_window: None,
            max_timeline_events: 10_000,
            history_records: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
        }
    }
}

/// One polled PID, by name or hex code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollEntry {
    pub pid: String,
    pub priority: PollPriority,
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl PollEntry {
    fn new(pid: &str, priority: PollPriority) -> Self {
        Self {
            pid: pid.to_string(),
            priority,
            threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub tick_ms: u64,
    pub escalation_threshold: f64,
    pub escalation_cooldown_ms: u64,
    pub pids: Vec<PollEntry>,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            escalation_threshold: 10.0,
            escalation_cooldown_ms: 10_000,
            pids: vec![
                PollEntry::new("rpm", PollPriority::High),
                PollEntry::new("speed", PollPriority::High),
                PollEntry::new("engine_load", PollPriority::Medium),
                PollEntry::new("coolant_temp", PollPriority::Low),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagConfig {
    pub adapter: AdapterSettings,
    pub pool: PoolSettings,
    pub operations: OperationSettings,
    pub reconnect: ReconnectSettings,
    pub polling: PollingSettings,
    pub logging: LoggingSettings,
    /// Prometheus scrape endpoint; none disables the exporter
    pub metrics_listen: Option<SocketAddr>,
}

impl DiagConfig {
    /// Load from `path` (when given) overlaid with environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        Self::finish(builder)
    }

    /// Parse a TOML document; the environment is not consulted
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Self::finish(config::Config::builder().add_source(config::File::from_str(source, config::FileFormat::Toml)))
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self, ConfigError> {
        let config: DiagConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid("pool.max_connections must be at least 1".into()));
        }
        if self.operations.attempts == 0 {
            return Err(ConfigError::Invalid("operations.attempts must be at least 1".into()));
        }
        if self.adapter.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("adapter.command_timeout_ms must be non-zero".into()));
        }
        self.scheduler().validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.poll_targets()?;
        Ok(())
    }

    pub fn poll_targets(&self) -> Result<Vec<PollTarget>, ConfigError> {
        self.polling
            .pids
            .iter()
            .map(|entry| {
                let target = PollTarget::parse(&entry.pid, entry.priority)
                    .map_err(|e| ConfigError::Invalid(format!("polling.pids: {}", e)))?;
                Ok(match entry.threshold {
                    Some(threshold) => target.with_threshold(threshold),
                    None => target,
                })
            })
            .collect()
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.polling.tick_ms),
            escalation_threshold: self.polling.escalation_threshold,
            escalation_cooldown: Duration::from_millis(self.polling.escalation_cooldown_ms),
            ..Default::default()
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            attempts: self.operations.attempts,
            base_delay: Duration::from_millis(self.operations.base_delay_ms),
            max_timeline_events: self.operations.max_timeline_events,
            insight_window: self.operations.insight_window,
            ..Default::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.pool.max_connections,
            max_failures: self.pool.max_failures,
            health_check_interval: Duration::from_millis(self.pool.health_check_interval_ms),
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            reconnect: self.reconnect_policy(),
        }
    }
}
