//! Kiosk Diagnostics Service
//!
//! Configuration, logging and the service facade the kiosk's API layer
//! talks to.

mod config;
mod error;
mod service;

pub use config::{
    AdapterMode, AdapterSettings, DiagConfig, LoggingSettings, OperationSettings, PollEntry, PollingSettings,
    PoolSettings, ReconnectSettings,
};
pub use error::{ConfigError, ServiceError};
pub use service::{ConnectRequest, ConnectResult, DiagnosticService, OperationResponse};

use tracing_subscriber::EnvFilter;

/// Initialize logging. RUST_LOG takes precedence over the configured level.
/// Later calls are no-ops.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
