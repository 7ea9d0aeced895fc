//! Service errors

use obd_connection::PoolError;
use obd_scheduler::SchedulerError;
use obd_session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Connection pool is disabled")]
    PoolDisabled,
}
