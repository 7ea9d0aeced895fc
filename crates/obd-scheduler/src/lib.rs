//! OBD-II Polling Scheduler
//!
//! Samples a caller-selected set of PIDs on priority tiers, escalating a
//! PID to every cycle while its value is moving.

mod error;
mod scheduler;

pub use error::SchedulerError;
pub use scheduler::{CycleReport, PidStats, PollPriority, PollTarget, PollingScheduler, SchedulerConfig};
