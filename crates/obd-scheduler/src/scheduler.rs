//! Polling Scheduler Implementation
//!
//! A tick advances the cycle counter by one. HIGH PIDs are read every
//! cycle, MEDIUM and LOW ones when the cycle is a multiple of 3 and 10.

use crate::error::SchedulerError;
use futures_util::FutureExt;
use obd_connection::{ConnectionError, ConnectionManager};
use obd_protocol::{LiveReading, Pid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Polling tier of a PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPriority {
    High,
    Medium,
    Low,
}

impl PollPriority {
    /// Cycles between two samples
    pub fn divisor(&self) -> u64 {
        match self {
            PollPriority::High => 1,
            PollPriority::Medium => 3,
            PollPriority::Low => 10,
        }
    }

    pub fn is_due(&self, cycle: u64) -> bool {
        cycle % self.divisor() == 0
    }

    /// Tier a PID gets when the caller does not choose one
    pub fn for_pid(pid: Pid) -> Self {
        match pid.sampling_priority() {
            p if p >= 10 => PollPriority::High,
            p if p >= 5 => PollPriority::Medium,
            _ => PollPriority::Low,
        }
    }
}

impl fmt::Display for PollPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollPriority::High => "high",
            PollPriority::Medium => "medium",
            PollPriority::Low => "low",
        })
    }
}

/// Configuration for the polling scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between two cycles
    pub tick: Duration,
    /// Change between consecutive readings that escalates a PID to HIGH
    pub escalation_threshold: f64,
    /// How long an escalated PID stays HIGH
    pub escalation_cooldown: Duration,
    /// Readings buffered per subscriber
    pub reading_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            escalation_threshold: 10.0,
            escalation_cooldown: Duration::from_secs(10),
            reading_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.tick.is_zero() {
            return Err(SchedulerError::InvalidConfig("tick must be non-zero".into()));
        }
        if self.escalation_threshold.is_nan() || self.escalation_threshold < 0.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "escalation threshold {} must be a non-negative number",
                self.escalation_threshold
            )));
        }
        if self.reading_buffer == 0 {
            return Err(SchedulerError::InvalidConfig("reading buffer must be non-zero".into()));
        }
        Ok(())
    }
}

/// A PID to poll and its base tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollTarget {
    pub pid: Pid,
    pub priority: PollPriority,
    /// Overrides the configured escalation threshold for this PID
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl PollTarget {
    pub fn new(pid: Pid, priority: PollPriority) -> Self {
        Self {
            pid,
            priority,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Target from a PID name (`rpm`) or hex code (`0C`)
    pub fn parse(pid: &str, priority: PollPriority) -> Result<Self, SchedulerError> {
        let pid = pid
            .parse::<Pid>()
            .map_err(|_| SchedulerError::UnknownPid(pid.to_string()))?;
        Ok(Self::new(pid, priority))
    }
}

/// Running statistics for one PID
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PidStats {
    pub polls: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
    pub last_value: Option<f64>,
    pub last_error: Option<String>,
}

impl PidStats {
    fn record(&mut self, latency: Duration, outcome: Result<f64, String>) {
        self.polls += 1;
        let ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (ms - self.average_latency_ms) / self.polls as f64;
        match outcome {
            Ok(value) => {
                self.successes += 1;
                self.last_value = Some(value);
            }
            Err(error) => {
                self.failures += 1;
                self.last_error = Some(error);
            }
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// PIDs read this cycle, in read order
    pub sampled: Vec<Pid>,
    pub readings: usize,
    pub failures: usize,
}

struct Entry {
    target: PollTarget,
    escalated_until: Option<Instant>,
    stats: PidStats,
}

impl Entry {
    fn priority(&mut self, now: Instant) -> PollPriority {
        match self.escalated_until {
            Some(until) if now < until => PollPriority::High,
            Some(_) => {
                debug!("PID {} back to {}", self.target.pid, self.target.priority);
                self.escalated_until = None;
                self.target.priority
            }
            None => self.target.priority,
        }
    }
}

struct State {
    entries: BTreeMap<Pid, Entry>,
    cycle: u64,
}

struct Shared {
    connection: Arc<ConnectionManager>,
    config: SchedulerConfig,
    state: Mutex<State>,
    readings: broadcast::Sender<LiveReading>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the counter and pick the PIDs due in the new cycle
    fn plan(&self) -> (u64, Vec<Pid>) {
        let mut state = self.lock();
        state.cycle += 1;
        let cycle = state.cycle;
        let now = Instant::now();
        let due = state
            .entries
            .values_mut()
            .filter_map(|e| e.priority(now).is_due(cycle).then_some(e.target.pid))
            .collect();
        (cycle, due)
    }

    async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let (cycle, due) = self.plan();
        let state = self.connection.state();
        if !state.has_driver() {
            return Err(SchedulerError::NotConnected { state });
        }

        let mut report = CycleReport {
            cycle,
            sampled: Vec::with_capacity(due.len()),
            readings: 0,
            failures: 0,
        };
        for pid in due {
            let started = Instant::now();
            let result = self.connection.with_driver(move |d| d.read_pid(pid).boxed()).await;
            let latency = started.elapsed();
            report.sampled.push(pid);

            match result {
                Ok(reading) => {
                    report.readings += 1;
                    metrics::counter!("obd_poll_total", "outcome" => "success").increment(1);
                    self.record_reading(&reading, latency);
                    // no subscribers is fine
                    let _ = self.readings.send(reading);
                }
                Err(e) => {
                    report.failures += 1;
                    metrics::counter!("obd_poll_total", "outcome" => "failure").increment(1);
                    self.record_failure(pid, latency, &e);
                    if e.is_link_failure() || matches!(e, ConnectionError::NotConnected { .. }) {
                        warn!("Adapter lost during poll cycle {}, skipping remaining PIDs", cycle);
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    fn record_reading(&self, reading: &LiveReading, latency: Duration) {
        let threshold = self.config.escalation_threshold;
        let cooldown = self.config.escalation_cooldown;
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&reading.pid) else {
            return;
        };

        if let Some(previous) = entry.stats.last_value {
            let delta = (reading.value - previous).abs();
            let limit = entry.target.threshold.unwrap_or(threshold);
            if delta > limit && entry.target.priority != PollPriority::High {
                if entry.escalated_until.is_none() {
                    info!(
                        "PID {} changed by {:.2} (> {:.2}), escalating to high",
                        reading.pid, delta, limit
                    );
                }
                entry.escalated_until = Some(Instant::now() + cooldown);
            }
        }
        entry.stats.record(latency, Ok(reading.value));
    }

    fn record_failure(&self, pid: Pid, latency: Duration, error: &ConnectionError) {
        debug!("Poll of PID {} failed: {}", pid, error);
        if let Some(entry) = self.lock().entries.get_mut(&pid) {
            entry.stats.record(latency, Err(error.to_string()));
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls live data through a [`ConnectionManager`] on a fixed tick
pub struct PollingScheduler {
    shared: Arc<Shared>,
    task: Mutex<Option<Running>>,
}

impl PollingScheduler {
    pub fn new(connection: Arc<ConnectionManager>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (readings, _) = broadcast::channel(config.reading_buffer);
        Ok(Self {
            shared: Arc::new(Shared {
                connection,
                config,
                state: Mutex::new(State {
                    entries: BTreeMap::new(),
                    cycle: 0,
                }),
                readings,
            }),
            task: Mutex::new(None),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_pid(&self, pid: Pid, priority: PollPriority) {
        self.add_target(PollTarget::new(pid, priority));
    }

    /// Add a PID, or change the tier of one already polled. Applies from
    /// the next cycle.
    pub fn add_target(&self, target: PollTarget) {
        let mut state = self.shared.lock();
        match state.entries.get_mut(&target.pid) {
            Some(entry) => {
                debug!("PID {} now {}", target.pid, target.priority);
                entry.target = target;
            }
            None => {
                debug!("Polling PID {} at {}", target.pid, target.priority);
                state.entries.insert(
                    target.pid,
                    Entry {
                        target,
                        escalated_until: None,
                        stats: PidStats::default(),
                    },
                );
            }
        }
    }

    /// Stop polling `pid` from the next cycle. Its statistics go with it.
    pub fn remove_pid(&self, pid: Pid) -> bool {
        self.shared.lock().entries.remove(&pid).is_some()
    }

    pub fn targets(&self) -> Vec<PollTarget> {
        self.shared.lock().entries.values().map(|e| e.target).collect()
    }

    /// Tier the PID would be polled at right now
    pub fn effective_priority(&self, pid: Pid) -> Option<PollPriority> {
        let now = Instant::now();
        self.shared.lock().entries.get_mut(&pid).map(|e| e.priority(now))
    }

    pub fn stats(&self) -> BTreeMap<Pid, PidStats> {
        self.shared
            .lock()
            .entries
            .iter()
            .map(|(pid, e)| (*pid, e.stats.clone()))
            .collect()
    }

    pub fn cycle(&self) -> u64 {
        self.shared.lock().cycle
    }

    /// Readings from every successful poll from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LiveReading> {
        self.shared.readings.subscribe()
    }

    /// Run one cycle now, outside the tick
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        self.shared.run_cycle().await
    }

    pub fn is_running(&self) -> bool {
        self.running().as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the polling task. Returns false when it is already running.
    pub fn start(&self) -> bool {
        let mut task = self.running();
        if task.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        info!("Starting polling every {:?}", shared.config.tick);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stopped.changed() => break,
                }
                match shared.run_cycle().await {
                    Ok(report) => debug!(
                        "Poll cycle {}: {} reading(s), {} failure(s)",
                        report.cycle, report.readings, report.failures
                    ),
                    Err(e) => debug!("Poll cycle skipped: {}", e),
                }
            }
            info!("Polling stopped");
        });
        *task = Some(Running { stop, handle });
        true
    }

    /// Stop the polling task after its current cycle. Returns false when
    /// it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running().take() else {
            return false;
        };
        let was_running = !running.handle.is_finished();
        let _ = running.stop.send(true);
        if let Err(e) = running.handle.await {
            warn!("Polling task ended abnormally: {}", e);
        }
        was_running
    }
}
