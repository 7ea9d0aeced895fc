//! Diagnostic Session Manager
//!
//! Runs one operation at a time against a connection: retries with linear
//! backoff, records every attempt and state change on the timeline, and
//! keeps per-kind metrics. Concurrent callers queue on a fair async mutex
//! and run in arrival order.

use crate::error::SessionError;
use crate::history::{EventSink, HistoryStatus};
use crate::insights::{compute_insights, Insights};
use crate::timeline::{
    OperationEvent, OperationKind, Outcome, StateChangeEvent, Timeline, TimelineEntry, TimelineEvent, TimelineQuery,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use obd_connection::{ConnectionManager, ConnectionSnapshot, StateTransition};
use obd_protocol::{Dtc, LiveData, Pid, SelfCheckReport, VehicleStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Session defaults
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub attempts: u32,
    /// Delay unit of the linear backoff
    pub base_delay: Duration,
    pub max_timeline_events: usize,
    /// Events considered by [`SessionManager::get_insights`] when no window is given
    pub insight_window: Option<usize>,
    pub recent_failures: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_timeline_events: 10_000,
            insight_window: None,
            recent_failures: 5,
        }
    }
}

type SuccessSummary<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type FailureSummary = Box<dyn Fn(&anyhow::Error) -> String + Send + Sync>;

/// Per-call overrides for [`SessionManager::run_operation`]
pub struct OperationOptions<T> {
    pub attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    /// Attach a connection snapshot to each attempt event
    pub capture_snapshot: bool,
    pub summarize_success: Option<SuccessSummary<T>>,
    pub summarize_failure: Option<FailureSummary>,
}

impl<T> Default for OperationOptions<T> {
    fn default() -> Self {
        Self {
            attempts: None,
            base_delay: None,
            capture_snapshot: false,
            summarize_success: None,
            summarize_failure: None,
        }
    }
}

impl<T> OperationOptions<T> {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn capture_snapshot(mut self) -> Self {
        self.capture_snapshot = true;
        self
    }

    pub fn summarize_success(mut self, f: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.summarize_success = Some(Box::new(f));
        self
    }

    pub fn summarize_failure(mut self, f: impl Fn(&anyhow::Error) -> String + Send + Sync + 'static) -> Self {
        self.summarize_failure = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KindStats {
    successes: u64,
    failures: u64,
    total_duration_ms: u64,
}

/// Whole-operation counters for one kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub successes: u64,
    pub failures: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub operations: BTreeMap<OperationKind, OperationStats>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub timeline_events: usize,
    pub connection: ConnectionSnapshot,
}

struct SessionState {
    timeline: Timeline,
    stats: HashMap<OperationKind, KindStats>,
    last_error: Option<String>,
    transitions: mpsc::UnboundedReceiver<StateTransition>,
}

/// Leaves the active-operation state when the operation future is dropped
/// before it finishes
struct ActiveOperation<'a> {
    session: &'a SessionManager,
    kind: OperationKind,
    armed: bool,
}

impl ActiveOperation<'_> {
    fn end(mut self, reason: &str) {
        self.armed = false;
        self.session.connection.end_operation(reason);
        self.session.append(None);
    }
}

impl Drop for ActiveOperation<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("{} cancelled before completion", self.kind);
            self.session.connection.end_operation(&format!("{} cancelled", self.kind));
            self.session.append(None);
        }
    }
}

/// Supervises diagnostic operations on one connection
pub struct SessionManager {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    connection: Arc<ConnectionManager>,
    config: SessionConfig,
    sink: Option<Arc<dyn EventSink>>,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(connection: Arc<ConnectionManager>, config: SessionConfig, sink: Option<Arc<dyn EventSink>>) -> Self {
        let session_id = Uuid::new_v4();
        info!("Starting diagnostic session {}", session_id);
        let transitions = connection.subscribe();
        Self {
            session_id,
            started_at: Utc::now(),
            state: Mutex::new(SessionState {
                timeline: Timeline::new(config.max_timeline_events),
                stats: HashMap::new(),
                last_error: None,
                transitions,
            }),
            connection,
            config,
            sink,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Move pending state transitions onto the timeline, then append `entry`
    fn append(&self, entry: Option<TimelineEntry>) {
        let recorded: Vec<TimelineEvent> = {
            let mut state = self.lock();
            let mut recorded = Vec::new();
            while let Ok(t) = state.transitions.try_recv() {
                let at = t.at;
                recorded.push(state.timeline.push(at, TimelineEntry::StateChange(StateChangeEvent::from(t))));
            }
            if let Some(entry) = entry {
                recorded.push(state.timeline.push(Utc::now(), entry));
            }
            recorded
        };

        if let Some(sink) = &self.sink {
            for event in &recorded {
                if let Err(e) = sink.record(self.session_id, event) {
                    warn!("Failed to forward event {} to history: {}", event.id, e);
                }
            }
        }
    }

    fn finish(&self, kind: OperationKind, outcome: Outcome, elapsed: Duration, error: Option<String>) {
        let ms = elapsed.as_millis() as u64;
        let label = match outcome {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        };
        metrics::counter!("obd_operations_total", "kind" => kind.as_str(), "outcome" => label).increment(1);
        metrics::histogram!("obd_operation_duration_ms", "kind" => kind.as_str()).record(ms as f64);

        let mut state = self.lock();
        let stats = state.stats.entry(kind).or_default();
        stats.total_duration_ms += ms;
        match outcome {
            Outcome::Success => stats.successes += 1,
            Outcome::Failure => stats.failures += 1,
        }
        if error.is_some() {
            state.last_error = error;
        }
    }

    /// Run `task` as a supervised operation.
    ///
    /// `task` receives the 1-based attempt number. Attempt `n` that fails is
    /// followed by a `base_delay * n` pause. Only the final error is
    /// returned. Callers arriving while an operation runs wait their turn.
    pub async fn run_operation<T, F, Fut>(
        &self,
        kind: OperationKind,
        options: OperationOptions<T>,
        mut task: F,
    ) -> Result<T, SessionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _turn = self.gate.lock().await;
        let attempts = options.attempts.unwrap_or(self.config.attempts).max(1);
        let base_delay = options.base_delay.unwrap_or(self.config.base_delay);

        if let Err(source) = self.connection.begin_operation(kind.activity(), kind.as_str()) {
            self.append(None);
            return Err(SessionError::InvalidState { kind, source });
        }
        self.append(None);
        let active = ActiveOperation {
            session: self,
            kind,
            armed: true,
        };

        let started = Instant::now();
        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let result = task(attempt).await;
            let duration_ms = attempt_started.elapsed().as_millis() as u64;
            let snapshot = options.capture_snapshot.then(|| self.connection.snapshot());

            match result {
                Ok(value) => {
                    let summary = options.summarize_success.as_ref().map(|f| f(&value));
                    self.append(Some(TimelineEntry::Operation(OperationEvent {
                        kind,
                        attempt,
                        attempts,
                        outcome: Outcome::Success,
                        duration_ms,
                        summary,
                        error: None,
                        snapshot,
                    })));
                    self.finish(kind, Outcome::Success, started.elapsed(), None);
                    active.end(&format!("{} complete", kind));
                    return Ok(value);
                }
                Err(err) => {
                    let message = match &options.summarize_failure {
                        Some(f) => f(&err),
                        None => format!("{:#}", err),
                    };
                    warn!("{} attempt {}/{} failed: {}", kind, attempt, attempts, message);
                    // a lost adapter ends the operation; the event then
                    // reports the attempts actually made
                    let last = attempt >= attempts || !self.connection.state().is_busy();
                    self.append(Some(TimelineEntry::Operation(OperationEvent {
                        kind,
                        attempt,
                        attempts: if last { attempt } else { attempts },
                        outcome: Outcome::Failure,
                        duration_ms,
                        summary: None,
                        error: Some(message),
                        snapshot,
                    })));
                    if last {
                        break err;
                    }
                    tokio::time::sleep(base_delay * attempt).await;
                }
            }
        };

        self.finish(kind, Outcome::Failure, started.elapsed(), Some(format!("{:#}", error)));
        active.end(&format!("{} failed", kind));
        Err(SessionError::Exhausted {
            kind,
            attempts: attempt,
            error,
        })
    }

    /// Read stored trouble codes
    pub async fn read_dtc(&self) -> Result<Vec<Dtc>, SessionError> {
        let options = OperationOptions::default()
            .summarize_success(|codes: &Vec<Dtc>| {
                let list: Vec<&str> = codes.iter().map(|d| d.code.as_str()).collect();
                format!("{} code(s): [{}]", codes.len(), list.join(", "))
            });
        self.run_operation(OperationKind::ReadDtc, options, |_| async move {
            Ok(self.connection.with_driver(|d| d.read_dtc().boxed()).await?)
        })
        .await
    }

    /// Clear stored trouble codes
    pub async fn clear_dtc(&self) -> Result<bool, SessionError> {
        let options = OperationOptions::default()
            .attempts(1)
            .capture_snapshot()
            .summarize_success(|ok: &bool| (if *ok { "acknowledged" } else { "not acknowledged" }).to_string());
        self.run_operation(OperationKind::ClearDtc, options, |_| async move {
            Ok(self.connection.with_driver(|d| d.clear_dtc().boxed()).await?)
        })
        .await
    }

    pub async fn read_status(&self) -> Result<VehicleStatus, SessionError> {
        let options = OperationOptions::default()
            .summarize_success(|s: &VehicleStatus| format!("mil_on={} dtc_count={}", s.mil_on, s.dtc_count));
        self.run_operation(OperationKind::Status, options, |_| async move {
            Ok(self.connection.with_driver(|d| d.read_status().boxed()).await?)
        })
        .await
    }

    /// One reading per PID; unsupported PIDs are listed, not fatal
    pub async fn read_live_data(&self, pids: &[Pid]) -> Result<LiveData, SessionError> {
        let options = OperationOptions::default()
            .summarize_success(|d: &LiveData| format!("{} reading(s)", d.readings.len()));
        self.run_operation(OperationKind::LiveData, options, |_| {
            let pids = pids.to_vec();
            async move {
                Ok(self
                    .connection
                    .with_driver(move |d| async move { d.read_live_data(&pids).await }.boxed())
                    .await?)
            }
        })
        .await
    }

    pub async fn self_check(&self) -> Result<SelfCheckReport, SessionError> {
        let options = OperationOptions::default().capture_snapshot().summarize_success(|r: &SelfCheckReport| {
            format!("identity={:?} voltage={:?}", r.identity, r.battery_voltage)
        });
        self.run_operation(OperationKind::SelfCheck, options, |_| async move {
            Ok(self.connection.with_driver(|d| d.self_check().boxed()).await?)
        })
        .await
    }

    pub fn get_timeline(&self, query: &TimelineQuery) -> Vec<TimelineEvent> {
        self.append(None);
        self.lock().timeline.query(query)
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        self.append(None);
        let state = self.lock();
        let operations: BTreeMap<OperationKind, OperationStats> = state
            .stats
            .iter()
            .map(|(kind, s)| {
                let runs = s.successes + s.failures;
                let average_duration_ms = if runs == 0 {
                    0.0
                } else {
                    s.total_duration_ms as f64 / runs as f64
                };
                (
                    *kind,
                    OperationStats {
                        successes: s.successes,
                        failures: s.failures,
                        average_duration_ms,
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            session_id: self.session_id,
            started_at: self.started_at,
            total_successes: operations.values().map(|o| o.successes).sum(),
            total_failures: operations.values().map(|o| o.failures).sum(),
            operations,
            last_error: state.last_error.clone(),
            timeline_events: state.timeline.len(),
            connection: self.connection.snapshot(),
        }
    }

    /// Insights over the most recent `window` events (the configured
    /// window, or everything, when `None`)
    pub fn get_insights(&self, window: Option<usize>) -> Insights {
        self.append(None);
        let events = self.lock().timeline.recent(window.or(self.config.insight_window));
        compute_insights(&events, Utc::now(), self.config.recent_failures)
    }

    pub fn get_historical_summary(&self) -> HistoryStatus {
        match &self.sink {
            None => HistoryStatus::Unavailable {
                reason: "no history sink configured".to_string(),
            },
            Some(sink) => match sink.summary() {
                Ok(summary) => HistoryStatus::Available(summary),
                Err(e) => HistoryStatus::Unavailable { reason: e.to_string() },
            },
        }
    }

    /// Clear the current error of the session and its connection. The
    /// timeline keeps every event.
    pub fn acknowledge_error(&self) -> Option<String> {
        let previous = self.lock().last_error.take();
        let connection = self.connection.acknowledge_error();
        previous.or(connection)
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryEventSink;
    use obd_connection::{ConnectOptions, DiagnosticState};
    use obd_protocol::{ClientConfig, SimulatedAdapter, SimulatedVehicle, TransportConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn connected(adapter: &SimulatedAdapter) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::default());
        let options = ConnectOptions::new(TransportConfig::Simulated(adapter.clone())).with_client(ClientConfig {
            command_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        manager.connect(options).await.unwrap();
        manager
    }

    fn session(manager: Arc<ConnectionManager>) -> SessionManager {
        SessionManager::new(manager, SessionConfig::default(), None)
    }

    fn operations(timeline: &[TimelineEvent]) -> Vec<&OperationEvent> {
        timeline.iter().filter_map(TimelineEvent::operation).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let session = session(connected(&SimulatedAdapter::default()).await);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = session
            .run_operation(
                OperationKind::Status,
                OperationOptions::default().attempts(3).base_delay(Duration::from_millis(100)),
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            anyhow::bail!("attempt {} timed out", attempt);
                        }
                        Ok(attempt)
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // linear: 100ms after the first failure, 200ms after the second
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let timeline = session.get_timeline(&TimelineQuery::default());
        let ops = operations(&timeline);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[2].outcome, Outcome::Success);
        assert_eq!(ops[2].attempt, 3);

        let metrics = session.get_metrics_snapshot();
        let status = metrics.operations[&OperationKind::Status];
        assert_eq!((status.successes, status.failures), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("bus busy {0}")]
        struct BusBusy(u32);

        let session = session(connected(&SimulatedAdapter::default()).await);
        let err = session
            .run_operation(
                OperationKind::ReadDtc,
                OperationOptions::<()>::default().attempts(2),
                |attempt| async move { Err(BusBusy(attempt).into()) },
            )
            .await
            .unwrap_err();

        match err {
            SessionError::Exhausted { kind, attempts, error } => {
                assert_eq!(kind, OperationKind::ReadDtc);
                assert_eq!(attempts, 2);
                assert_eq!(error.downcast_ref::<BusBusy>().map(|e| e.0), Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.last_error().as_deref(), Some("bus busy 2"));
        let metrics = session.get_metrics_snapshot();
        assert_eq!(metrics.operations[&OperationKind::ReadDtc].failures, 1);
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(session.connection().state(), DiagnosticState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_operation_returns_to_ready() {
        let session = session(connected(&SimulatedAdapter::default()).await);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            session.run_operation(
                OperationKind::Status,
                OperationOptions::<()>::default()
                    .attempts(3)
                    .base_delay(Duration::from_millis(100)),
                |_| async { anyhow::bail!("transient") },
            ),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(session.connection().state(), DiagnosticState::Ready);

        let timeline = session.get_timeline(&TimelineQuery::default());
        let last = timeline.last().unwrap();
        assert!(matches!(
            &last.entry,
            TimelineEntry::StateChange(c) if c.to == DiagnosticState::Ready
        ));

        assert!(session.read_status().await.is_ok());
    }

    #[tokio::test]
    async fn test_not_connected_is_invalid_state() {
        let session = session(Arc::new(ConnectionManager::default()));
        let err = session.read_dtc().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
        assert!(err.is_not_connected());
        assert!(operations(&session.get_timeline(&TimelineQuery::default())).is_empty());
    }

    #[tokio::test]
    async fn test_timeline_keeps_causal_order() {
        let session = session(connected(&SimulatedAdapter::default()).await);
        session.read_status().await.unwrap();

        let timeline = session.get_timeline(&TimelineQuery::default());
        let kinds: Vec<String> = timeline
            .iter()
            .map(|e| match &e.entry {
                TimelineEntry::StateChange(c) => format!("{}->{}", c.from, c.to),
                TimelineEntry::Operation(o) => format!("{}#{}", o.kind, o.attempt),
            })
            .collect();
        assert_eq!(kinds, vec!["ready->reading", "status#1", "reading->ready"]);
        assert!(timeline.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_timeline_only_grows() {
        let session = session(connected(&SimulatedAdapter::default()).await);
        session.read_status().await.unwrap();
        let first = session.get_timeline(&TimelineQuery::default());

        session.read_dtc().await.unwrap();
        session.acknowledge_error();
        let second = session.get_timeline(&TimelineQuery::default());
        assert!(second.len() > first.len());
        assert_eq!(second[..first.len()], first[..]);

        let last_seen = first.last().map(|e| e.id);
        let newer = session.get_timeline(&TimelineQuery {
            newer_than: last_seen,
            limit: None,
        });
        assert_eq!(newer[..], second[first.len()..]);
    }

    #[tokio::test]
    async fn test_concurrent_operations_are_serialised() {
        let session = session(connected(&SimulatedAdapter::default()).await);
        let active = AtomicU32::new(0);
        let peak = AtomicU32::new(0);
        let (session, active, peak) = (&session, &active, &peak);

        let run = move |label: u32| {
            session.run_operation(OperationKind::Status, OperationOptions::default(), move |_| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(label)
            })
        };
        let (a, b) = tokio::join!(run(1), run(2));
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_reads_through_session() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0420", "P0300"]));
        let session = session(connected(&adapter).await);

        let codes: Vec<String> = session.read_dtc().await.unwrap().into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["P0300", "P0420"]);
        assert!(session.clear_dtc().await.unwrap());
        assert!(session.read_dtc().await.unwrap().is_empty());

        let live = session.read_live_data(&[Pid::Rpm, Pid::Speed]).await.unwrap();
        assert_eq!(live.values().len(), 2);

        let timeline = session.get_timeline(&TimelineQuery::default());
        let clear = operations(&timeline)
            .into_iter()
            .find(|o| o.kind == OperationKind::ClearDtc)
            .cloned()
            .unwrap();
        assert_eq!(clear.summary.as_deref(), Some("acknowledged"));
        assert!(clear.snapshot.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_moves_connection_to_error() {
        let adapter = SimulatedAdapter::default();
        let session = session(connected(&adapter).await);
        adapter.drop_link_after(0);

        let err = session.read_status().await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(session.connection().state(), DiagnosticState::Error);

        let insights = session.get_insights(None);
        assert_eq!(insights.failed_operations, 1);
        assert_eq!(insights.reliability.outages, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_keeps_history() {
        let session = session(connected(&SimulatedAdapter::default()).await);
        let _ = session
            .run_operation(
                OperationKind::SelfCheck,
                OperationOptions::<()>::default().attempts(1),
                |_| async { anyhow::bail!("adapter silent") },
            )
            .await;
        let before = session.get_timeline(&TimelineQuery::default()).len();

        assert_eq!(session.acknowledge_error().as_deref(), Some("adapter silent"));
        assert_eq!(session.last_error(), None);
        assert_eq!(session.get_timeline(&TimelineQuery::default()).len(), before);
    }

    #[tokio::test]
    async fn test_historical_summary() {
        let manager = connected(&SimulatedAdapter::default()).await;
        let without = SessionManager::new(Arc::clone(&manager), SessionConfig::default(), None);
        assert!(matches!(
            without.get_historical_summary(),
            HistoryStatus::Unavailable { .. }
        ));

        let sink = Arc::new(InMemoryEventSink::default());
        let with = SessionManager::new(manager, SessionConfig::default(), Some(sink.clone() as Arc<dyn EventSink>));
        with.read_status().await.unwrap();
        match with.get_historical_summary() {
            HistoryStatus::Available(summary) => {
                assert_eq!(summary.operations[&OperationKind::Status].success, 1);
                assert_eq!(summary.state_changes, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
