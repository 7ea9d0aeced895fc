//! Failure insights derived from a timeline
//!
//! An outage starts at a failed operation (after its last attempt) or an
//! entry into `error`, and ends at the next successful operation or a
//! completed handshake.

use crate::timeline::{OperationKind, Outcome, TimelineEvent};
use chrono::{DateTime, Utc};
use obd_connection::DiagnosticState;
use serde::Serialize;
use std::collections::HashMap;

/// Time spent in one state, between two consecutive state changes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSegment {
    pub state: DiagnosticState,
    pub started_at: DateTime<Utc>,
    /// `None` while the state is current
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub event_id: u64,
    pub kind: OperationKind,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reliability {
    /// Mean time between outage starts
    pub mtbf_ms: Option<f64>,
    /// Mean outage length, over outages that ended
    pub mttr_ms: Option<f64>,
    /// Failed operations since the last successful one
    pub failure_streak: u32,
    /// Share of observed time with an adapter attached
    pub uptime_ratio: Option<f64>,
    pub outages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insights {
    pub events_considered: usize,
    pub operations: u64,
    pub failed_operations: u64,
    /// Failed operations over finished operations
    pub failure_rate: f64,
    /// Failed attempts over all attempts
    pub attempt_failure_rate: f64,
    /// Newest first
    pub recent_failures: Vec<FailureSummary>,
    pub state_segments: Vec<StateSegment>,
    pub time_in_state_ms: HashMap<DiagnosticState, u64>,
    pub reliability: Reliability,
}

fn millis(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Compute insights over `events` (oldest first) as of `now`
pub fn compute_insights(events: &[TimelineEvent], now: DateTime<Utc>, recent_failures: usize) -> Insights {
    let mut operations = 0u64;
    let mut failed_operations = 0u64;
    let mut attempts = 0u64;
    let mut failed_attempts = 0u64;
    let mut failures = Vec::new();
    let mut streak = 0u32;

    let mut outage_started: Option<DateTime<Utc>> = None;
    let mut outage_starts = Vec::new();
    let mut outage_lengths = Vec::new();

    let mut segments: Vec<StateSegment> = Vec::new();

    for event in events {
        if let Some(op) = event.operation() {
            attempts += 1;
            if op.outcome == Outcome::Failure {
                failed_attempts += 1;
                failures.push(FailureSummary {
                    event_id: event.id,
                    kind: op.kind,
                    attempt: op.attempt,
                    at: event.at,
                    error: op.error.clone(),
                });
            }
            if !op.is_final() {
                continue;
            }
            operations += 1;
            match op.outcome {
                Outcome::Success => {
                    streak = 0;
                    if let Some(start) = outage_started.take() {
                        outage_lengths.push(millis(start, event.at));
                    }
                }
                Outcome::Failure => {
                    failed_operations += 1;
                    streak += 1;
                    if outage_started.is_none() {
                        outage_started = Some(event.at);
                        outage_starts.push(event.at);
                    }
                }
            }
        } else if let Some(change) = event.state_change() {
            if let Some(last) = segments.last_mut() {
                last.ended_at = Some(event.at);
                last.duration_ms = millis(last.started_at, event.at);
            }
            segments.push(StateSegment {
                state: change.to,
                started_at: event.at,
                ended_at: None,
                duration_ms: millis(event.at, now),
            });

            if change.to == DiagnosticState::Error && outage_started.is_none() {
                outage_started = Some(event.at);
                outage_starts.push(event.at);
            }
            if change.to == DiagnosticState::Ready && change.from == DiagnosticState::Authenticating {
                if let Some(start) = outage_started.take() {
                    outage_lengths.push(millis(start, event.at));
                }
            }
        }
    }

    let mut time_in_state_ms: HashMap<DiagnosticState, u64> = HashMap::new();
    for segment in &segments {
        *time_in_state_ms.entry(segment.state).or_default() += segment.duration_ms;
    }
    let observed: u64 = time_in_state_ms.values().sum();
    let attached: u64 = time_in_state_ms
        .iter()
        .filter(|(state, _)| state.has_driver())
        .map(|(_, ms)| *ms)
        .sum();

    let mtbf_ms = (outage_starts.len() >= 2).then(|| {
        let gaps: Vec<u64> = outage_starts.windows(2).map(|w| millis(w[0], w[1])).collect();
        gaps.iter().sum::<u64>() as f64 / gaps.len() as f64
    });
    let mttr_ms = (!outage_lengths.is_empty())
        .then(|| outage_lengths.iter().sum::<u64>() as f64 / outage_lengths.len() as f64);

    failures.reverse();
    failures.truncate(recent_failures);

    Insights {
        events_considered: events.len(),
        operations,
        failed_operations,
        failure_rate: ratio(failed_operations, operations),
        attempt_failure_rate: ratio(failed_attempts, attempts),
        recent_failures: failures,
        state_segments: segments,
        time_in_state_ms,
        reliability: Reliability {
            mtbf_ms,
            mttr_ms,
            failure_streak: streak,
            uptime_ratio: (observed > 0).then(|| ratio(attached, observed)),
            outages: outage_starts.len(),
        },
    }
}
