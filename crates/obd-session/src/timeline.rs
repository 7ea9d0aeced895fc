//! Operation timeline
//!
//! Append-only log of operation attempts and state changes. Ids increase
//! by one per event and are never reused.

use chrono::{DateTime, Utc};
use obd_connection::{Activity, ConnectionSnapshot, DiagnosticState, StateTransition};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Kinds of supervised operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ReadDtc,
    LiveData,
    Status,
    ClearDtc,
    SelfCheck,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::ReadDtc,
        OperationKind::LiveData,
        OperationKind::Status,
        OperationKind::ClearDtc,
        OperationKind::SelfCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ReadDtc => "read_dtc",
            OperationKind::LiveData => "live_data",
            OperationKind::Status => "status",
            OperationKind::ClearDtc => "clear_dtc",
            OperationKind::SelfCheck => "self_check",
        }
    }

    /// State the connection is in while this operation runs
    pub fn activity(&self) -> Activity {
        match self {
            OperationKind::ClearDtc => Activity::Clearing,
            _ => Activity::Reading,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// One attempt of an operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationEvent {
    pub kind: OperationKind,
    pub attempt: u32,
    pub attempts: u32,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub snapshot: Option<ConnectionSnapshot>,
}

impl OperationEvent {
    /// Last attempt of its operation: a success, or a failure with no
    /// attempts left
    pub fn is_final(&self) -> bool {
        self.outcome == Outcome::Success || self.attempt >= self.attempts
    }
}

/// A state machine edge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChangeEvent {
    pub from: DiagnosticState,
    pub to: DiagnosticState,
    pub reason: String,
    pub reconnect_attempts: u32,
}

impl From<StateTransition> for StateChangeEvent {
    fn from(t: StateTransition) -> Self {
        Self {
            from: t.from,
            to: t.to,
            reason: t.reason,
            reconnect_attempts: t.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEntry {
    Operation(OperationEvent),
    StateChange(StateChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub id: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: TimelineEntry,
}

impl TimelineEvent {
    pub fn operation(&self) -> Option<&OperationEvent> {
        match &self.entry {
            TimelineEntry::Operation(op) => Some(op),
            TimelineEntry::StateChange(_) => None,
        }
    }

    pub fn state_change(&self) -> Option<&StateChangeEvent> {
        match &self.entry {
            TimelineEntry::StateChange(change) => Some(change),
            TimelineEntry::Operation(_) => None,
        }
    }
}

/// Selection for [`Timeline::query`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineQuery {
    /// Only events with a greater id
    pub newer_than: Option<u64>,
    /// Keep at most this many of the most recent matches
    pub limit: Option<usize>,
}

/// Retained events, oldest first
#[derive(Debug)]
pub struct Timeline {
    events: VecDeque<TimelineEvent>,
    next_id: u64,
    max_events: usize,
}

impl Timeline {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            max_events: max_events.max(1),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, entry: TimelineEntry) -> TimelineEvent {
        let event = TimelineEvent {
            id: self.next_id,
            at,
            entry,
        };
        self.next_id += 1;
        // retention drops the oldest events only
        while self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    pub fn query(&self, query: &TimelineQuery) -> Vec<TimelineEvent> {
        let after = query.newer_than.unwrap_or(0);
        let start = self.events.partition_point(|e| e.id <= after);
        let mut selected: Vec<TimelineEvent> = self.events.range(start..).cloned().collect();
        if let Some(limit) = query.limit {
            if selected.len() > limit {
                selected.drain(..selected.len() - limit);
            }
        }
        selected
    }

    /// The most recent `count` events, or all of them
    pub fn recent(&self, count: Option<usize>) -> Vec<TimelineEvent> {
        self.query(&TimelineQuery {
            newer_than: None,
            limit: count,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.events.back().map(|e| e.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(to: DiagnosticState) -> TimelineEntry {
        TimelineEntry::StateChange(StateChangeEvent {
            from: DiagnosticState::Ready,
            to,
            reason: "test".into(),
            reconnect_attempts: 0,
        })
    }

    #[test]
    fn test_newer_than_is_strict_suffix() {
        let mut timeline = Timeline::new(100);
        for _ in 0..5 {
            timeline.push(Utc::now(), change(DiagnosticState::Reading));
        }
        let all = timeline.query(&TimelineQuery::default());
        let newer = timeline.query(&TimelineQuery {
            newer_than: Some(2),
            limit: None,
        });
        assert_eq!(newer.len(), 3);
        assert_eq!(newer[..], all[2..]);
    }

    #[test]
    fn test_limit_keeps_most_recent() {
        let mut timeline = Timeline::new(100);
        for _ in 0..5 {
            timeline.push(Utc::now(), change(DiagnosticState::Reading));
        }
        let ids: Vec<u64> = timeline
            .query(&TimelineQuery {
                newer_than: None,
                limit: Some(2),
            })
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn test_retention_keeps_ids_monotonic() {
        let mut timeline = Timeline::new(3);
        for _ in 0..5 {
            timeline.push(Utc::now(), change(DiagnosticState::Ready));
        }
        assert_eq!(timeline.len(), 3);
        let ids: Vec<u64> = timeline.recent(None).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(timeline.last_id(), Some(5));
    }

    #[test]
    fn test_final_attempt_detection() {
        let mut op = OperationEvent {
            kind: OperationKind::ReadDtc,
            attempt: 1,
            attempts: 3,
            outcome: Outcome::Failure,
            duration_ms: 5,
            summary: None,
            error: Some("timeout".into()),
            snapshot: None,
        };
        assert!(!op.is_final());
        op.attempt = 3;
        assert!(op.is_final());
        op.attempt = 2;
        op.outcome = Outcome::Success;
        assert!(op.is_final());
    }
}
