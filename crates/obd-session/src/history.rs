//! Long-term event history
//!
//! Sessions forward every timeline event to an optional [`EventSink`].

use crate::timeline::{OperationKind, Outcome, TimelineEntry, TimelineEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// History errors
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Append-only store for timeline events of many sessions
pub trait EventSink: Send + Sync {
    fn record(&self, session_id: Uuid, event: &TimelineEvent) -> Result<(), HistoryError>;

    fn summary(&self) -> Result<HistoricalSummary, HistoryError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failure: u64,
}

/// Totals over everything a sink retained
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoricalSummary {
    pub total_events: u64,
    pub sessions: usize,
    /// Attempt outcomes per operation kind
    pub operations: BTreeMap<OperationKind, OutcomeCounts>,
    pub state_changes: u64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Result of a history query; a missing sink is not an error
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryStatus {
    Available(HistoricalSummary),
    Unavailable { reason: String },
}

/// Event sink kept in memory (bounded)
pub struct InMemoryEventSink {
    records: Mutex<VecDeque<(Uuid, TimelineEvent)>>,
    max_records: usize,
}

impl InMemoryEventSink {
    pub fn new(max_records: usize) -> Self {
        info!("Creating in-memory event history ({} records)", max_records);
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_records.min(10_000))),
            max_records: max_records.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, session_id: Uuid, event: &TimelineEvent) -> Result<(), HistoryError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| HistoryError::Storage(format!("Lock error: {}", e)))?;

        // Enforce retention
        while records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back((session_id, event.clone()));
        debug!("Recorded event {} for session {}", event.id, session_id);
        Ok(())
    }

    fn summary(&self) -> Result<HistoricalSummary, HistoryError> {
        let records = self
            .records
            .lock()
            .map_err(|e| HistoryError::Storage(format!("Lock error: {}", e)))?;

        let mut summary = HistoricalSummary::default();
        let mut sessions = HashSet::new();
        for (session, event) in records.iter() {
            sessions.insert(*session);
            summary.total_events += 1;
            summary.first_event_at = Some(summary.first_event_at.map_or(event.at, |t| t.min(event.at)));
            summary.last_event_at = Some(summary.last_event_at.map_or(event.at, |t| t.max(event.at)));
            match &event.entry {
                TimelineEntry::Operation(op) => {
                    let counts = summary.operations.entry(op.kind).or_default();
                    match op.outcome {
                        Outcome::Success => counts.success += 1,
                        Outcome::Failure => counts.failure += 1,
                    }
                }
                TimelineEntry::StateChange(_) => summary.state_changes += 1,
            }
        }
        summary.sessions = sessions.len();
        Ok(summary)
    }
}
