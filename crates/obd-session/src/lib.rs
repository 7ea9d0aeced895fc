//! Diagnostic Session Manager
//!
//! Supervised OBD-II operations with retry, an append-only timeline,
//! per-kind metrics and failure insights.

mod error;
mod history;
mod insights;
mod session;
mod timeline;

pub use error::SessionError;
pub use history::{EventSink, HistoricalSummary, HistoryError, HistoryStatus, InMemoryEventSink, OutcomeCounts};
pub use insights::{compute_insights, FailureSummary, Insights, Reliability, StateSegment};
pub use session::{MetricsSnapshot, OperationOptions, OperationStats, SessionConfig, SessionManager};
pub use timeline::{
    OperationEvent, OperationKind, Outcome, StateChangeEvent, Timeline, TimelineEntry, TimelineEvent, TimelineQuery,
};
