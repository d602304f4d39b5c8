//! Audit recording
//!
//! Process-wide append-only event log. Every detector, transform, guardrail
//! and access decision is recorded as an [`AuditEvent`]; the compliance
//! aggregator reads the log back through [`AuditRecorder::query`].

pub mod file;
pub mod recorder;
pub mod types;

pub use file::FileRecorder;
pub use recorder::{
    AuditRecorder, Auditor, Clock, EventCursor, InMemoryRecorder, ManualClock, SystemClock,
};
pub use types::{AuditEvent, EventDetail, EventId, EventType, Framework, NewEvent, TimeRange};

#[cfg(test)]
pub(crate) mod testing {
    use super::recorder::EventCursor;
    use super::types::{EventId, EventType, NewEvent, TimeRange};
    use super::AuditRecorder;
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    /// Recorder that rejects every call
    pub(crate) struct FailingRecorder;

    #[async_trait]
    impl AuditRecorder for FailingRecorder {
        async fn record_batch(&self, _events: Vec<NewEvent>) -> Result<Vec<EventId>> {
            Err(Error::AuditWrite("sink offline".to_string()))
        }

        async fn query(&self, _range: TimeRange, _types: Option<&[EventType]>) -> Result<EventCursor> {
            Err(Error::AuditWrite("sink offline".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }
}
