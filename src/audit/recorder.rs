//! Audit recorder contract and the in-memory implementation
//!
//! Append is the only mutation. Each batch is stamped under a single write
//! lock, so `(timestamp, event_id)` is strictly increasing across all
//! callers and queries always observe a consistent prefix.

use crate::audit::types::{AuditEvent, EventId, EventType, NewEvent, TimeRange};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Source of "now" for stamping events
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, ts: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = ts;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Append-only audit log contract.
///
/// The engine depends only on this trait; backing stores are pluggable.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    /// Append a batch atomically, returning the assigned ids in order.
    async fn record_batch(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>>;

    /// Events within `range`, ordered by timestamp then event id.
    async fn query(&self, range: TimeRange, types: Option<&[EventType]>) -> Result<EventCursor>;

    /// Backend name (for logs and health output)
    fn name(&self) -> &str;

    /// Append a single event.
    async fn record(&self, event: NewEvent) -> Result<EventId> {
        self.record_batch(vec![event])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AuditWrite("Recorder returned no event id".to_string()))
    }
}

/// Finite, restartable view over a query result.
///
/// Holds shared references to the matching window; the type filter is
/// applied lazily on every pass.
#[derive(Debug, Clone)]
pub struct EventCursor {
    events: Vec<Arc<AuditEvent>>,
    types: Option<Vec<EventType>>,
}

impl EventCursor {
    pub(crate) fn new(events: Vec<Arc<AuditEvent>>, types: Option<&[EventType]>) -> Self {
        Self {
            events,
            types: types.map(|t| t.to_vec()),
        }
    }

    /// Iterate matching events from the beginning.
    pub fn iter(&self) -> impl Iterator<Item = &AuditEvent> + '_ {
        self.events
            .iter()
            .map(|e| e.as_ref())
            .filter(move |e| match &self.types {
                Some(types) => types.contains(&e.event_type),
                None => true,
            })
    }

    /// Number of matching events (walks the cursor)
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<AuditEvent> {
        self.iter().cloned().collect()
    }
}

/// Ordered event storage shared by the recorder backends
pub(crate) struct EventLog {
    events: Vec<Arc<AuditEvent>>,
    next_id: u64,
    last_ts: Option<DateTime<Utc>>,
    max_events: Option<usize>,
}

impl EventLog {
    pub(crate) fn new(max_events: Option<usize>) -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            last_ts: None,
            max_events,
        }
    }

    /// Append events written elsewhere (another process sharing the store).
    ///
    /// Ids are unique per store, so an event whose id is not above the
    /// current maximum is corrupt. It is reported and left out.
    pub(crate) fn absorb(&mut self, mut events: Vec<AuditEvent>) -> usize {
        events.sort_by_key(|e| e.order_key());
        let mut absorbed = 0;
        let mut needs_sort = false;
        for event in events {
            if event.event_id.0 < self.next_id {
                tracing::warn!(
                    target: "govshield::audit",
                    event_id = event.event_id.0,
                    "Ignoring audit event with duplicate or out-of-sequence id"
                );
                continue;
            }
            if self.last_ts.is_some_and(|last| event.timestamp < last) {
                needs_sort = true;
            }
            self.next_id = event.event_id.0 + 1;
            self.last_ts = Some(self.last_ts.map_or(event.timestamp, |last| last.max(event.timestamp)));
            self.events.push(Arc::new(event));
            absorbed += 1;
        }
        if needs_sort {
            self.events.sort_by_key(|e| e.order_key());
        }
        absorbed
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Stamp drafts without appending them.
    pub(crate) fn prepare(&self, drafts: Vec<NewEvent>, now: DateTime<Utc>) -> Result<Vec<AuditEvent>> {
        if let Some(max) = self.max_events {
            if self.events.len() + drafts.len() > max {
                return Err(Error::AuditWrite(format!(
                    "Audit log capacity of {} events exhausted",
                    max
                )));
            }
        }

        // Timestamps never go backwards even if the clock does
        let timestamp = match self.last_ts {
            Some(last) if last > now => last,
            _ => now,
        };

        Ok(drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| AuditEvent {
                event_id: EventId(self.next_id + i as u64),
                timestamp,
                framework_tags: draft.event_type.framework_tags(),
                event_type: draft.event_type,
                subject: draft.subject,
                detail: draft.detail,
            })
            .collect())
    }

    pub(crate) fn commit(&mut self, events: Vec<AuditEvent>) -> Vec<EventId> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            self.next_id = event.event_id.0 + 1;
            self.last_ts = Some(event.timestamp);
            ids.push(event.event_id);
            self.events.push(Arc::new(event));
        }
        ids
    }

    pub(crate) fn window(&self, range: &TimeRange) -> Vec<Arc<AuditEvent>> {
        let lo = self.events.partition_point(|e| e.timestamp < range.start);
        let hi = self.events.partition_point(|e| e.timestamp <= range.end);
        if lo >= hi {
            return Vec::new();
        }
        self.events[lo..hi].to_vec()
    }
}

/// In-memory append log used for simulation and tests
pub struct InMemoryRecorder {
    log: RwLock<EventLog>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            log: RwLock::new(EventLog::new(None)),
            clock,
        }
    }

    /// Bound the log; appends past `max_events` fail with `AuditWrite`.
    pub fn with_capacity(mut self, max_events: usize) -> Self {
        self.log.get_mut().max_events = Some(max_events);
        self
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }
}

impl Default for InMemoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditRecorder for InMemoryRecorder {
    async fn record_batch(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut log = self.log.write().await;
        let prepared = log.prepare(events, self.clock.now())?;
        Ok(log.commit(prepared))
    }

    async fn query(&self, range: TimeRange, types: Option<&[EventType]>) -> Result<EventCursor> {
        let log = self.log.read().await;
        Ok(EventCursor::new(log.window(&range), types))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Failure-aware front for a recorder.
///
/// Governance decisions must survive audit failures, so `emit` never returns
/// an error: failures are logged and counted as a separate signal.
#[derive(Clone)]
pub struct Auditor {
    recorder: Arc<dyn AuditRecorder>,
    failures: Arc<AtomicU64>,
}

impl Auditor {
    pub fn new(recorder: Arc<dyn AuditRecorder>) -> Self {
        Self {
            recorder,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a batch in one recorder call. Returns whether it was persisted.
    pub async fn emit(&self, events: Vec<NewEvent>) -> bool {
        if events.is_empty() {
            return true;
        }
        let count = events.len();
        match self.recorder.record_batch(events).await {
            Ok(_) => true,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    target: "govshield::audit",
                    recorder = self.recorder.name(),
                    event_count = count,
                    error = %e,
                    "Audit write failed; governance decision still returned"
                );
                false
            }
        }
    }

    pub fn recorder(&self) -> &Arc<dyn AuditRecorder> {
        &self.recorder
    }

    /// Number of failed emits since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
