//! Compliance reporting
//!
//! Projects a window of the audit log onto per-framework status. Reports are
//! derived on demand and never persisted; the same event sequence and window
//! always yield the same report.
//!
//! A framework needs attention when, among the events tagged for it, a
//! PII_DETECTED event has finding ids that no later PII_MASKED event in the
//! window references, or any ACCESS_DENIED event occurred.

use crate::audit::{AuditEvent, AuditRecorder, EventType, Framework, TimeRange};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-framework verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Compliant,
    AttentionNeeded,
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compliant => write!(f, "COMPLIANT"),
            Self::AttentionNeeded => write!(f, "ATTENTION_NEEDED"),
        }
    }
}

/// Reported window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkStatus {
    pub status: ComplianceStatus,
    pub event_counts: BTreeMap<EventType, usize>,
    /// PII_DETECTED events with at least one unmasked finding
    pub open_findings: usize,
    /// Individual finding ids never masked within the window
    pub unmasked_findings: usize,
    pub access_denied: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub timeframe: Timeframe,
    pub generated_at: DateTime<Utc>,
    /// Counts over every event in the window
    pub event_counts: BTreeMap<EventType, usize>,
    pub frameworks: BTreeMap<Framework, FrameworkStatus>,
}

impl ComplianceReport {
    pub fn is_compliant(&self) -> bool {
        self.frameworks
            .values()
            .all(|f| f.status == ComplianceStatus::Compliant)
    }
}

/// Builds compliance reports from an audit source
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplianceAggregator;

impl ComplianceAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Report over `[now - days, now]`. `days` must be positive.
    pub async fn generate_report(
        &self,
        days: i64,
        now: DateTime<Utc>,
        source: &dyn AuditRecorder,
    ) -> Result<ComplianceReport> {
        let range = TimeRange::last_days(now, days)?;
        let cursor = source.query(range, None).await?;
        let report = self.project(range, days, now, cursor.iter());

        tracing::info!(
            days,
            events = report.event_counts.values().sum::<usize>(),
            compliant = report.is_compliant(),
            "Compliance report generated"
        );
        Ok(report)
    }

    /// Pure projection of an ordered event sequence.
    pub fn project<'a>(
        &self,
        range: TimeRange,
        days: i64,
        generated_at: DateTime<Utc>,
        events: impl Iterator<Item = &'a AuditEvent>,
    ) -> ComplianceReport {
        let events: Vec<&AuditEvent> = events.filter(|e| range.contains(e.timestamp)).collect();

        let frameworks = Framework::ALL
            .iter()
            .map(|&framework| {
                let tagged = events
                    .iter()
                    .copied()
                    .filter(|e| e.framework_tags.contains(&framework));
                (framework, framework_status(tagged))
            })
            .collect();

        ComplianceReport {
            timeframe: Timeframe {
                start: range.start,
                end: range.end,
                days,
            },
            generated_at,
            event_counts: count_by_type(events.iter().copied()),
            frameworks,
        }
    }
}

fn count_by_type<'a>(events: impl Iterator<Item = &'a AuditEvent>) -> BTreeMap<EventType, usize> {
    let mut counts = BTreeMap::new();
    for e in events {
        *counts.entry(e.event_type).or_insert(0) += 1;
    }
    counts
}

fn framework_status<'a>(events: impl Iterator<Item = &'a AuditEvent> + Clone) -> FrameworkStatus {
    let event_counts = count_by_type(events.clone());

    // Unmasked ids per detection, in order of appearance
    let mut detections: Vec<HashSet<&str>> = Vec::new();
    let mut owner: HashMap<&str, usize> = HashMap::new();

    for event in events {
        match event.event_type {
            EventType::PiiDetected => {
                let index = detections.len();
                let ids: HashSet<&str> = event
                    .detail
                    .finding_ids()
                    .iter()
                    .map(String::as_str)
                    .collect();
                for &id in &ids {
                    owner.insert(id, index);
                }
                detections.push(ids);
            }
            EventType::PiiMasked => {
                for id in event.detail.finding_ids() {
                    if let Some(&index) = owner.get(id.as_str()) {
                        detections[index].remove(id.as_str());
                    }
                }
            }
            _ => {}
        }
    }

    let open_findings = detections.iter().filter(|ids| !ids.is_empty()).count();
    let unmasked_findings = detections.iter().map(HashSet::len).sum();
    let access_denied = event_counts
        .get(&EventType::AccessDenied)
        .copied()
        .unwrap_or(0);

    let status = if open_findings > 0 || access_denied > 0 {
        ComplianceStatus::AttentionNeeded
    } else {
        ComplianceStatus::Compliant
    };

    FrameworkStatus {
        status,
        event_counts,
        open_findings,
        unmasked_findings,
        access_denied,
    }
}
