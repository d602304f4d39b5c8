//! Audit event types
//!
//! Every governance decision is captured as an immutable [`AuditEvent`].
//! Components submit [`NewEvent`] drafts; the recorder stamps the id,
//! timestamp and framework tags on append.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of governance event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PiiDetected,
    PiiMasked,
    ContentBlocked,
    ContentFlagged,
    AccessDenied,
    EncryptionOp,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::PiiDetected,
        EventType::PiiMasked,
        EventType::ContentBlocked,
        EventType::ContentFlagged,
        EventType::AccessDenied,
        EventType::EncryptionOp,
    ];

    /// Compliance frameworks an event of this type is relevant to.
    pub fn framework_tags(self) -> BTreeSet<Framework> {
        use Framework::*;
        let tags: &[Framework] = match self {
            EventType::PiiDetected | EventType::PiiMasked => &[Gdpr, Hipaa, Ccpa],
            EventType::ContentBlocked | EventType::ContentFlagged => &[Gdpr, Hipaa, PciDss, Ccpa],
            EventType::AccessDenied => &[Gdpr, Hipaa, PciDss, Ccpa],
            EventType::EncryptionOp => &[Gdpr, Hipaa, PciDss],
        };
        tags.iter().copied().collect()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PiiDetected => write!(f, "PII_DETECTED"),
            Self::PiiMasked => write!(f, "PII_MASKED"),
            Self::ContentBlocked => write!(f, "CONTENT_BLOCKED"),
            Self::ContentFlagged => write!(f, "CONTENT_FLAGGED"),
            Self::AccessDenied => write!(f, "ACCESS_DENIED"),
            Self::EncryptionOp => write!(f, "ENCRYPTION_OP"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "PII_DETECTED" => Ok(Self::PiiDetected),
            "PII_MASKED" => Ok(Self::PiiMasked),
            "CONTENT_BLOCKED" => Ok(Self::ContentBlocked),
            "CONTENT_FLAGGED" => Ok(Self::ContentFlagged),
            "ACCESS_DENIED" => Ok(Self::AccessDenied),
            "ENCRYPTION_OP" => Ok(Self::EncryptionOp),
            other => Err(Error::InvalidInput(format!("unknown event type: {}", other))),
        }
    }
}

/// Compliance framework tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Framework {
    #[serde(rename = "GDPR")]
    Gdpr,
    #[serde(rename = "HIPAA")]
    Hipaa,
    #[serde(rename = "PCI-DSS")]
    PciDss,
    #[serde(rename = "CCPA")]
    Ccpa,
}

impl Framework {
    pub const ALL: [Framework; 4] = [
        Framework::Gdpr,
        Framework::Hipaa,
        Framework::PciDss,
        Framework::Ccpa,
    ];
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gdpr => write!(f, "GDPR"),
            Self::Hipaa => write!(f, "HIPAA"),
            Self::PciDss => write!(f, "PCI-DSS"),
            Self::Ccpa => write!(f, "CCPA"),
        }
    }
}

/// Monotonic event identifier assigned by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt-{:012}", self.0)
    }
}

/// Structured payload specific to the event type.
///
/// Never carries the raw sensitive value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    Detection {
        scan_id: String,
        finding_ids: Vec<String>,
        category_counts: BTreeMap<String, usize>,
        backend: String,
        degraded: bool,
    },
    Transformation {
        scan_id: String,
        category: String,
        action: String,
        finding_ids: Vec<String>,
        count: usize,
    },
    Guardrail {
        rule_id: String,
        severity: String,
        /// All rules that matched (flags accumulate)
        matched_rules: Vec<String>,
    },
    Access {
        principal: String,
        resource: String,
        permission: String,
    },
    Encryption {
        dataset_id: String,
        location: String,
        key_ref: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl EventDetail {
    /// Finding ids referenced by detection and transformation events
    pub fn finding_ids(&self) -> &[String] {
        match self {
            EventDetail::Detection { finding_ids, .. }
            | EventDetail::Transformation { finding_ids, .. } => finding_ids,
            _ => &[],
        }
    }
}

/// Event draft submitted by a component
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub subject: String,
    pub detail: EventDetail,
}

impl NewEvent {
    pub fn new(event_type: EventType, subject: impl Into<String>, detail: EventDetail) -> Self {
        Self {
            event_type,
            subject: subject.into(),
            detail,
        }
    }
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub subject: String,
    pub detail: EventDetail,
    pub framework_tags: BTreeSet<Framework>,
}

impl AuditEvent {
    /// Ordering key: timestamp, then event id
    pub fn order_key(&self) -> (DateTime<Utc>, EventId) {
        (self.timestamp, self.event_id)
    }
}

/// Inclusive time window `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInput(format!(
                "Time range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// `[now - days, now]`; `days` must be positive.
    pub fn last_days(now: DateTime<Utc>, days: i64) -> Result<Self> {
        if days <= 0 {
            return Err(Error::InvalidInput(format!(
                "Timeframe must be a positive number of days, got {}",
                days
            )));
        }
        let span = Duration::try_days(days)
            .ok_or_else(|| Error::InvalidInput(format!("Timeframe of {} days is too large", days)))?;
        let start = now
            .checked_sub_signed(span)
            .ok_or_else(|| Error::InvalidInput(format!("Timeframe of {} days is too large", days)))?;
        Self::new(start, now)
    }

    /// Everything up to and including `now`
    pub fn until(now: DateTime<Utc>) -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}
