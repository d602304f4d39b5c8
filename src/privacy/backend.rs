//! Pluggable detector backends
//!
//! Defines the `DetectorBackend` trait and the `Detector` front that every
//! downstream component talks to.
//!
//! ## Architecture
//!
//! ```text
//! text → [primary backend] ──ok──────────────→ DetectionReport
//!              │ timeout / failure                    ↑
//!              └──→ [local fallback] ──degraded=true──┘
//! ```
//!
//! Backend selection (`local` or `remote`) is configuration only; downstream
//! components see the same `DetectionReport` either way.

use crate::audit::{Auditor, EventDetail, EventType, NewEvent};
use crate::error::{Error, Result};
use crate::privacy::detector::{resolve_overlaps, Category, Finding, PatternDetector, Span};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default bound on a single backend call
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Sensitive-data detection backend.
///
/// Implementations must honor the same contract as the local pattern
/// detector: findings sorted by start offset and mutually non-overlapping.
#[async_trait]
pub trait DetectorBackend: Send + Sync {
    /// Detect findings for the active categories.
    async fn detect(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>>;

    /// Human-readable name (used in audit events and logs).
    fn name(&self) -> &str;
}

/// In-process pattern detector backend
#[derive(Clone)]
pub struct LocalBackend {
    detector: Arc<PatternDetector>,
}

impl LocalBackend {
    pub fn new(detector: Arc<PatternDetector>) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &Arc<PatternDetector> {
        &self.detector
    }
}

#[async_trait]
impl DetectorBackend for LocalBackend {
    async fn detect(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>> {
        self.detector.detect_cancellable(text, categories, cancel)
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[derive(Serialize)]
struct RemoteRequest<'a> {
    text: &'a str,
    categories: &'a BTreeSet<Category>,
}

#[derive(Deserialize)]
struct RemoteResponse {
    findings: Vec<RemoteFinding>,
}

#[derive(Deserialize)]
struct RemoteFinding {
    category: Category,
    start: usize,
    end: usize,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// External classification service speaking the `detect` contract over HTTP.
///
/// `POST {endpoint}/detect` with `{text, categories}`; the service answers
/// `{findings: [{category, start, end, confidence}]}` using byte offsets.
pub struct RemoteBackend {
    client: reqwest::Client,
    endpoint: String,
    priority: Vec<Category>,
}

impl RemoteBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, priority: Vec<Category>) -> Result<Self> {
        let endpoint = endpoint.into();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::Config(format!(
                "Remote detector endpoint must be an http(s) URL, got '{}'",
                endpoint
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            priority,
        })
    }

    async fn call(&self, text: &str, categories: &BTreeSet<Category>) -> Result<Vec<Finding>> {
        let url = format!("{}/detect", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&RemoteRequest { text, categories })
            .send()
            .await
            .map_err(|e| Error::DetectorUnavailable(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DetectorUnavailable(format!(
                "Remote detector returned HTTP {}",
                status
            )));
        }

        let body: RemoteResponse = response.json().await.map_err(|e| {
            Error::DetectorUnavailable(format!("Malformed remote detector response: {}", e))
        })?;

        let findings = body
            .findings
            .into_iter()
            .map(|f| self.validate(text, categories, f))
            .collect::<Result<Vec<_>>>()?;

        Ok(resolve_overlaps(findings, |c| {
            self.priority
                .iter()
                .position(|p| p == c)
                .unwrap_or(self.priority.len())
        }))
    }

    /// Remote spans are untrusted: check bounds, boundaries and category.
    fn validate(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        f: RemoteFinding,
    ) -> Result<Finding> {
        if f.start >= f.end
            || f.end > text.len()
            || !text.is_char_boundary(f.start)
            || !text.is_char_boundary(f.end)
        {
            return Err(Error::DetectorUnavailable(format!(
                "Remote detector returned invalid span {}..{}",
                f.start, f.end
            )));
        }
        if !categories.contains(&f.category) {
            return Err(Error::DetectorUnavailable(format!(
                "Remote detector returned inactive category {}",
                f.category
            )));
        }
        Ok(Finding {
            category: f.category,
            span: Span::new(f.start, f.end),
            matched_text: text[f.start..f.end].to_string(),
            confidence: f.confidence.clamp(0.0, 1.0),
        })
    }
}

#[async_trait]
impl DetectorBackend for RemoteBackend {
    async fn detect(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.call(text, categories) => result,
        }
    }

    fn name(&self) -> &str {
        "remote"
    }
}

/// Outcome of one detection call
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    /// Unique per call; finding ids are `{scan_id}/{index}`
    pub scan_id: String,
    pub findings: Vec<Finding>,
    /// Primary backend failed and the fallback answered
    pub degraded: bool,
    /// Backend that produced the findings
    pub backend: String,
    /// Whether the PII_DETECTED event was persisted
    #[serde(skip)]
    pub audit_ok: bool,
}

impl DetectionReport {
    pub fn finding_id(&self, index: usize) -> String {
        format!("{}/{}", self.scan_id, index)
    }

    pub fn finding_ids(&self) -> Vec<String> {
        (0..self.findings.len()).map(|i| self.finding_id(i)).collect()
    }

    /// Finding count per category name
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for f in &self.findings {
            *counts.entry(f.category.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Detection front: bounded primary call, optional local fallback, audit.
pub struct Detector {
    primary: Arc<dyn DetectorBackend>,
    fallback: Option<Arc<dyn DetectorBackend>>,
    timeout: Duration,
    auditor: Auditor,
}

impl Detector {
    pub fn new(primary: Arc<dyn DetectorBackend>, auditor: Auditor) -> Self {
        Self {
            primary,
            fallback: None,
            timeout: DEFAULT_DETECT_TIMEOUT,
            auditor,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn DetectorBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.primary.name()
    }

    /// Scan `text` and record a PII_DETECTED event when anything was found.
    pub async fn scan(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        subject: &str,
    ) -> Result<DetectionReport> {
        self.scan_cancellable(text, categories, subject, &CancellationToken::new())
            .await
    }

    pub async fn scan_cancellable(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<DetectionReport> {
        if categories.is_empty() {
            return Err(Error::InvalidInput("Category set is empty".to_string()));
        }

        let (findings, backend, degraded) = match self.call(&*self.primary, text, categories, cancel).await {
            Ok(findings) => (findings, self.primary.name().to_string(), false),
            Err(e) if e.is_fatal() || matches!(e, Error::Cancelled) => return Err(e),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(
                        subject,
                        primary = self.primary.name(),
                        fallback = fallback.name(),
                        error = %e,
                        "Primary detector failed, falling back"
                    );
                    let findings = fallback.detect(text, categories, cancel).await?;
                    (findings, fallback.name().to_string(), true)
                }
                None => {
                    return Err(match e {
                        Error::DetectorUnavailable(_) => e,
                        other => Error::DetectorUnavailable(other.to_string()),
                    })
                }
            },
        };

        let mut report = DetectionReport {
            scan_id: uuid::Uuid::new_v4().to_string(),
            findings,
            degraded,
            backend,
            audit_ok: true,
        };

        tracing::debug!(
            subject,
            scan_id = %report.scan_id,
            backend = %report.backend,
            finding_count = report.findings.len(),
            degraded = report.degraded,
            "Detection complete"
        );

        if !report.findings.is_empty() {
            let event = NewEvent::new(
                EventType::PiiDetected,
                subject,
                EventDetail::Detection {
                    scan_id: report.scan_id.clone(),
                    finding_ids: report.finding_ids(),
                    category_counts: report.category_counts(),
                    backend: report.backend.clone(),
                    degraded: report.degraded,
                },
            );
            report.audit_ok = self.auditor.emit(vec![event]).await;
        }

        Ok(report)
    }

    async fn call(
        &self,
        backend: &dyn DetectorBackend,
        text: &str,
        categories: &BTreeSet<Category>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>> {
        match tokio::time::timeout(self.timeout, backend.detect(text, categories, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DetectorUnavailable(format!(
                "{} detector timed out after {}ms",
                backend.name(),
                self.timeout.as_millis()
            ))),
        }
    }
}
