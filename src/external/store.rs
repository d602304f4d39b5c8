//! Encrypted store boundary
//!
//! The store owns encryption at rest and key binding. `EncryptionMonitor`
//! only records the success or failure the store reports.

use crate::audit::{Auditor, EventDetail, EventType, NewEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Dataset to place under a customer-managed key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRequest {
    pub dataset_id: String,
    pub location: String,
    /// CMEK reference, opaque to the engine
    pub key_ref: String,
}

/// Result reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub audit_ok: bool,
}

impl EncryptionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            audit_ok: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            audit_ok: true,
        }
    }
}

#[async_trait]
pub trait EncryptedStore: Send + Sync {
    /// Provision `dataset_id` at `location` bound to `key_ref`.
    async fn provision(&self, request: &EncryptionRequest) -> Result<EncryptionOutcome>;

    fn name(&self) -> &str;
}

/// Print-only store used when no provider is configured.
///
/// Succeeds for any allowed location with a non-empty key reference.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStore {
    allowed_locations: Vec<String>,
}

impl SimulatedStore {
    /// Empty `allowed_locations` allows every location.
    pub fn new(allowed_locations: Vec<String>) -> Self {
        Self { allowed_locations }
    }
}

#[async_trait]
impl EncryptedStore for SimulatedStore {
    async fn provision(&self, request: &EncryptionRequest) -> Result<EncryptionOutcome> {
        if request.dataset_id.trim().is_empty() {
            return Err(Error::InvalidInput("dataset_id is empty".to_string()));
        }
        if request.key_ref.trim().is_empty() {
            return Ok(EncryptionOutcome::failed("No CMEK key reference supplied"));
        }
        if !self.allowed_locations.is_empty()
            && !self.allowed_locations.iter().any(|l| l == &request.location)
        {
            return Ok(EncryptionOutcome::failed(format!(
                "Location '{}' is not permitted",
                request.location
            )));
        }

        tracing::info!(
            dataset_id = %request.dataset_id,
            location = %request.location,
            key_ref = %request.key_ref,
            "[simulated] Dataset provisioned with CMEK"
        );
        Ok(EncryptionOutcome::ok())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Front for the store that records ENCRYPTION_OP
#[derive(Clone)]
pub struct EncryptionMonitor {
    store: Arc<dyn EncryptedStore>,
    auditor: Auditor,
}

impl EncryptionMonitor {
    pub fn new(store: Arc<dyn EncryptedStore>, auditor: Auditor) -> Self {
        Self { store, auditor }
    }

    /// Provision through the store and record the reported outcome.
    ///
    /// A store that errors is recorded as a failed operation before the
    /// error is returned.
    pub async fn provision(&self, request: &EncryptionRequest, subject: &str) -> Result<EncryptionOutcome> {
        let result = self.store.provision(request).await;
        let (success, message) = match &result {
            Ok(outcome) => (outcome.success, outcome.message.clone()),
            Err(e) if e.is_fatal() => return result,
            Err(e) => (false, Some(e.to_string())),
        };

        if !success {
            tracing::warn!(
                dataset_id = %request.dataset_id,
                store = self.store.name(),
                message = message.as_deref().unwrap_or_default(),
                "Encryption operation failed"
            );
        }

        let audit_ok = self
            .auditor
            .emit(vec![NewEvent::new(
                EventType::EncryptionOp,
                subject,
                EventDetail::Encryption {
                    dataset_id: request.dataset_id.clone(),
                    location: request.location.clone(),
                    key_ref: request.key_ref.clone(),
                    success,
                    message,
                },
            )])
            .await;

        result.map(|mut outcome| {
            outcome.audit_ok = audit_ok;
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecorder, InMemoryRecorder, TimeRange};
    use chrono::Utc;

    struct BrokenStore;

    #[async_trait]
    impl EncryptedStore for BrokenStore {
        async fn provision(&self, _request: &EncryptionRequest) -> Result<EncryptionOutcome> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "provider unreachable",
            )))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn request(location: &str, key_ref: &str) -> EncryptionRequest {
        EncryptionRequest {
            dataset_id: "patients".into(),
            location: location.into(),
            key_ref: key_ref.into(),
        }
    }

    async fn encryption_events(recorder: &InMemoryRecorder) -> Vec<crate::audit::AuditEvent> {
        recorder
            .query(TimeRange::until(Utc::now()), Some(&[EventType::EncryptionOp]))
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_success_and_failure_both_recorded() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let monitor = EncryptionMonitor::new(
            Arc::new(SimulatedStore::new(vec!["EU".into()])),
            Auditor::new(recorder.clone()),
        );

        let ok = monitor.provision(&request("EU", "projects/p/keys/k"), "svc").await.unwrap();
        assert!(ok.success);
        let bad = monitor.provision(&request("US", "projects/p/keys/k"), "svc").await.unwrap();
        assert!(!bad.success);
        let no_key = monitor.provision(&request("EU", ""), "svc").await.unwrap();
        assert!(!no_key.success);

        let events = encryption_events(&recorder).await;
        assert_eq!(events.len(), 3);
        let successes: Vec<bool> = events
            .iter()
            .map(|e| match &e.detail {
                EventDetail::Encryption { success, .. } => *success,
                _ => panic!("unexpected detail"),
            })
            .collect();
        assert_eq!(successes, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_store_error_recorded_then_returned() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let monitor = EncryptionMonitor::new(Arc::new(BrokenStore), Auditor::new(recorder.clone()));
        let result = monitor.provision(&request("EU", "k"), "svc").await;
        assert!(result.is_err());
        assert_eq!(encryption_events(&recorder).await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_not_recorded() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let monitor = EncryptionMonitor::new(
            Arc::new(SimulatedStore::default()),
            Auditor::new(recorder.clone()),
        );
        let mut req = request("EU", "k");
        req.dataset_id = " ".into();
        assert!(matches!(
            monitor.provision(&req, "svc").await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(recorder.len().await, 0);
    }
}
