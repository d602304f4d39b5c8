//! GovShield - Governance policy engine for generative-AI data flows
//!
//! GovShield sits between an AI application and its data stores. It screens
//! prompts against guardrail rules, detects and de-identifies sensitive data,
//! and turns the resulting audit trail into per-framework compliance status.
//!
//! ## Architecture
//!
//! ```text
//!   inbound text
//!        │
//!        ▼
//! ┌──────────────────┐  BLOCK   ┌──────────────────────────────┐
//! │ Guardrail        ├─────────▶│                              │
//! │ Evaluator        │          │                              │
//! └────────┬─────────┘          │                              │
//!          ▼                    │        Audit Recorder        │
//! ┌──────────────────┐          │  (memory / JSONL, append-    │
//! │ Detector         ├─────────▶│   only, totally ordered)     │
//! │ local | remote   │          │                              │
//! └────────┬─────────┘          │                              │
//!          ▼ (persist)          │                              │
//! ┌──────────────────┐          │                              │
//! │ Transformation   ├─────────▶│                              │
//! │ mask/redact/tok  │          └──────────────┬───────────────┘
//! └──────────────────┘                         │ query(window)
//!                                              ▼
//!   access authority ──ACCESS_DENIED──▶   Compliance Aggregator
//!   encrypted store  ──ENCRYPTION_OP──▶   GDPR · HIPAA · PCI-DSS · CCPA
//! ```
//!
//! ## Modules
//!
//! - [`privacy`]: Pattern detection, detector backends, transformation, tokenization
//! - [`guardrail`]: Ordered prompt rules and decisions
//! - [`audit`]: Event model, recorders and the failure-aware [`audit::Auditor`]
//! - [`compliance`]: Windowed per-framework reports
//! - [`external`]: Access authority and encrypted store boundaries
//! - [`pipeline`]: The end-to-end screening flow
//! - [`api`]: HTTP surface
//! - [`config`]: Configuration management

pub mod api;
pub mod audit;
pub mod compliance;
pub mod config;
pub mod error;
pub mod external;
pub mod guardrail;
pub mod pipeline;
pub mod privacy;

pub use config::GovernanceConfig;
pub use error::{Error, Result};
pub use pipeline::{GovernanceEngine, ScreenOutcome, ScreenRequest};
