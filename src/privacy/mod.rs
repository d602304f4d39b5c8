//! Sensitive-data detection and de-identification
//!
//! - Regex pattern detection with longest-match overlap resolution
//! - Pluggable detector backends (local patterns or a remote service)
//!   with bounded timeouts and local fallback
//! - Per-category MASK / REDACT / TOKENIZE transformation
//! - Keyed, reversible tokenization

pub mod backend;
pub mod detector;
pub mod tokenizer;
pub mod transform;

pub use backend::{
    DetectionReport, Detector, DetectorBackend, LocalBackend, RemoteBackend,
    DEFAULT_DETECT_TIMEOUT,
};
pub use detector::{default_patterns, Category, Finding, PatternDetector, PatternSpec, Span};
pub use tokenizer::{TokenizeKey, Tokenizer};
pub use transform::{
    TransformAction, TransformEngine, TransformRecord, Transformed, TransformationRule,
};
