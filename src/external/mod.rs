//! External collaborators
//!
//! The engine never implements IAM or encryption at rest. It talks to an
//! [`AccessAuthority`] and an [`EncryptedStore`] through narrow traits and
//! records the outcomes they report. The simulators here stand in for live
//! providers and are selected by configuration.

pub mod access;
pub mod store;

pub use access::{AccessAuthority, AccessDecision, AccessGate, AccessGrant, AccessVerdict, StaticAccessAuthority};
pub use store::{
    EncryptedStore, EncryptionMonitor, EncryptionOutcome, EncryptionRequest, SimulatedStore,
};
