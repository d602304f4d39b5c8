//! Prompt guardrails
//!
//! Screens inbound prompts against an ordered rule set before any further
//! processing. A block is a business outcome carried in [`Decision`], never
//! an error.

pub mod evaluator;

pub use evaluator::{
    default_rules, Decision, GuardrailAction, GuardrailEvaluator, GuardrailOptions, GuardrailRule,
    Outcome, RuleKind, Severity,
};
