//! Ordered guardrail evaluation
//!
//! Rules are checked top to bottom. The first matching rule that blocks
//! (action `BLOCK`, or severity `CRITICAL` when escalation is on) ends the
//! evaluation; otherwise every matching `ALLOW_WITH_FLAG` rule accumulates
//! and the highest-severity flag is reported.

use crate::audit::{Auditor, EventDetail, EventType, NewEvent};
use crate::error::{Error, Result};
use crate::privacy::detector::matches_empty;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Rule severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "critical")]
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailAction {
    #[serde(alias = "allow_with_flag", alias = "flag")]
    AllowWithFlag,
    #[serde(alias = "block")]
    Block,
}

/// How `pattern` is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    #[default]
    Literal,
    Regex,
}

/// One ordered guardrail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailRule {
    /// Identifier recorded in audit events; `rule-<n>` when left empty
    #[serde(default)]
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub kind: RuleKind,
    pub severity: Severity,
    pub action: GuardrailAction,
}

impl GuardrailRule {
    pub fn literal(id: &str, pattern: &str, severity: Severity, action: GuardrailAction) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            kind: RuleKind::Literal,
            severity,
            action,
        }
    }

    pub fn regex(id: &str, pattern: &str, severity: Severity, action: GuardrailAction) -> Self {
        Self {
            kind: RuleKind::Regex,
            ..Self::literal(id, pattern, severity, action)
        }
    }
}

/// Built-in rules covering common prompt-injection phrasing
pub fn default_rules() -> Vec<GuardrailRule> {
    use GuardrailAction::*;
    use Severity::*;
    vec![
        GuardrailRule::regex(
            "role-override",
            r"(?i)\b(?:ignore|disregard|forget|override)\s+(?:all\s+)?(?:previous|prior|your)\s+instructions\b",
            Critical,
            Block,
        ),
        GuardrailRule::regex(
            "prompt-extraction",
            r"(?i)\b(?:show|reveal|print|repeat|leak)\s+(?:me\s+)?your\s+(?:system\s+)?(?:prompt|instructions)\b",
            High,
            Block,
        ),
        GuardrailRule::regex(
            "delimiter-injection",
            r"(?i)</s>|<\|(?:endoftext|im_start|im_end)\|>|<</?sys>>|\[/?inst\]",
            High,
            Block,
        ),
        GuardrailRule::literal("developer-mode", "developer mode", High, Block),
        GuardrailRule::literal("safety-bypass", "bypass your safety", High, Block),
        GuardrailRule::literal("persona-switch", "you are now", Medium, AllowWithFlag),
        GuardrailRule::literal("system-prefix", "system:", Low, AllowWithFlag),
    ]
}

/// Evaluator switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailOptions {
    /// Literal terms match case-sensitively
    pub case_sensitive_literals: bool,
    /// CRITICAL matches block regardless of their action
    pub escalate_critical: bool,
    /// Also match rules against base64 payloads decoded from the prompt
    pub inspect_encoded: bool,
}

impl Default for GuardrailOptions {
    fn default() -> Self {
        Self {
            case_sensitive_literals: false,
            escalate_critical: true,
            inspect_encoded: false,
        }
    }
}

/// Decision outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Allow,
    Flag,
    Block,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Flag => write!(f, "FLAG"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// Result of evaluating one prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    /// Blocking rule, or the highest-severity flag
    pub matched_rule: Option<String>,
    pub severity: Option<Severity>,
    /// Every flag rule that matched before evaluation stopped
    pub flagged_rules: Vec<String>,
    pub rationale: String,
    /// Whether the decision's audit event was persisted
    #[serde(skip)]
    pub audit_ok: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            outcome: Outcome::Allow,
            matched_rule: None,
            severity: None,
            flagged_rules: Vec::new(),
            rationale: "No guardrail rule matched".to_string(),
            audit_ok: true,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.outcome == Outcome::Block
    }
}

struct CompiledRule {
    id: String,
    regex: Regex,
    severity: Severity,
    action: GuardrailAction,
}

fn base64_block_regex() -> Option<&'static Regex> {
    static BASE64_RE: OnceLock<Option<Regex>> = OnceLock::new();
    BASE64_RE
        .get_or_init(|| Regex::new(r"[A-Za-z0-9+/]{20,}={0,2}").ok())
        .as_ref()
}

/// Evaluates prompts against an immutable, ordered rule set
pub struct GuardrailEvaluator {
    rules: Vec<CompiledRule>,
    options: GuardrailOptions,
    auditor: Auditor,
}

impl GuardrailEvaluator {
    /// Compile the rule set. Invalid or empty-matching patterns are
    /// configuration errors.
    pub fn new(rules: Vec<GuardrailRule>, options: GuardrailOptions, auditor: Auditor) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());

        for (index, rule) in rules.into_iter().enumerate() {
            let id = if rule.id.trim().is_empty() {
                format!("rule-{}", index + 1)
            } else {
                rule.id.trim().to_string()
            };
            if !seen.insert(id.clone()) {
                return Err(Error::Config(format!("Duplicate guardrail rule id '{}'", id)));
            }

            let source = match rule.kind {
                RuleKind::Literal => {
                    if rule.pattern.is_empty() {
                        return Err(Error::Config(format!(
                            "Guardrail rule '{}' has an empty literal",
                            id
                        )));
                    }
                    let escaped = regex::escape(&rule.pattern);
                    if options.case_sensitive_literals {
                        escaped
                    } else {
                        format!("(?i){}", escaped)
                    }
                }
                RuleKind::Regex => rule.pattern.clone(),
            };

            let regex = Regex::new(&source).map_err(|e| {
                Error::Config(format!("Invalid regex in guardrail rule '{}': {}", id, e))
            })?;
            if matches_empty(&regex) {
                return Err(Error::Config(format!(
                    "Guardrail rule '{}' matches the empty string",
                    id
                )));
            }

            compiled.push(CompiledRule {
                id,
                regex,
                severity: rule.severity,
                action: rule.action,
            });
        }

        Ok(Self {
            rules: compiled,
            options,
            auditor,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Decide without recording anything.
    pub fn decide(&self, prompt: &str) -> Decision {
        let decoded = if self.options.inspect_encoded {
            decoded_payloads(prompt)
        } else {
            Vec::new()
        };
        let matches = |rule: &CompiledRule| {
            rule.regex.is_match(prompt) || decoded.iter().any(|d| rule.regex.is_match(d))
        };

        let mut flags: Vec<&CompiledRule> = Vec::new();
        for rule in &self.rules {
            if !matches(rule) {
                continue;
            }
            let blocks = rule.action == GuardrailAction::Block
                || (self.options.escalate_critical && rule.severity == Severity::Critical);
            if blocks {
                return Decision {
                    outcome: Outcome::Block,
                    matched_rule: Some(rule.id.clone()),
                    severity: Some(rule.severity),
                    flagged_rules: flags.iter().map(|r| r.id.clone()).collect(),
                    rationale: format!("Blocked by rule '{}' ({})", rule.id, rule.severity),
                    audit_ok: true,
                };
            }
            flags.push(rule);
        }

        // Highest severity wins; the earliest rule among equals
        let Some(top) = flags
            .iter()
            .copied()
            .reduce(|best, r| if r.severity > best.severity { r } else { best })
        else {
            return Decision::allow();
        };

        Decision {
            outcome: Outcome::Flag,
            matched_rule: Some(top.id.clone()),
            severity: Some(top.severity),
            flagged_rules: flags.iter().map(|r| r.id.clone()).collect(),
            rationale: format!(
                "Flagged by {} rule(s); highest severity {} from '{}'",
                flags.len(),
                top.severity,
                top.id
            ),
            audit_ok: true,
        }
    }

    /// Decide and record CONTENT_BLOCKED / CONTENT_FLAGGED.
    pub async fn evaluate(&self, prompt: &str, subject: &str) -> Decision {
        let mut decision = self.decide(prompt);

        let event_type = match decision.outcome {
            Outcome::Allow => return decision,
            Outcome::Block => {
                tracing::warn!(
                    subject,
                    rule_id = decision.matched_rule.as_deref().unwrap_or_default(),
                    "Prompt blocked by guardrail"
                );
                EventType::ContentBlocked
            }
            Outcome::Flag => {
                tracing::info!(
                    subject,
                    rule_id = decision.matched_rule.as_deref().unwrap_or_default(),
                    flag_count = decision.flagged_rules.len(),
                    "Prompt flagged by guardrail"
                );
                EventType::ContentFlagged
            }
        };

        let rule_id = decision.matched_rule.clone().unwrap_or_default();
        let mut matched_rules = decision.flagged_rules.clone();
        if !matched_rules.contains(&rule_id) {
            matched_rules.push(rule_id.clone());
        }

        let event = NewEvent::new(
            event_type,
            subject,
            EventDetail::Guardrail {
                rule_id,
                severity: decision
                    .severity
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                matched_rules,
            },
        );
        decision.audit_ok = self.auditor.emit(vec![event]).await;
        decision
    }
}

/// Decode base64 blocks in `prompt` that yield UTF-8 text.
fn decoded_payloads(prompt: &str) -> Vec<String> {
    let Some(re) = base64_block_regex() else {
        return Vec::new();
    };
    re.find_iter(prompt)
        .filter_map(|m| {
            base64::engine::general_purpose::STANDARD
                .decode(m.as_str())
                .ok()
        })
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .collect()
}
