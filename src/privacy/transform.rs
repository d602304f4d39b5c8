//! De-identification of detected findings
//!
//! Each category maps to one action:
//! - `MASK`: overwrite matched characters with an ASCII placeholder, one
//!   placeholder per byte so length and offsets are kept (delimiters
//!   optionally kept)
//! - `REDACT`: replace the span with `[REDACTED:<CATEGORY>]`
//! - `TOKENIZE`: replace the span with a keyed, reversible token
//!
//! Edits are applied right-to-left so earlier offsets stay valid.

use crate::audit::{Auditor, EventDetail, EventType, NewEvent};
use crate::error::{Error, Result};
use crate::privacy::backend::DetectionReport;
use crate::privacy::detector::{Category, Finding, Span};
use crate::privacy::tokenizer::{TokenizeKey, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_placeholder() -> char {
    '*'
}

fn default_true() -> bool {
    true
}

/// What to do with a finding of a given category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransformAction {
    #[serde(alias = "MASK")]
    Mask {
        #[serde(default = "default_placeholder")]
        placeholder: char,
        /// Keep non-alphanumeric characters (`123-45-6789` → `###-##-####`)
        #[serde(default = "default_true")]
        preserve_delimiters: bool,
    },
    #[serde(alias = "REDACT")]
    Redact,
    #[serde(alias = "TOKENIZE")]
    Tokenize,
}

impl TransformAction {
    pub fn mask(placeholder: char) -> Self {
        Self::Mask {
            placeholder,
            preserve_delimiters: true,
        }
    }

    /// Whether output length can differ from the matched span
    pub fn changes_length(&self) -> bool {
        !matches!(self, Self::Mask { .. })
    }
}

impl std::fmt::Display for TransformAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mask { .. } => write!(f, "MASK"),
            Self::Redact => write!(f, "REDACT"),
            Self::Tokenize => write!(f, "TOKENIZE"),
        }
    }
}

/// Category → action binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRule {
    pub category: Category,
    #[serde(flatten)]
    pub action: TransformAction,
}

impl TransformationRule {
    pub fn new(category: Category, action: TransformAction) -> Self {
        Self { category, action }
    }
}

/// One applied edit. Never carries the original value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformRecord {
    /// Index into the findings passed to `transform`
    pub finding_index: usize,
    pub category: Category,
    pub action: String,
    /// Span in the original text
    pub span: Span,
    /// Byte length of the replacement
    pub replacement_len: usize,
}

/// Rewritten text plus the edit log
#[derive(Debug, Clone, Serialize)]
pub struct Transformed {
    pub text: String,
    pub log: Vec<TransformRecord>,
    /// Whether the PII_MASKED events were persisted
    #[serde(skip)]
    pub audit_ok: bool,
}

/// Applies per-category transformation rules.
///
/// Rules and key material are fixed at construction.
pub struct TransformEngine {
    rules: BTreeMap<Category, TransformAction>,
    tokenizer: Option<Tokenizer>,
    auditor: Auditor,
}

impl TransformEngine {
    /// Build the engine. TOKENIZE rules require `key`.
    pub fn new(
        rules: Vec<TransformationRule>,
        key: Option<&TokenizeKey>,
        auditor: Auditor,
    ) -> Result<Self> {
        let mut table = BTreeMap::new();
        for rule in rules {
            if let TransformAction::Mask { placeholder, .. } = &rule.action {
                if !placeholder.is_ascii() || placeholder.is_ascii_control() {
                    return Err(Error::Config(format!(
                        "Mask placeholder for {} must be a printable ASCII character",
                        rule.category
                    )));
                }
            }
            if table.insert(rule.category.clone(), rule.action).is_some() {
                return Err(Error::Config(format!(
                    "Duplicate transformation rule for category {}",
                    rule.category
                )));
            }
        }

        let needs_key = table.values().any(|a| matches!(a, TransformAction::Tokenize));
        let tokenizer = match key {
            Some(key) => Some(Tokenizer::new(key)?),
            None if needs_key => {
                return Err(Error::Config(
                    "TOKENIZE rule configured but no tokenize key is set".to_string(),
                ))
            }
            None => None,
        };

        Ok(Self {
            rules: table,
            tokenizer,
            auditor,
        })
    }

    pub fn rule_for(&self, category: &Category) -> Option<&TransformAction> {
        self.rules.get(category)
    }

    pub fn rules(&self) -> impl Iterator<Item = (&Category, &TransformAction)> {
        self.rules.iter()
    }

    /// Rewrite `text`, acting on every finding whose category has a rule.
    ///
    /// Pure: no audit side effects. Findings must be in bounds and
    /// non-overlapping.
    pub fn transform(&self, text: &str, findings: &[Finding]) -> Result<Transformed> {
        check_findings(text, findings)?;

        let mut order: Vec<usize> = (0..findings.len())
            .filter(|&i| self.rules.contains_key(&findings[i].category))
            .collect();
        order.sort_by(|&a, &b| findings[b].span.start.cmp(&findings[a].span.start));

        let mut out = text.to_string();
        let mut log = Vec::with_capacity(order.len());
        for index in order {
            let finding = &findings[index];
            let Some(action) = self.rules.get(&finding.category) else {
                continue;
            };
            let original = &text[finding.span.start..finding.span.end];
            let replacement = self.replacement(&finding.category, action, original)?;
            out.replace_range(finding.span.start..finding.span.end, &replacement);
            log.push(TransformRecord {
                finding_index: index,
                category: finding.category.clone(),
                action: action.to_string(),
                span: finding.span,
                replacement_len: replacement.len(),
            });
        }
        log.reverse();

        Ok(Transformed {
            text: out,
            log,
            audit_ok: true,
        })
    }

    /// Transform a detection report's text and record one PII_MASKED event
    /// per applied category rule, in a single recorder call.
    pub async fn apply(&self, text: &str, report: &DetectionReport, subject: &str) -> Result<Transformed> {
        let mut transformed = self.transform(text, &report.findings)?;

        let mut per_category: BTreeMap<&Category, Vec<String>> = BTreeMap::new();
        for record in &transformed.log {
            per_category
                .entry(&record.category)
                .or_default()
                .push(report.finding_id(record.finding_index));
        }

        let events: Vec<NewEvent> = per_category
            .into_iter()
            .filter_map(|(category, finding_ids)| {
                let action = self.rules.get(category)?;
                Some(NewEvent::new(
                    EventType::PiiMasked,
                    subject,
                    EventDetail::Transformation {
                        scan_id: report.scan_id.clone(),
                        category: category.to_string(),
                        action: action.to_string(),
                        count: finding_ids.len(),
                        finding_ids,
                    },
                ))
            })
            .collect();

        tracing::debug!(
            subject,
            scan_id = %report.scan_id,
            applied = transformed.log.len(),
            rules = events.len(),
            "Transformation applied"
        );

        transformed.audit_ok = self.auditor.emit(events).await;
        Ok(transformed)
    }

    /// Reverse TOKENIZE replacements made with this engine's key.
    pub fn restore(&self, text: &str) -> Result<String> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            Error::Config("Restore requires a configured tokenize key".to_string())
        })?;
        tokenizer.restore(text)
    }

    fn replacement(&self, category: &Category, action: &TransformAction, original: &str) -> Result<String> {
        match action {
            TransformAction::Mask {
                placeholder,
                preserve_delimiters,
            } => {
                let mut masked = String::with_capacity(original.len());
                for c in original.chars() {
                    if *preserve_delimiters && !c.is_alphanumeric() {
                        masked.push(c);
                    } else {
                        // byte-for-byte so multibyte characters keep their width
                        masked.extend(std::iter::repeat(*placeholder).take(c.len_utf8()));
                    }
                }
                Ok(masked)
            }
            TransformAction::Redact => Ok(format!("[REDACTED:{}]", category.label())),
            TransformAction::Tokenize => {
                let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
                    Error::Config("TOKENIZE rule configured but no tokenize key is set".to_string())
                })?;
                tokenizer.tokenize(&category.label(), original)
            }
        }
    }
}

fn check_findings(text: &str, findings: &[Finding]) -> Result<()> {
    let mut spans: Vec<Span> = Vec::with_capacity(findings.len());
    for f in findings {
        let Span { start, end } = f.span;
        if start >= end
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            return Err(Error::InvalidInput(format!(
                "Finding span {}..{} does not fit the text",
                start, end
            )));
        }
        spans.push(f.span);
    }
    spans.sort_by_key(|s| s.start);
    if spans.windows(2).any(|w| w[0].overlaps(&w[1])) {
        return Err(Error::InvalidInput("Findings overlap".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::FailingRecorder;
    use crate::audit::{AuditRecorder, InMemoryRecorder, TimeRange};
    use crate::privacy::detector::PatternDetector;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const KEY: &str = "test-tokenize-key-0123456789";

    fn auditor() -> (Arc<InMemoryRecorder>, Auditor) {
        let recorder = Arc::new(InMemoryRecorder::new());
        let auditor = Auditor::new(recorder.clone());
        (recorder, auditor)
    }

    fn detect(text: &str) -> Vec<Finding> {
        let d = PatternDetector::with_defaults().unwrap();
        d.detect(text, &d.categories()).unwrap()
    }

    fn report(text: &str) -> DetectionReport {
        DetectionReport {
            scan_id: "scan-1".into(),
            findings: detect(text),
            degraded: false,
            backend: "local".into(),
            audit_ok: true,
        }
    }

    #[test]
    fn test_mask_preserves_delimiters() {
        let (_, auditor) = auditor();
        let engine = TransformEngine::new(
            vec![TransformationRule::new(Category::NationalId, TransformAction::mask('#'))],
            None,
            auditor,
        )
        .unwrap();
        let text = "SSN: 123-45-6789";
        let out = engine.transform(text, &detect(text)).unwrap();
        assert_eq!(out.text, "SSN: ###-##-####");
        assert_eq!(out.log.len(), 1);
        assert_eq!(out.log[0].action, "MASK");
    }

    #[test]
    fn test_mask_full_span_keeps_length() {
        let (_, auditor) = auditor();
        let mask = TransformAction::Mask {
            placeholder: 'X',
            preserve_delimiters: false,
        };
        let engine = TransformEngine::new(
            vec![
                TransformationRule::new(Category::Email, mask.clone()),
                TransformationRule::new(Category::Phone, mask),
            ],
            None,
            auditor,
        )
        .unwrap();

        let text = "Contact jane.doe@company.com at 555-867-5309 today";
        let findings = detect(text);
        let out = engine.transform(text, &findings).unwrap();
        assert_eq!(out.text.len(), text.len());
        for f in &findings {
            assert!(out.text[f.span.start..f.span.end].chars().all(|c| c == 'X'));
        }
        assert_eq!(&out.text[..8], "Contact ");
        assert!(out.text.ends_with(" today"));
    }

    #[test]
    fn test_mask_keeps_byte_length_of_non_ascii() {
        let (_, auditor) = auditor();
        let engine = TransformEngine::new(
            vec![TransformationRule::new(Category::Email, TransformAction::mask('#'))],
            None,
            auditor,
        )
        .unwrap();

        let text = "hi Zoë Smith";
        let findings = vec![Finding {
            category: Category::Email,
            span: Span::new(3, 7),
            matched_text: "Zoë".to_string(),
            confidence: 1.0,
        }];
        let out = engine.transform(text, &findings).unwrap();
        assert_eq!(out.text.len(), text.len());
        assert_eq!(out.text, "hi #### Smith");
        assert_eq!(&out.text[7..], &text[7..]);
    }

    #[test]
    fn test_non_ascii_placeholder_rejected() {
        let (_, auditor) = auditor();
        let result = TransformEngine::new(
            vec![TransformationRule::new(Category::Phone, TransformAction::mask('•'))],
            None,
            auditor,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_redact_right_to_left() {
        let (_, auditor) = auditor();
        let engine = TransformEngine::new(
            vec![
                TransformationRule::new(Category::Email, TransformAction::Redact),
                TransformationRule::new(Category::NationalId, TransformAction::Redact),
            ],
            None,
            auditor,
        )
        .unwrap();
        let text = "a@b.io and 123-45-6789 and c@d.org";
        let out = engine.transform(text, &detect(text)).unwrap();
        assert_eq!(
            out.text,
            "[REDACTED:EMAIL] and [REDACTED:NATIONAL_ID] and [REDACTED:EMAIL]"
        );
        let starts: Vec<_> = out.log.iter().map(|r| r.span.start).collect();
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_findings_without_rule_untouched() {
        let (_, auditor) = auditor();
        let engine = TransformEngine::new(
            vec![TransformationRule::new(Category::Email, TransformAction::Redact)],
            None,
            auditor,
        )
        .unwrap();
        let text = "call 555-867-5309";
        let out = engine.transform(text, &detect(text)).unwrap();
        assert_eq!(out.text, text);
        assert!(out.log.is_empty());
    }

    #[test]
    fn test_tokenize_requires_key() {
        let (_, auditor) = auditor();
        let result = TransformEngine::new(
            vec![TransformationRule::new(Category::Email, TransformAction::Tokenize)],
            None,
            auditor,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let (_, auditor) = auditor();
        let result = TransformEngine::new(
            vec![
                TransformationRule::new(Category::Email, TransformAction::Redact),
                TransformationRule::new(Category::Email, TransformAction::mask('*')),
            ],
            None,
            auditor,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_tokenize_deterministic_and_restorable() {
        let (_, auditor) = auditor();
        let key = TokenizeKey::new(KEY);
        let engine = TransformEngine::new(
            vec![TransformationRule::new(Category::Email, TransformAction::Tokenize)],
            Some(&key),
            auditor,
        )
        .unwrap();

        let text = "from a@b.io to c@d.org cc a@b.io";
        let out = engine.transform(text, &detect(text)).unwrap();
        let tokens: Vec<&str> = out.text.split(' ').filter(|w| w.starts_with("[TOK:")).collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], tokens[2]);
        assert_ne!(tokens[0], tokens[1]);
        assert_eq!(engine.restore(&out.text).unwrap(), text);
    }

    #[test]
    fn test_overlapping_findings_rejected() {
        let (_, auditor) = auditor();
        let engine = TransformEngine::new(vec![], None, auditor).unwrap();
        let f = |start, end| Finding {
            category: Category::Email,
            span: Span::new(start, end),
            matched_text: String::new(),
            confidence: 1.0,
        };
        let err = engine.transform("abcdefgh", &[f(0, 4), f(2, 6)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = engine.transform("abc", &[f(0, 10)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_apply_emits_one_event_per_rule_without_raw_values() {
        let (recorder, auditor) = auditor();
        let engine = TransformEngine::new(
            vec![
                TransformationRule::new(Category::Email, TransformAction::Redact),
                TransformationRule::new(Category::Phone, TransformAction::mask('*')),
            ],
            None,
            auditor,
        )
        .unwrap();

        let text = "a@b.io, c@d.org, 555-867-5309";
        let report = report(text);
        let out = engine.apply(text, &report, "req-9").await.unwrap();
        assert!(out.audit_ok);

        let events = recorder
            .query(TimeRange::until(Utc::now()), Some(&[EventType::PiiMasked]))
            .await
            .unwrap()
            .to_vec();
        assert_eq!(events.len(), 2);

        let mut ids: BTreeSet<String> = BTreeSet::new();
        for e in &events {
            ids.extend(e.detail.finding_ids().iter().cloned());
            let json = serde_json::to_string(e).unwrap();
            assert!(!json.contains("a@b.io"));
            assert!(!json.contains("555-867"));
        }
        assert_eq!(ids, report.finding_ids().into_iter().collect());
        // single batch: contiguous ids
        assert_eq!(events[1].event_id.0, events[0].event_id.0 + 1);
    }

    #[tokio::test]
    async fn test_apply_survives_audit_failure() {
        let engine = TransformEngine::new(
            vec![TransformationRule::new(Category::Email, TransformAction::Redact)],
            None,
            Auditor::new(Arc::new(FailingRecorder)),
        )
        .unwrap();
        let text = "mail a@b.io";
        let out = engine.apply(text, &report(text), "req").await.unwrap();
        assert_eq!(out.text, "mail [REDACTED:EMAIL]");
        assert!(!out.audit_ok);
    }

    #[test]
    fn test_action_config_shape() {
        let rule: TransformationRule = toml::from_str(
            r##"
            category = "NATIONAL_ID"
            action = "mask"
            placeholder = "#"
            "##,
        )
        .unwrap();
        assert_eq!(rule.action, TransformAction::mask('#'));
        let action: TransformAction = serde_json::from_str(r#"{"action":"REDACT"}"#).unwrap();
        assert_eq!(action, TransformAction::Redact);
    }
}
