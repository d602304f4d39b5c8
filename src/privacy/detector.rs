//! Pattern detector for sensitive-data categories
//!
//! Runs one regex pass per active category, then resolves overlapping
//! candidates: the longer match wins, ties are broken by the configured
//! category priority. Offsets are byte offsets into the scanned text.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Sensitive-data category
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    Email,
    Phone,
    NationalId,
    Credential,
    /// User-registered pattern class, rendered as `CUSTOM:<name>`
    Custom(String),
}

impl Category {
    /// The four built-in categories, in default priority order.
    pub fn builtin() -> [Category; 4] {
        [
            Category::NationalId,
            Category::Credential,
            Category::Email,
            Category::Phone,
        ]
    }

    /// Label used inside redaction and token markers (`EMAIL`, `EMPLOYEE_ID`).
    pub fn label(&self) -> String {
        match self {
            Category::Custom(name) => name.to_uppercase(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "EMAIL"),
            Self::Phone => write!(f, "PHONE"),
            Self::NationalId => write!(f, "NATIONAL_ID"),
            Self::Credential => write!(f, "CREDENTIAL"),
            Self::Custom(name) => write!(f, "CUSTOM:{}", name),
        }
    }
}

const CUSTOM_PREFIX: &str = "CUSTOM:";

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        match upper.as_str() {
            "EMAIL" => Ok(Self::Email),
            "PHONE" => Ok(Self::Phone),
            "NATIONAL_ID" => Ok(Self::NationalId),
            "CREDENTIAL" => Ok(Self::Credential),
            _ => {
                let trimmed = s.trim();
                let name = trimmed
                    .get(..CUSTOM_PREFIX.len())
                    .filter(|prefix| prefix.eq_ignore_ascii_case(CUSTOM_PREFIX))
                    .map(|_| &trimmed[CUSTOM_PREFIX.len()..])
                    .ok_or_else(|| Error::Config(format!("Unknown category: {}", s)))?;
                validate_custom_name(name)?;
                Ok(Self::Custom(name.to_lowercase()))
            }
        }
    }
}

impl TryFrom<String> for Category {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.to_string()
    }
}

fn validate_custom_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Config(format!(
            "Invalid custom category name '{}': use letters, digits, '_' or '-'",
            name
        )));
    }
    Ok(())
}

/// Half-open byte range `[start, end)` into the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One detected sensitive-data occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub span: Span,
    pub matched_text: String,
    /// Always 1.0 for deterministic pattern rules
    pub confidence: f64,
}

/// Pattern definition as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub category: Category,
    pub pattern: String,
}

impl PatternSpec {
    pub fn new(category: Category, pattern: impl Into<String>) -> Self {
        Self {
            category,
            pattern: pattern.into(),
        }
    }
}

/// Built-in patterns for the four standard categories
pub fn default_patterns() -> Vec<PatternSpec> {
    vec![
        PatternSpec::new(
            Category::Email,
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        ),
        PatternSpec::new(
            Category::Phone,
            r"(?:\+?1[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b",
        ),
        PatternSpec::new(Category::NationalId, r"\b\d{3}-\d{2}-\d{4}\b"),
        PatternSpec::new(Category::Credential, r"\bAKIA[0-9A-Z]{16}\b"),
        PatternSpec::new(Category::Credential, r"\b(?:sk|pk|rk)-[A-Za-z0-9_-]{16,}"),
        PatternSpec::new(Category::Credential, r"\bgh[pousr]_[A-Za-z0-9]{36}\b"),
        PatternSpec::new(
            Category::Credential,
            r"(?i)\b(?:password|passwd|pwd|secret|api[_-]?key|token)\s*[:=]\s*\S+",
        ),
        PatternSpec::new(
            Category::Credential,
            r"-----BEGIN (?:RSA |EC |OPENSSH )?PRIVATE KEY-----",
        ),
    ]
}

/// Sample text used to catch patterns that produce zero-width matches in real text
const EMPTY_SAMPLE: &str = "a Z 0 _ - @ . \n";

/// Whether `re` can produce a zero-width match.
pub(crate) fn matches_empty(re: &Regex) -> bool {
    re.is_match("") || re.find_iter(EMPTY_SAMPLE).any(|m| m.as_str().is_empty())
}

struct CompiledPattern {
    category: Category,
    regex: Regex,
}

/// Local, deterministic sensitive-data detector
///
/// Holds only immutable pattern tables, so a single instance can be shared
/// across any number of concurrent scans.
pub struct PatternDetector {
    patterns: Vec<CompiledPattern>,
    priority: Vec<Category>,
}

impl PatternDetector {
    /// Compile the given patterns.
    ///
    /// Malformed regexes and patterns that can match the empty string are
    /// rejected here, never at scan time.
    pub fn new(specs: Vec<PatternSpec>, priority: Vec<Category>) -> Result<Self> {
        let patterns = specs
            .into_iter()
            .map(|spec| {
                let regex = Regex::new(&spec.pattern).map_err(|e| {
                    Error::Config(format!(
                        "Invalid regex pattern for category '{}': {}",
                        spec.category, e
                    ))
                })?;
                if matches_empty(&regex) {
                    return Err(Error::Config(format!(
                        "Pattern for category '{}' can match the empty string",
                        spec.category
                    )));
                }
                Ok(CompiledPattern {
                    category: spec.category,
                    regex,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns, priority })
    }

    /// Detector with the built-in patterns and default priority.
    pub fn with_defaults() -> Result<Self> {
        Self::new(default_patterns(), Category::builtin().to_vec())
    }

    /// Categories that have at least one configured pattern
    pub fn categories(&self) -> BTreeSet<Category> {
        self.patterns.iter().map(|p| p.category.clone()).collect()
    }

    /// Tie-break rank of a category; lower wins.
    pub fn rank(&self, category: &Category) -> usize {
        self.priority
            .iter()
            .position(|c| c == category)
            .unwrap_or(self.priority.len())
    }

    /// Detect findings for the active categories.
    ///
    /// Output is sorted by start offset and mutually non-overlapping.
    pub fn detect(&self, text: &str, categories: &BTreeSet<Category>) -> Result<Vec<Finding>> {
        self.scan(text, categories, None)
    }

    /// Like [`detect`](Self::detect) but checks `cancel` between category
    /// passes. A cancelled scan yields `Error::Cancelled` and no findings.
    pub fn detect_cancellable(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>> {
        self.scan(text, categories, Some(cancel))
    }

    fn scan(
        &self,
        text: &str,
        categories: &BTreeSet<Category>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Finding>> {
        self.check_categories(categories)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for category in categories {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled);
            }
            for pattern in self.patterns.iter().filter(|p| &p.category == category) {
                for m in pattern.regex.find_iter(text) {
                    if m.as_str().is_empty() {
                        continue;
                    }
                    candidates.push(Finding {
                        category: category.clone(),
                        span: Span::new(m.start(), m.end()),
                        matched_text: m.as_str().to_string(),
                        confidence: 1.0,
                    });
                }
            }
        }
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        Ok(resolve_overlaps(candidates, |c| self.rank(c)))
    }

    /// Reject empty or unknown category sets.
    pub fn check_categories(&self, categories: &BTreeSet<Category>) -> Result<()> {
        if categories.is_empty() {
            return Err(Error::InvalidInput("Category set is empty".to_string()));
        }
        if let Some(unknown) = categories
            .iter()
            .find(|c| !self.patterns.iter().any(|p| &p.category == *c))
        {
            return Err(Error::InvalidInput(format!(
                "No pattern configured for category {}",
                unknown
            )));
        }
        Ok(())
    }
}

/// Keep a non-overlapping subset of candidates.
///
/// Longest match wins; equal lengths fall back to category rank, then to the
/// earlier start. Result is sorted by start offset.
pub(crate) fn resolve_overlaps<F>(mut candidates: Vec<Finding>, rank: F) -> Vec<Finding>
where
    F: Fn(&Category) -> usize,
{
    candidates.sort_by(|a, b| {
        b.span
            .len()
            .cmp(&a.span.len())
            .then_with(|| rank(&a.category).cmp(&rank(&b.category)))
            .then_with(|| a.span.start.cmp(&b.span.start))
            .then_with(|| a.category.cmp(&b.category))
    });

    // start -> end of every accepted span
    let mut accepted: BTreeMap<usize, usize> = BTreeMap::new();
    let mut kept = Vec::new();

    for candidate in candidates {
        let span = candidate.span;
        let clashes_before = accepted
            .range(..=span.start)
            .next_back()
            .is_some_and(|(_, &end)| end > span.start);
        let clashes_after = accepted
            .range(span.start + 1..)
            .next()
            .is_some_and(|(&start, _)| start < span.end);
        if clashes_before || clashes_after {
            continue;
        }
        accepted.insert(span.start, span.end);
        kept.push(candidate);
    }

    kept.sort_by_key(|f| f.span.start);
    kept
}
