//! GovShield configuration management
//!
//! Loaded from TOML. Every section is optional and falls back to defaults:
//!
//! ```toml
//! [detection]
//! categories = ["EMAIL", "PHONE", "NATIONAL_ID", "CREDENTIAL"]
//! backend = "local"
//!
//! [transformation.rules]
//! NATIONAL_ID = { action = "mask", placeholder = "#" }
//! EMAIL = { action = "redact" }
//!
//! [[guardrails.rules]]
//! id = "no-passwords"
//! pattern = "password"
//! severity = "CRITICAL"
//! action = "BLOCK"
//! ```

use crate::error::{Error, Result};
use crate::external::AccessGrant;
use crate::guardrail::{default_rules, GuardrailOptions, GuardrailRule};
use crate::privacy::detector::{default_patterns, Category, PatternDetector, PatternSpec};
use crate::privacy::tokenizer::TokenizeKey;
use crate::privacy::transform::{TransformAction, TransformationRule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for the tokenize key when none is inline
pub const DEFAULT_TOKENIZE_KEY_ENV: &str = "GOVSHIELD_TOKENIZE_KEY";

/// Main GovShield configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Sensitive-data detection
    pub detection: DetectionConfig,

    /// De-identification rules
    pub transformation: TransformationConfig,

    /// Prompt guardrails
    pub guardrails: GuardrailsConfig,

    /// Audit log backend
    pub audit: AuditConfig,

    /// Access authority and encrypted store simulators
    pub collaborators: CollaboratorsConfig,

    /// HTTP server
    pub server: ServerConfig,
}

/// Which detector answers first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackendKind {
    #[default]
    #[serde(alias = "LOCAL")]
    Local,
    #[serde(alias = "REMOTE")]
    Remote,
}

/// User-registered pattern class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPattern {
    /// Category name, referenced as `CUSTOM:<name>`
    pub name: String,
    pub pattern: String,
}

/// Remote classification service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDetectorConfig {
    /// Base URL; requests go to `{endpoint}/detect`
    pub endpoint: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

/// Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Categories scanned when a request names none
    #[serde(default = "default_categories")]
    pub categories: BTreeSet<Category>,

    /// Tie-break order for equal-length overlapping matches
    #[serde(default = "default_priority")]
    pub priority: Vec<Category>,

    /// Additional pattern classes
    #[serde(default)]
    pub custom_patterns: Vec<CustomPattern>,

    /// Primary backend
    #[serde(default)]
    pub backend: DetectorBackendKind,

    /// Remote backend settings (required when `backend = "remote"`)
    #[serde(default)]
    pub remote: Option<RemoteDetectorConfig>,

    /// Fall back to the local detector when the remote one fails
    #[serde(default = "default_true")]
    pub fallback_to_local: bool,
}

fn default_categories() -> BTreeSet<Category> {
    Category::builtin().into_iter().collect()
}

fn default_priority() -> Vec<Category> {
    Category::builtin().to_vec()
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            priority: default_priority(),
            custom_patterns: Vec::new(),
            backend: DetectorBackendKind::Local,
            remote: None,
            fallback_to_local: true,
        }
    }
}

impl DetectionConfig {
    /// Built-in patterns plus the custom classes
    pub fn pattern_specs(&self) -> Result<Vec<PatternSpec>> {
        let mut specs = default_patterns();
        for custom in &self.custom_patterns {
            let category: Category = format!("CUSTOM:{}", custom.name).parse()?;
            specs.push(PatternSpec::new(category, custom.pattern.clone()));
        }
        Ok(specs)
    }

    /// Compile the local pattern detector.
    pub fn build_detector(&self) -> Result<PatternDetector> {
        PatternDetector::new(self.pattern_specs()?, self.priority.clone())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(
            self.remote
                .as_ref()
                .map(|r| r.timeout_ms)
                .unwrap_or_else(default_timeout_ms),
        )
    }
}

/// Transformation configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct TransformationConfig {
    /// Category → action
    #[serde(default = "default_transform_rules")]
    pub rules: BTreeMap<Category, TransformAction>,

    /// Inline tokenize secret (prefer `tokenize_key_env`)
    #[serde(default, skip_serializing)]
    pub tokenize_key: Option<TokenizeKey>,

    /// Environment variable holding the tokenize secret
    #[serde(default)]
    pub tokenize_key_env: Option<String>,
}

fn default_transform_rules() -> BTreeMap<Category, TransformAction> {
    BTreeMap::from([
        (Category::Email, TransformAction::Redact),
        (Category::Phone, TransformAction::mask('#')),
        (Category::NationalId, TransformAction::mask('#')),
        (Category::Credential, TransformAction::Redact),
    ])
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            rules: default_transform_rules(),
            tokenize_key: None,
            tokenize_key_env: None,
        }
    }
}

impl std::fmt::Debug for TransformationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationConfig")
            .field("rules", &self.rules)
            .field("tokenize_key", &self.tokenize_key)
            .field("tokenize_key_env", &self.tokenize_key_env)
            .finish()
    }
}

impl TransformationConfig {
    pub fn rule_list(&self) -> Vec<TransformationRule> {
        self.rules
            .iter()
            .map(|(category, action)| TransformationRule::new(category.clone(), action.clone()))
            .collect()
    }

    pub fn uses_tokenize(&self) -> bool {
        self.rules.values().any(|a| matches!(a, TransformAction::Tokenize))
    }

    /// Resolve the tokenize secret.
    ///
    /// An inline key wins. Otherwise the named environment variable (or
    /// `GOVSHIELD_TOKENIZE_KEY`) is read, trying the exact name and then its
    /// upper-case form.
    pub fn resolve_tokenize_key(&self) -> Option<TokenizeKey> {
        if let Some(key) = &self.tokenize_key {
            return Some(key.clone());
        }
        let name = self
            .tokenize_key_env
            .as_deref()
            .unwrap_or(DEFAULT_TOKENIZE_KEY_ENV);
        std::env::var(name)
            .or_else(|_| std::env::var(name.to_uppercase()))
            .ok()
            .filter(|v| !v.is_empty())
            .map(TokenizeKey::new)
    }
}

/// Guardrail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Literal terms match case-sensitively
    #[serde(default)]
    pub case_sensitive_literals: bool,

    /// CRITICAL matches block regardless of their action
    #[serde(default = "default_true")]
    pub escalate_critical: bool,

    /// Also inspect base64 payloads in prompts
    #[serde(default)]
    pub inspect_encoded: bool,

    /// Ordered rule list
    #[serde(default = "default_rules")]
    pub rules: Vec<GuardrailRule>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            case_sensitive_literals: false,
            escalate_critical: true,
            inspect_encoded: false,
            rules: default_rules(),
        }
    }
}

impl GuardrailsConfig {
    pub fn options(&self) -> GuardrailOptions {
        GuardrailOptions {
            case_sensitive_literals: self.case_sensitive_literals,
            escalate_critical: self.escalate_critical,
            inspect_encoded: self.inspect_encoded,
        }
    }
}

/// Audit log backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackendKind {
    /// Process-lifetime log
    Memory,
    /// JSON Lines file
    #[default]
    File,
}

/// Audit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub backend: AuditBackendKind,

    /// Log file (default `~/.govshield/audit/audit.jsonl`)
    pub path: Option<PathBuf>,

    /// Hard cap on stored events; appends beyond it fail
    pub max_events: Option<usize>,
}

/// Collaborator simulators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    /// Grants for the static access authority; everything else is denied
    pub access_grants: Vec<AccessGrant>,

    /// Locations the simulated store accepts (empty = any)
    pub store_locations: Vec<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18790,
            cors_origins: Vec::new(),
        }
    }
}

impl GovernanceConfig {
    /// Default config location (~/.govshield/config.toml)
    pub fn default_path() -> PathBuf {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".govshield")
            .join("config.toml")
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, else the default file if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Structural checks that need no secrets or network.
    ///
    /// Pattern and rule compilation errors surface when the engine is built.
    pub fn validate(&self) -> Result<()> {
        let detection = &self.detection;
        if detection.categories.is_empty() {
            return Err(Error::Config(
                "detection.categories must name at least one category".to_string(),
            ));
        }

        let mut known: BTreeSet<Category> = Category::builtin().into_iter().collect();
        for custom in &detection.custom_patterns {
            let category: Category = format!("CUSTOM:{}", custom.name).parse()?;
            if !known.insert(category.clone()) {
                return Err(Error::Config(format!(
                    "Custom pattern '{}' is declared twice",
                    custom.name
                )));
            }
        }

        let unknown = detection
            .categories
            .iter()
            .chain(detection.priority.iter())
            .chain(self.transformation.rules.keys())
            .find(|c| !known.contains(*c));
        if let Some(category) = unknown {
            return Err(Error::Config(format!(
                "Category {} has no pattern; declare it under detection.custom_patterns",
                category
            )));
        }

        if detection.backend == DetectorBackendKind::Remote {
            let remote = detection.remote.as_ref().ok_or_else(|| {
                Error::Config("detection.backend = \"remote\" requires [detection.remote]".to_string())
            })?;
            if remote.endpoint.trim().is_empty() {
                return Err(Error::Config("detection.remote.endpoint is empty".to_string()));
            }
            if remote.timeout_ms == 0 {
                return Err(Error::Config(
                    "detection.remote.timeout_ms must be positive".to_string(),
                ));
            }
        }

        if self.audit.max_events == Some(0) {
            return Err(Error::Config("audit.max_events must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::{GuardrailAction, Severity};

    #[test]
    fn test_default_config() {
        let config = GovernanceConfig::default();
        assert_eq!(config.detection.categories.len(), 4);
        assert_eq!(config.detection.backend, DetectorBackendKind::Local);
        assert!(config.detection.fallback_to_local);
        assert!(config.guardrails.escalate_critical);
        assert!(!config.guardrails.rules.is_empty());
        assert!(!config.transformation.uses_tokenize());
        assert_eq!(config.audit.backend, AuditBackendKind::File);
        config.validate().unwrap();
        config.detection.build_detector().unwrap();
    }

    #[test]
    fn test_parse_full_document() {
        let config = GovernanceConfig::from_toml(
            r##"
            [detection]
            categories = ["EMAIL", "NATIONAL_ID", "CUSTOM:employee_id"]
            priority = ["CUSTOM:employee_id", "NATIONAL_ID", "EMAIL"]
            backend = "remote"
            fallback_to_local = false

            [[detection.custom_patterns]]
            name = "employee_id"
            pattern = 'EMP-\d{6}'

            [detection.remote]
            endpoint = "http://classifier.internal:9000"
            timeout_ms = 500

            [transformation]
            tokenize_key_env = "HR_TOKEN_KEY"

            [transformation.rules]
            NATIONAL_ID = { action = "mask", placeholder = "#" }
            "CUSTOM:employee_id" = { action = "tokenize" }

            [guardrails]
            case_sensitive_literals = true

            [[guardrails.rules]]
            id = "no-passwords"
            pattern = "password"
            severity = "CRITICAL"
            action = "BLOCK"

            [audit]
            backend = "memory"
            max_events = 1000

            [[collaborators.access_grants]]
            principal = "analyst"
            resource = "dataset/sales/*"
            permission = "read"
            "##,
        )
        .unwrap();

        assert_eq!(config.detection.backend, DetectorBackendKind::Remote);
        assert_eq!(config.detection.remote_timeout(), Duration::from_millis(500));
        assert!(config
            .detection
            .categories
            .contains(&Category::Custom("employee_id".into())));
        assert!(config.transformation.uses_tokenize());
        assert_eq!(
            config.transformation.rules[&Category::NationalId],
            TransformAction::mask('#')
        );
        assert_eq!(config.guardrails.rules.len(), 1);
        assert_eq!(config.guardrails.rules[0].severity, Severity::Critical);
        assert_eq!(config.guardrails.rules[0].action, GuardrailAction::Block);
        assert!(config.guardrails.options().case_sensitive_literals);
        assert_eq!(config.audit.backend, AuditBackendKind::Memory);
        assert_eq!(config.collaborators.access_grants.len(), 1);

        let detector = config.detection.build_detector().unwrap();
        let findings = detector
            .detect("badge EMP-123456", &config.detection.categories)
            .unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_unknown_category_rejected() {
        let err = GovernanceConfig::from_toml(
            r#"
            [detection]
            categories = ["EMAIL", "CUSTOM:badge"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = GovernanceConfig::from_toml(
            r#"
            [detection]
            categories = ["ZIP_CODE"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_empty_categories_rejected() {
        let err = GovernanceConfig::from_toml("[detection]\ncategories = []\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_remote_requires_endpoint() {
        let err = GovernanceConfig::from_toml("[detection]\nbackend = \"remote\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_custom_regex_fails_at_build() {
        let config = GovernanceConfig::from_toml(
            r#"
            [[detection.custom_patterns]]
            name = "broken"
            pattern = "(unclosed"
            "#,
        )
        .unwrap();
        assert!(matches!(config.detection.build_detector(), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_tokenize_key_from_env() {
        let mut config = TransformationConfig {
            tokenize_key_env: Some("govshield_test_tokenize_key_a1".to_string()),
            ..Default::default()
        };
        assert!(config.resolve_tokenize_key().is_none());

        std::env::set_var("GOVSHIELD_TEST_TOKENIZE_KEY_A1", "from-env-0123456789");
        let key = config.resolve_tokenize_key().unwrap();
        assert_eq!(key.expose(), "from-env-0123456789");
        std::env::remove_var("GOVSHIELD_TEST_TOKENIZE_KEY_A1");

        config.tokenize_key = Some(TokenizeKey::new("inline-0123456789abc"));
        assert_eq!(config.resolve_tokenize_key().unwrap().expose(), "inline-0123456789abc");
    }

    #[test]
    fn test_inline_key_never_serialized() {
        let mut config = GovernanceConfig::default();
        config.transformation.tokenize_key = Some(TokenizeKey::new("super-secret-value-123"));
        let toml = config.to_toml().unwrap();
        assert!(!toml.contains("super-secret-value-123"));
        assert!(!format!("{:?}", config).contains("super-secret-value-123"));
    }

    #[test]
    fn test_round_trip_default() {
        let toml = GovernanceConfig::default().to_toml().unwrap();
        let parsed = GovernanceConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.detection.categories, GovernanceConfig::default().detection.categories);
        assert_eq!(parsed.guardrails.rules, default_rules());
    }
}
