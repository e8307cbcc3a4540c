//! Validated firewall rules and application bindings.
//!
//! Documents from the configuration console are compiled here into
//! immutable values. Everything that can be wrong with a document is caught
//! at this point and reported as a [`ConfigError`]; the evaluator never sees
//! a rule it cannot run.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::document::{
    ApplicationDocument, EndpointDocument, RateLimitRuleDocument, RuleDocument, RuleSetDocument,
};
use crate::core::matchers::{MatcherError, PiiFieldSpec, PiiMatcher, StandardPiiField};
use crate::core::rate_limiter::MAX_PERIOD;
use crate::models::FailurePolicy;

/// Errors that reject a configuration document
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("rule '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: MatcherError,
    },
    #[error("rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
    #[error("rule set '{0}' contains duplicate rule id '{1}'")]
    DuplicateRule(String, String),
    #[error("application '{app}': {message}")]
    InvalidApplication { app: String, message: String },
    #[error("application '{app}' references unknown firewall config '{rule_set}'")]
    UnknownRuleSet { app: String, rule_set: String },
    #[error("firewall config '{rule_set}' is still used by application '{app}'")]
    RuleSetInUse { rule_set: String, app: String },
    #[error("{0} '{1}' does not exist")]
    NotFound(&'static str, String),
    #[error("duplicate {0} id '{1}'")]
    DuplicateId(&'static str, String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Detector a rule runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    PromptInjection,
    PiiInput,
    PiiOutput,
    ToxicContent,
    RateLimit,
    LengthLimit,
    LanguageDetect,
    CodeDetect,
}

impl RuleKind {
    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "PromptInjection" | "prompt_injection" => Self::PromptInjection,
            "PiiInput" | "pii_input" => Self::PiiInput,
            "PiiOutput" | "pii_output" => Self::PiiOutput,
            "ToxicContent" | "toxic_content" => Self::ToxicContent,
            "RateLimit" | "rate_limit" | "rate_limiting" => Self::RateLimit,
            "LengthLimit" | "length_limit" | "long_message" => Self::LengthLimit,
            "LanguageDetect" | "language_detect" | "non_allowed_lang" => Self::LanguageDetect,
            "CodeDetect" | "code_detect" | "code_detected" => Self::CodeDetect,
            _ => return None,
        };
        Some(kind)
    }

    /// Score-based kinds read `sensitivity`; the others ignore it
    pub fn has_sensitivity(&self) -> bool {
        matches!(self, Self::PromptInjection | Self::ToxicContent | Self::LanguageDetect)
    }

    pub fn applies_to(&self, direction: Direction) -> bool {
        match self {
            Self::PromptInjection | Self::PiiInput | Self::RateLimit => direction == Direction::Input,
            Self::PiiOutput => direction == Direction::Output,
            Self::ToxicContent | Self::LengthLimit | Self::LanguageDetect | Self::CodeDetect => true,
        }
    }
}

/// Which side of the LLM exchange a message is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Action a matched rule asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Alert,
    Deny,
}

impl RuleAction {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "alert" => Some(Self::Alert),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Sensitivity tier of a score-based rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Minimum score that triggers; higher sensitivity triggers on lower confidence
    pub fn threshold(&self) -> f64 {
        match self {
            Self::Low => 0.8,
            Self::Medium => 0.6,
            Self::High => 0.4,
        }
    }
}

/// Where an API key may be found on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    Header,
    Cookie,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyReference {
    pub source: KeySource,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBy {
    Ip,
    /// Tried in order; falls back to the client IP when none yields a value
    ApiKey(Vec<ApiKeyReference>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub id: String,
    pub requests_allowed: u64,
    pub period_seconds: u64,
    pub key_by: KeyBy,
}

/// Model id that applies a limit to every model
pub const ANY_MODEL: &str = "*";

/// Kind-specific configuration of a rule
#[derive(Debug)]
pub enum RulePayload {
    None,
    Pii(PiiMatcher),
    RateLimit(BTreeMap<String, Vec<RateLimitRule>>),
    LengthLimit { max_length: Option<usize> },
    Language { allowed_languages: Vec<String> },
}

/// A compiled rule. Fields other than `id`, `kind` and `enabled` are only
/// meaningful while the rule is enabled.
#[derive(Debug)]
pub struct RuleDefinition {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    pub enabled: bool,
    pub action: RuleAction,
    pub sensitivity: Option<Sensitivity>,
    pub failure_policy: Option<FailurePolicy>,
    pub payload: RulePayload,
}

impl RuleDefinition {
    pub fn compile(doc: &RuleDocument) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRule {
            rule: doc.id.clone(),
            message,
        };

        if doc.id.trim().is_empty() {
            return Err(invalid("rule id must not be empty".to_string()));
        }

        let kind = match &doc.kind {
            Some(kind) => RuleKind::parse(kind).ok_or_else(|| invalid(format!("unknown rule kind '{kind}'")))?,
            None => RuleKind::parse(&doc.id)
                .ok_or_else(|| invalid("rule has no kind and its id is not a known rule".to_string()))?,
        };

        let action = match doc.action.as_deref() {
            Some(action) => RuleAction::parse(action).ok_or_else(|| invalid(format!("unknown action '{action}'")))?,
            None if doc.enabled => return Err(invalid("enabled rule has no action".to_string())),
            None => RuleAction::Alert,
        };

        let sensitivity = match doc.sensitivity.as_deref() {
            Some(value) if kind.has_sensitivity() => Some(
                Sensitivity::parse(value).ok_or_else(|| invalid(format!("unknown sensitivity '{value}'")))?,
            ),
            _ => None,
        };
        if doc.enabled && kind.has_sensitivity() && sensitivity.is_none() {
            return Err(invalid("enabled score-based rule has no sensitivity".to_string()));
        }

        let failure_policy = match doc.failure_policy.as_deref() {
            Some("fail_open") | Some("FailOpen") => Some(FailurePolicy::FailOpen),
            Some("fail_closed") | Some("FailClosed") => Some(FailurePolicy::FailClosed),
            Some(other) => return Err(invalid(format!("unknown failure policy '{other}'"))),
            None => None,
        };

        let payload = match kind {
            RuleKind::PiiInput | RuleKind::PiiOutput => RulePayload::Pii(compile_pii(doc)?),
            RuleKind::RateLimit => RulePayload::RateLimit(compile_rate_limits(doc)?),
            RuleKind::LengthLimit => {
                if doc.max_length == Some(0) {
                    return Err(invalid("maxLength must be positive".to_string()));
                }
                RulePayload::LengthLimit {
                    max_length: doc.max_length.map(|v| v as usize),
                }
            }
            RuleKind::LanguageDetect => RulePayload::Language {
                allowed_languages: doc
                    .allowed_languages
                    .iter()
                    .map(|l| l.trim().to_ascii_lowercase())
                    .filter(|l| !l.is_empty())
                    .collect(),
            },
            _ => RulePayload::None,
        };

        Ok(Self {
            id: doc.id.clone(),
            name: doc.name.clone(),
            kind,
            enabled: doc.enabled,
            action,
            sensitivity,
            failure_policy,
            payload,
        })
    }
}

fn compile_pii(doc: &RuleDocument) -> Result<PiiMatcher, ConfigError> {
    let mut specs = Vec::new();
    for (name, enabled) in &doc.pii_types {
        let field = StandardPiiField::from_display_name(name).ok_or_else(|| ConfigError::InvalidRule {
            rule: doc.id.clone(),
            message: format!("unknown standard PII field '{name}'"),
        })?;
        if *enabled {
            specs.push(PiiFieldSpec::Standard { field });
        }
    }
    for custom in &doc.custom_pii {
        if custom.name.trim().is_empty() || custom.pattern.is_empty() {
            return Err(ConfigError::InvalidRule {
                rule: doc.id.clone(),
                message: "custom PII field needs a name and a pattern".to_string(),
            });
        }
        specs.push(PiiFieldSpec::Custom {
            name: custom.name.trim().to_string(),
            pattern: custom.pattern.clone(),
        });
    }
    PiiMatcher::compile(specs, doc.case_insensitive).map_err(|source| ConfigError::InvalidPattern {
        rule: doc.id.clone(),
        source,
    })
}

fn compile_rate_limits(doc: &RuleDocument) -> Result<BTreeMap<String, Vec<RateLimitRule>>, ConfigError> {
    let mut per_model = BTreeMap::new();
    for (model, rules) in &doc.rate_limit_config {
        let compiled = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| compile_rate_limit(&doc.id, model, index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        per_model.insert(model.trim().to_string(), compiled);
    }
    Ok(per_model)
}

fn compile_rate_limit(
    rule_id: &str,
    model: &str,
    index: usize,
    doc: &RateLimitRuleDocument,
) -> Result<RateLimitRule, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidRule {
        rule: rule_id.to_string(),
        message: format!("rate limit #{} for model '{}': {}", index + 1, model, message),
    };

    if doc.period_seconds == 0 {
        return Err(invalid("periodSeconds must be greater than zero".to_string()));
    }
    if doc.period_seconds > MAX_PERIOD.as_secs() {
        return Err(invalid(format!(
            "periodSeconds must be at most {} (one year)",
            MAX_PERIOD.as_secs()
        )));
    }
    if doc.requests_allowed == 0 {
        return Err(invalid("requestsAllowed must be at least 1".to_string()));
    }

    let key_by = match doc.key_by.trim() {
        "IP" | "IP Address" | "Ip" | "ip" => KeyBy::Ip,
        "ApiKey" | "API Key" | "api_key" => {
            let refs = doc
                .api_key_references
                .iter()
                .map(|r| {
                    let source = match r.source.trim() {
                        "Header" => KeySource::Header,
                        "Cookie" => KeySource::Cookie,
                        "Query" | "Query Param" => KeySource::Query,
                        other => return Err(invalid(format!("unknown API key source '{other}'"))),
                    };
                    if r.name.trim().is_empty() {
                        return Err(invalid("API key reference needs a name".to_string()));
                    }
                    Ok(ApiKeyReference {
                        source,
                        name: r.name.trim().to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            KeyBy::ApiKey(refs)
        }
        other => return Err(invalid(format!("unknown keyBy '{other}'"))),
    };

    Ok(RateLimitRule {
        id: doc.id.clone().unwrap_or_else(|| index.to_string()),
        requests_allowed: doc.requests_allowed,
        period_seconds: doc.period_seconds,
        key_by,
    })
}

/// Named, ordered collection of compiled rules
#[derive(Debug)]
pub struct FirewallRuleSet {
    pub id: String,
    pub name: String,
    pub rules: Vec<RuleDefinition>,
    pub document: RuleSetDocument,
}

impl FirewallRuleSet {
    pub fn compile(doc: RuleSetDocument) -> Result<Self, ConfigError> {
        if doc.id.trim().is_empty() {
            return Err(ConfigError::InvalidRule {
                rule: doc.id.clone(),
                message: "firewall config id must not be empty".to_string(),
            });
        }
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());
        for rule_doc in &doc.rules {
            if !seen.insert(rule_doc.id.as_str()) {
                return Err(ConfigError::DuplicateRule(doc.id.clone(), rule_doc.id.clone()));
            }
            rules.push(RuleDefinition::compile(rule_doc)?);
        }
        Ok(Self {
            id: doc.id.clone(),
            name: doc.name.clone(),
            rules,
            document: doc,
        })
    }

    pub fn rule(&self, id: &str) -> Option<&RuleDefinition> {
        self.rules.iter().find(|r| r.id == id)
    }
}

/// Text encoding of an extracted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Encoding {
    #[default]
    None,
    Url,
}

/// How to pull evaluable text out of one direction's payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractionSpec {
    pub json_path: String,
    pub max_length: Option<usize>,
    pub encoding: Encoding,
}

/// One targeted endpoint: host patterns plus a path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Exact hosts or `*.suffix` wildcards, lowercased
    pub hostname_patterns: Vec<String>,
    pub path_prefix: String,
}

impl Endpoint {
    fn compile(doc: &EndpointDocument) -> Option<Self> {
        let hostname_patterns: Vec<String> = doc
            .hostnames
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if hostname_patterns.is_empty() {
            return None;
        }
        Some(Self {
            hostname_patterns,
            path_prefix: doc.path.trim().to_string(),
        })
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        let host_ok = self.hostname_patterns.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
            None => *pattern == host,
        });
        host_ok && path.starts_with(&self.path_prefix)
    }
}

/// A rule set bound to one monitored application
#[derive(Debug, Clone)]
pub struct AppliedApplication {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub firewall_config_id: String,
    /// Percentage of traffic evaluated, `0..=100`
    pub sample_rate: f64,
    pub endpoints: Vec<Endpoint>,
    pub check_input: bool,
    pub input: ExtractionSpec,
    pub check_output: bool,
    pub output: ExtractionSpec,
    pub document: ApplicationDocument,
}

impl AppliedApplication {
    pub fn compile(doc: ApplicationDocument) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidApplication {
            app: doc.id.clone(),
            message: message.to_string(),
        };

        if doc.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if doc.firewall_config_id.trim().is_empty() {
            return Err(invalid("firewallConfigId must not be empty"));
        }
        if !(0.0..=100.0).contains(&doc.sample_rate) {
            return Err(invalid("sampleRate must be between 0 and 100"));
        }
        if doc.endpoints.is_empty() {
            return Err(invalid("at least one endpoint is required"));
        }
        let endpoints = doc
            .endpoints
            .iter()
            .map(|ep| Endpoint::compile(ep).ok_or_else(|| invalid("endpoint hostnames must not be empty")))
            .collect::<Result<Vec<_>, _>>()?;

        let input = extraction_spec(&doc.id, &doc.input_json_path, doc.input_max_length, doc.input_encoding.as_deref())?;
        let output = extraction_spec(
            &doc.id,
            &doc.output_json_path,
            doc.output_max_length,
            doc.output_encoding.as_deref(),
        )?;

        if !doc.check_input && !doc.check_output {
            log::warn!(
                "Application {} checks neither input nor output; its binding has no effect",
                doc.id
            );
        }

        Ok(Self {
            id: doc.id.clone(),
            name: doc.app_name.clone(),
            tags: doc.tags.clone(),
            firewall_config_id: doc.firewall_config_id.clone(),
            sample_rate: doc.sample_rate,
            endpoints,
            check_input: doc.check_input,
            input,
            check_output: doc.check_output,
            output,
            document: doc,
        })
    }

    pub fn checks(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.check_input,
            Direction::Output => self.check_output,
        }
    }

    pub fn extraction(&self, direction: Direction) -> &ExtractionSpec {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    pub fn matches_endpoint(&self, host: &str, path: &str) -> bool {
        self.endpoints.iter().any(|ep| ep.matches(host, path))
    }
}

fn extraction_spec(
    app_id: &str,
    json_path: &str,
    max_length: Option<u64>,
    encoding: Option<&str>,
) -> Result<ExtractionSpec, ConfigError> {
    let encoding = match encoding.map(str::trim) {
        None | Some("") | Some("None") | Some("none") => Encoding::None,
        Some("URL") | Some("Url") | Some("url") => Encoding::Url,
        Some(other) => {
            return Err(ConfigError::InvalidApplication {
                app: app_id.to_string(),
                message: format!("unknown encoding '{other}'"),
            })
        }
    };
    if max_length == Some(0) {
        return Err(ConfigError::InvalidApplication {
            app: app_id.to_string(),
            message: "maxLength must be positive".to_string(),
        });
    }
    Ok(ExtractionSpec {
        json_path: json_path.trim().to_string(),
        max_length: max_length.map(|v| v as usize),
        encoding,
    })
}
