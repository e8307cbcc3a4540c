//! Scoring adapters for confidence-based detectors.
//!
//! Prompt-injection, toxicity and language rules ask an adapter for a score
//! in `[0, 1]`. Adapters are pluggable: the built-in ones are cheap
//! heuristics so the engine works out of the box, and [`HttpScoringAdapter`]
//! forwards to an external classifier. An adapter never fails the request
//! path; it reports [`ScoreResult::Unavailable`] instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::models::ScoringConfig;

/// Errors raised inside an HTTP adapter before being folded into `Unavailable`
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("classifier request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("invalid classifier response: {0}")]
    InvalidResponse(String),
}

/// Detector family an adapter serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringCategory {
    PromptInjection,
    Toxicity,
    Language,
}

impl ScoringCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt_injection",
            Self::Toxicity => "toxicity",
            Self::Language => "language",
        }
    }
}

impl fmt::Display for ScoringCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule-specific inputs an adapter may need besides the text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreContext {
    /// ISO 639-1 codes accepted by a language rule
    pub allowed_languages: Vec<String>,
}

/// Outcome of a scoring call
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreResult {
    Score(f64),
    Unavailable(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScoringAdapter: Send + Sync {
    fn category(&self) -> ScoringCategory;

    /// Confidence in `[0, 1]` that `text` belongs to the category
    async fn score(&self, text: &str, context: &ScoreContext) -> ScoreResult;
}

/// Run an adapter under a time budget; overruns become `Unavailable`.
pub async fn score_with_timeout(
    adapter: &dyn ScoringAdapter,
    text: &str,
    context: &ScoreContext,
    budget: Duration,
) -> ScoreResult {
    match tokio::time::timeout(budget, adapter.score(text, context)).await {
        Ok(ScoreResult::Score(score)) if score.is_finite() => ScoreResult::Score(score.clamp(0.0, 1.0)),
        Ok(ScoreResult::Score(score)) => ScoreResult::Unavailable(format!("non-finite score {score}")),
        Ok(unavailable) => unavailable,
        Err(_) => ScoreResult::Unavailable(format!("timed out after {}ms", budget.as_millis())),
    }
}

/// Adapters by category
#[derive(Clone, Default)]
pub struct ScoringRegistry {
    adapters: HashMap<ScoringCategory, Arc<dyn ScoringAdapter>>,
}

impl ScoringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in heuristics for every category, replaced by HTTP adapters
    /// wherever a classifier URL is configured
    pub fn from_config(config: &ScoringConfig, timeout: Duration) -> Self {
        let mut registry = Self::new()
            .with_adapter(Arc::new(KeywordInjectionScorer::new()))
            .with_adapter(Arc::new(LexiconToxicityScorer::new()))
            .with_adapter(Arc::new(ScriptLanguageScorer::new(
                config.default_allowed_languages.clone(),
            )));

        let remote = [
            (ScoringCategory::PromptInjection, &config.prompt_injection_url),
            (ScoringCategory::Toxicity, &config.toxicity_url),
            (ScoringCategory::Language, &config.language_url),
        ];
        for (category, url) in remote {
            if let Some(url) = url {
                registry = registry.with_adapter(Arc::new(HttpScoringAdapter::new(category, url.clone(), timeout)));
            }
        }
        registry
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ScoringAdapter>) -> Self {
        self.adapters.insert(adapter.category(), adapter);
        self
    }

    pub fn get(&self, category: ScoringCategory) -> Option<Arc<dyn ScoringAdapter>> {
        self.adapters.get(&category).cloned()
    }
}

/// Combine independent signal weights: `1 - Π(1 - w)`
fn combine(weights: impl IntoIterator<Item = f64>) -> f64 {
    1.0 - weights.into_iter().fold(1.0, |acc, w| acc * (1.0 - w.clamp(0.0, 1.0)))
}

static INJECTION_PATTERNS: &[(&str, f64)] = &[
    (r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions?|prompts?|rules)", 0.9),
    (r"(?i)disregard\s+(all\s+)?(prior|previous|above|your)\s+\w+", 0.85),
    (r"(?i)\bnew\s+instructions?\s*:", 0.6),
    (r"(?i)system\s*:\s*override", 0.8),
    (r"(?i)you\s+are\s+now\s+(in\s+)?(developer|dan|jailbreak)\s*mode", 0.9),
    (r"(?i)\bact\s+as\s+(if\s+you\s+are\s+)?(an?\s+)?(unrestricted|unfiltered|evil)", 0.7),
    (r"(?i)pretend\s+(to\s+be|you\s+are)\b", 0.4),
    (r"(?i)<\s*/?\s*system\s*>|\[INST\]|<<\s*SYS\s*>>", 0.7),
    (r"(?i)(reveal|show|print|repeat)\s+(me\s+)?(your\s+)?(system\s+|hidden\s+)?(prompt|instructions)", 0.8),
];

/// Regex-weighted prompt-injection heuristic
pub struct KeywordInjectionScorer {
    patterns: Vec<(Regex, f64)>,
}

impl KeywordInjectionScorer {
    pub fn new() -> Self {
        Self {
            patterns: compile_weighted(INJECTION_PATTERNS),
        }
    }
}

impl Default for KeywordInjectionScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoringAdapter for KeywordInjectionScorer {
    fn category(&self) -> ScoringCategory {
        ScoringCategory::PromptInjection
    }

    async fn score(&self, text: &str, _context: &ScoreContext) -> ScoreResult {
        ScoreResult::Score(combine(
            self.patterns
                .iter()
                .filter(|(re, _)| re.is_match(text))
                .map(|(_, w)| *w),
        ))
    }
}

static TOXIC_PATTERNS: &[(&str, f64)] = &[
    (r"(?i)\b(kill|hurt|destroy)\s+(you|yourself|them|him|her)\b", 0.8),
    (r"(?i)\b(idiot|moron|stupid|dumb)\b", 0.45),
    (r"(?i)\b(hate|despise)\s+(you|them|all)\b", 0.5),
    (r"(?i)\b(shut\s+up|go\s+to\s+hell)\b", 0.4),
    (r"(?i)\b(worthless|pathetic|disgusting)\b", 0.35),
];

/// Lexicon toxicity heuristic
pub struct LexiconToxicityScorer {
    patterns: Vec<(Regex, f64)>,
}

impl LexiconToxicityScorer {
    pub fn new() -> Self {
        Self {
            patterns: compile_weighted(TOXIC_PATTERNS),
        }
    }
}

impl Default for LexiconToxicityScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoringAdapter for LexiconToxicityScorer {
    fn category(&self) -> ScoringCategory {
        ScoringCategory::Toxicity
    }

    async fn score(&self, text: &str, _context: &ScoreContext) -> ScoreResult {
        ScoreResult::Score(combine(
            self.patterns
                .iter()
                .filter(|(re, _)| re.is_match(text))
                .map(|(_, w)| *w),
        ))
    }
}

fn compile_weighted(patterns: &[(&str, f64)]) -> Vec<(Regex, f64)> {
    patterns
        .iter()
        .filter_map(|(pattern, weight)| match Regex::new(pattern) {
            Ok(re) => Some((re, *weight)),
            Err(e) => {
                log::error!("Dropping scoring pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Cyrillic,
    Greek,
    Arabic,
    Hebrew,
    Devanagari,
    Han,
    Kana,
    Hangul,
    Thai,
}

fn script_of(c: char) -> Option<Script> {
    if !c.is_alphabetic() {
        return None;
    }
    let script = match c as u32 {
        0x0041..=0x024F | 0x1E00..=0x1EFF => Script::Latin,
        0x0370..=0x03FF => Script::Greek,
        0x0400..=0x052F => Script::Cyrillic,
        0x0590..=0x05FF => Script::Hebrew,
        0x0600..=0x06FF | 0x0750..=0x077F => Script::Arabic,
        0x0900..=0x097F => Script::Devanagari,
        0x0E00..=0x0E7F => Script::Thai,
        0x3040..=0x30FF => Script::Kana,
        0xAC00..=0xD7AF | 0x1100..=0x11FF => Script::Hangul,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF => Script::Han,
        _ => return None,
    };
    Some(script)
}

fn scripts_for_language(code: &str) -> &'static [Script] {
    match code.to_ascii_lowercase().as_str() {
        "ru" | "uk" | "bg" | "sr" | "kk" | "be" => &[Script::Cyrillic],
        "el" => &[Script::Greek],
        "ar" | "fa" | "ur" => &[Script::Arabic],
        "he" | "yi" => &[Script::Hebrew],
        "hi" | "mr" | "ne" => &[Script::Devanagari],
        "th" => &[Script::Thai],
        "zh" => &[Script::Han],
        "ja" => &[Script::Kana, Script::Han],
        "ko" => &[Script::Hangul, Script::Han],
        _ => &[Script::Latin],
    }
}

/// Script-based language identifier.
///
/// Scores the share of letters written in scripts none of the allowed
/// languages use. It cannot tell Latin-script languages apart.
pub struct ScriptLanguageScorer {
    default_allowed: Vec<String>,
}

impl ScriptLanguageScorer {
    pub fn new(default_allowed: Vec<String>) -> Self {
        Self { default_allowed }
    }
}

#[async_trait]
impl ScoringAdapter for ScriptLanguageScorer {
    fn category(&self) -> ScoringCategory {
        ScoringCategory::Language
    }

    async fn score(&self, text: &str, context: &ScoreContext) -> ScoreResult {
        let allowed_codes = if context.allowed_languages.is_empty() {
            &self.default_allowed
        } else {
            &context.allowed_languages
        };
        if allowed_codes.is_empty() {
            return ScoreResult::Score(0.0);
        }
        let allowed: Vec<Script> = allowed_codes
            .iter()
            .flat_map(|code| scripts_for_language(code).iter().copied())
            .collect();

        let (mut letters, mut foreign) = (0usize, 0usize);
        for script in text.chars().filter_map(script_of) {
            letters += 1;
            if !allowed.contains(&script) {
                foreign += 1;
            }
        }
        if letters == 0 {
            return ScoreResult::Score(0.0);
        }
        ScoreResult::Score(foreign as f64 / letters as f64)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifierRequest<'a> {
    text: &'a str,
    category: ScoringCategory,
    allowed_languages: &'a [String],
}

#[derive(Deserialize)]
struct ClassifierResponse {
    score: f64,
}

/// Adapter for an external classifier speaking `POST {text, category, allowedLanguages}` -> `{score}`
pub struct HttpScoringAdapter {
    client: Client,
    category: ScoringCategory,
    url: String,
}

impl HttpScoringAdapter {
    pub fn new(category: ScoringCategory, url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client for {} classifier: {}", category, e);
                Client::new()
            });
        Self { client, category, url }
    }

    async fn request_score(&self, text: &str, context: &ScoreContext) -> Result<f64, ScoringError> {
        let response: ClassifierResponse = self
            .client
            .post(&self.url)
            .json(&ClassifierRequest {
                text,
                category: self.category,
                allowed_languages: &context.allowed_languages,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !(0.0..=1.0).contains(&response.score) {
            return Err(ScoringError::InvalidResponse(format!(
                "score {} outside [0, 1]",
                response.score
            )));
        }
        Ok(response.score)
    }
}

#[async_trait]
impl ScoringAdapter for HttpScoringAdapter {
    fn category(&self) -> ScoringCategory {
        self.category
    }

    async fn score(&self, text: &str, context: &ScoreContext) -> ScoreResult {
        match self.request_score(text, context).await {
            Ok(score) => ScoreResult::Score(score),
            Err(e) => ScoreResult::Unavailable(e.to_string()),
        }
    }
}
