//! Evaluation of a single rule against a single message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::matchers::CodeSignatureMatcher;
use crate::core::rate_limiter::{RateLimit, RateLimitKey, SlidingWindowLimiter};
use crate::core::rules::{
    AppliedApplication, Direction, KeyBy, KeySource, RateLimitRule, RuleAction, RuleDefinition, RuleKind,
    RulePayload, Sensitivity, ANY_MODEL,
};
use crate::core::scoring::{score_with_timeout, ScoreContext, ScoreResult, ScoringCategory, ScoringRegistry};
use crate::models::FailurePolicy;
use crate::utils::lookup_ignore_case;

/// Request attributes the gateway passes along with the text
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
}

/// Extracted, decoded text plus its request metadata
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub text: String,
    pub metadata: RequestMetadata,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What the evaluator needs to know besides the rule
pub struct EvaluationContext<'a> {
    pub application: &'a AppliedApplication,
    pub direction: Direction,
    pub message: &'a Message,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitOutcome {
    pub model: String,
    pub key: String,
    pub requests_allowed: u64,
    pub period_seconds: u64,
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Evidence behind a verdict
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerdictDetail {
    Score {
        category: ScoringCategory,
        score: f64,
        threshold: f64,
    },
    Unavailable {
        category: ScoringCategory,
        reason: String,
        policy: FailurePolicy,
    },
    Pii {
        fields: Vec<String>,
    },
    Length {
        length: usize,
        max_length: Option<usize>,
    },
    Code {
        signatures: Vec<String>,
    },
    RateLimit {
        limits: Vec<RateLimitOutcome>,
    },
}

/// Per-rule result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationVerdict {
    pub rule_id: String,
    pub kind: RuleKind,
    pub matched: bool,
    pub action: RuleAction,
    /// Set when an adapter failed and the failure policy decided the outcome
    pub degraded: bool,
    pub detail: VerdictDetail,
}

pub struct RuleEvaluator {
    scorers: ScoringRegistry,
    limiter: Arc<SlidingWindowLimiter>,
    adapter_timeout: Duration,
    failure_policy: FailurePolicy,
}

impl RuleEvaluator {
    pub fn new(
        scorers: ScoringRegistry,
        limiter: Arc<SlidingWindowLimiter>,
        adapter_timeout: Duration,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            scorers,
            limiter,
            adapter_timeout,
            failure_policy,
        }
    }

    /// Evaluate `rule` against the message. Disabled rules yield `None`
    /// and none of their other fields are read.
    pub async fn evaluate(&self, rule: &RuleDefinition, ctx: &EvaluationContext<'_>) -> Option<EvaluationVerdict> {
        if !rule.enabled {
            return None;
        }

        let verdict = |matched: bool, detail: VerdictDetail| EvaluationVerdict {
            rule_id: rule.id.clone(),
            kind: rule.kind,
            matched,
            action: rule.action,
            degraded: false,
            detail,
        };
        let text = ctx.message.text.as_str();

        let result = match (&rule.kind, &rule.payload) {
            (RuleKind::PromptInjection, _) => {
                self.score_rule(rule, ScoringCategory::PromptInjection, text, ScoreContext::default())
                    .await
            }
            (RuleKind::ToxicContent, _) => {
                self.score_rule(rule, ScoringCategory::Toxicity, text, ScoreContext::default())
                    .await
            }
            (RuleKind::LanguageDetect, RulePayload::Language { allowed_languages }) => {
                let context = ScoreContext {
                    allowed_languages: allowed_languages.clone(),
                };
                self.score_rule(rule, ScoringCategory::Language, text, context).await
            }
            (RuleKind::LanguageDetect, _) => {
                self.score_rule(rule, ScoringCategory::Language, text, ScoreContext::default())
                    .await
            }
            (RuleKind::PiiInput | RuleKind::PiiOutput, RulePayload::Pii(matcher)) => {
                let fields = matcher.fields_found(text);
                verdict(!fields.is_empty(), VerdictDetail::Pii { fields })
            }
            (RuleKind::LengthLimit, payload) => {
                let rule_max = match payload {
                    RulePayload::LengthLimit { max_length } => *max_length,
                    _ => None,
                };
                let max_length = rule_max.or(ctx.application.extraction(ctx.direction).max_length);
                let length = text.chars().count();
                let matched = max_length.map_or(false, |max| length > max);
                verdict(matched, VerdictDetail::Length { length, max_length })
            }
            (RuleKind::CodeDetect, _) => {
                let signatures = CodeSignatureMatcher::shared().signatures_found(text);
                verdict(!signatures.is_empty(), VerdictDetail::Code { signatures })
            }
            (RuleKind::RateLimit, RulePayload::RateLimit(per_model)) => {
                let limits = self.check_rate_limits(rule, ctx, per_model);
                let matched = limits.iter().any(|outcome| !outcome.allowed);
                if matched {
                    metrics::increment_counter!("firewall_rate_limited_total");
                }
                verdict(matched, VerdictDetail::RateLimit { limits })
            }
            // unreachable for compiled rules, which always carry their payload
            (RuleKind::PiiInput | RuleKind::PiiOutput, _) => verdict(false, VerdictDetail::Pii { fields: Vec::new() }),
            (RuleKind::RateLimit, _) => verdict(false, VerdictDetail::RateLimit { limits: Vec::new() }),
        };
        Some(result)
    }

    async fn score_rule(
        &self,
        rule: &RuleDefinition,
        category: ScoringCategory,
        text: &str,
        context: ScoreContext,
    ) -> EvaluationVerdict {
        let result = match self.scorers.get(category) {
            Some(adapter) => score_with_timeout(adapter.as_ref(), text, &context, self.adapter_timeout).await,
            None => ScoreResult::Unavailable(format!("no {category} adapter registered")),
        };

        match result {
            ScoreResult::Score(score) => {
                let threshold = rule.sensitivity.unwrap_or(Sensitivity::Medium).threshold();
                EvaluationVerdict {
                    rule_id: rule.id.clone(),
                    kind: rule.kind,
                    matched: score >= threshold,
                    action: rule.action,
                    degraded: false,
                    detail: VerdictDetail::Score {
                        category,
                        score,
                        threshold,
                    },
                }
            }
            ScoreResult::Unavailable(reason) => {
                let policy = rule.failure_policy.unwrap_or(self.failure_policy);
                metrics::increment_counter!("firewall_adapter_unavailable_total", "category" => category.as_str());
                let (matched, action) = match policy {
                    FailurePolicy::FailOpen => {
                        warn!(
                            "Scoring adapter {} unavailable for rule {}, failing open: {}",
                            category, rule.id, reason
                        );
                        (false, rule.action)
                    }
                    FailurePolicy::FailClosed => {
                        warn!(
                            "Scoring adapter {} unavailable for rule {}, failing closed: {}",
                            category, rule.id, reason
                        );
                        (true, RuleAction::Deny)
                    }
                };
                EvaluationVerdict {
                    rule_id: rule.id.clone(),
                    kind: rule.kind,
                    matched,
                    action,
                    degraded: true,
                    detail: VerdictDetail::Unavailable {
                        category,
                        reason,
                        policy,
                    },
                }
            }
        }
    }

    fn check_rate_limits(
        &self,
        rule: &RuleDefinition,
        ctx: &EvaluationContext<'_>,
        per_model: &std::collections::BTreeMap<String, Vec<RateLimitRule>>,
    ) -> Vec<RateLimitOutcome> {
        let metadata = &ctx.message.metadata;
        let requested = metadata
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != ANY_MODEL);

        let mut applicable: Vec<(&str, &RateLimitRule)> = Vec::new();
        if let Some(model) = requested {
            if let Some(limits) = per_model.get(model) {
                applicable.extend(limits.iter().map(|l| (model, l)));
            }
        }
        if let Some(limits) = per_model.get(ANY_MODEL) {
            applicable.extend(limits.iter().map(|l| (ANY_MODEL, l)));
        }

        applicable
            .into_iter()
            .map(|(model, limit)| {
                let key = RateLimitKey {
                    application_id: ctx.application.id.clone(),
                    model: model.to_string(),
                    rule: format!("{}#{}", rule.id, limit.id),
                    subject: resolve_subject(&limit.key_by, metadata),
                };
                let status = self.limiter.check(
                    &key,
                    RateLimit {
                        requests: limit.requests_allowed,
                        period: Duration::from_secs(limit.period_seconds),
                    },
                );
                RateLimitOutcome {
                    model: model.to_string(),
                    key: key.subject.clone(),
                    requests_allowed: limit.requests_allowed,
                    period_seconds: limit.period_seconds,
                    allowed: status.allowed,
                    remaining: status.remaining,
                    reset_at: status.reset_at,
                }
            })
            .collect()
    }
}

/// Rate-limit subject for a request: the first API key reference that yields
/// a value, else the client IP
pub fn resolve_subject(key_by: &KeyBy, metadata: &RequestMetadata) -> String {
    if let KeyBy::ApiKey(references) = key_by {
        for reference in references {
            let value = match reference.source {
                KeySource::Header => lookup_ignore_case(&metadata.headers, &reference.name),
                KeySource::Cookie => non_empty(metadata.cookies.get(&reference.name)),
                KeySource::Query => non_empty(metadata.query.get(&reference.name)),
            };
            if let Some(value) = value {
                return format!("apikey:{value}");
            }
        }
    }
    let ip = metadata
        .client_ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown");
    format!("ip:{ip}")
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}
