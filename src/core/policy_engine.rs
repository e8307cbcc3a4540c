//! Turns the verdicts of a rule set into one firewall decision.
//!
//! A decision is made against a single configuration snapshot. The steps
//! are: global switch, direction gate, sampling gate, evaluation of every
//! enabled rule that applies to the direction, and aggregation where
//! `Deny` dominates `Alert` dominates `Allow`. Every decision, bypasses
//! included, is handed to the audit sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::audit::{AuditRecord, AuditSink};
use crate::core::config_store::{ConfigSnapshot, ConfigStore};
use crate::core::evaluator::{EvaluationContext, EvaluationVerdict, Message, RequestMetadata, RuleEvaluator};
use crate::core::extraction::{extract, ExtractionError};
use crate::core::rate_limiter::SlidingWindowLimiter;
use crate::core::rules::{AppliedApplication, Direction, RuleAction};
use crate::core::scoring::ScoringRegistry;
use crate::models::{EngineConfig, ScoringConfig};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown application '{0}'")]
    UnknownApplication(String),
    #[error("application '{app}' is bound to missing firewall config '{rule_set}'")]
    UnknownRuleSet { app: String, rule_set: String },
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
}

/// Final action for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DecisionAction {
    Allow,
    Alert,
    Deny,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Alert => "alert",
            Self::Deny => "deny",
        }
    }
}

impl From<RuleAction> for DecisionAction {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Alert => Self::Alert,
            RuleAction::Deny => Self::Deny,
        }
    }
}

/// Why a message was allowed without evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    NotSampled,
    FirewallDisabled,
    DirectionNotChecked,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSampled => "not_sampled",
            Self::FirewallDisabled => "firewall_disabled",
            Self::DirectionNotChecked => "direction_not_checked",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub application_id: String,
    pub direction: Direction,
    pub action: DecisionAction,
    /// False whenever rule evaluation was skipped; `bypass` says why
    pub sampled: bool,
    pub bypass: Option<BypassReason>,
    /// Matched verdicts in rule-set order
    pub matched: Vec<EvaluationVerdict>,
    pub evaluated_rules: usize,
    /// Some adapter was unavailable and a failure policy decided its rule
    pub degraded: bool,
    pub config_version: u64,
}

impl Decision {
    fn bypassed(app: &AppliedApplication, direction: Direction, reason: BypassReason, version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            application_id: app.id.clone(),
            direction,
            action: DecisionAction::Allow,
            sampled: false,
            bypass: Some(reason),
            matched: Vec::new(),
            evaluated_rules: 0,
            degraded: false,
            config_version: version,
        }
    }

    pub fn matched_rule_ids(&self) -> Vec<String> {
        self.matched.iter().map(|v| v.rule_id.clone()).collect()
    }
}

/// Sampling gate. `rate` is a percentage in `0..=100`.
pub trait Sampler: Send + Sync {
    fn sample(&self, rate: f64) -> bool;
}

pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn sample(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 100.0 {
            return true;
        }
        rand::thread_rng().gen_range(0.0..100.0) < rate
    }
}

pub struct PolicyEngine {
    store: Arc<ConfigStore>,
    evaluator: RuleEvaluator,
    sampler: Box<dyn Sampler>,
    sinks: Vec<Arc<dyn AuditSink>>,
    enabled: AtomicBool,
}

impl PolicyEngine {
    pub fn new(store: Arc<ConfigStore>, evaluator: RuleEvaluator) -> Self {
        Self {
            store,
            evaluator,
            sampler: Box::new(RandomSampler),
            sinks: Vec::new(),
            enabled: AtomicBool::new(true),
        }
    }

    /// Engine wired from service settings: built-in or remote scorers, an
    /// in-process limiter and the configured failure policy
    pub fn from_config(engine: &EngineConfig, scoring: &ScoringConfig, store: Arc<ConfigStore>) -> Self {
        let timeout = Duration::from_millis(engine.adapter_timeout_ms.max(1));
        let evaluator = RuleEvaluator::new(
            ScoringRegistry::from_config(scoring, timeout),
            Arc::new(SlidingWindowLimiter::new(Duration::from_secs(engine.sweep_interval_secs))),
            timeout,
            engine.failure_policy,
        );
        let policy_engine = Self::new(store, evaluator);
        policy_engine.set_enabled(engine.enabled);
        policy_engine
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            info!("Firewall {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// Decide on already extracted text
    pub async fn decide(
        &self,
        application_id: &str,
        direction: Direction,
        message: &Message,
    ) -> Result<Decision, EngineError> {
        let snapshot = self.store.snapshot();
        let app = lookup(&snapshot, application_id)?;
        self.decide_in(&snapshot, app, direction, message).await
    }

    /// Extract the text from a raw payload with the application's settings, then decide
    pub async fn inspect(
        &self,
        application_id: &str,
        direction: Direction,
        payload: &Value,
        metadata: RequestMetadata,
    ) -> Result<Decision, EngineError> {
        let snapshot = self.store.snapshot();
        let app = lookup(&snapshot, application_id)?;

        // nothing to extract when the message will not be looked at
        let text = if self.is_enabled() && app.checks(direction) {
            extract(payload, app.extraction(direction))?
        } else {
            String::new()
        };
        let message = Message { text, metadata };
        self.decide_in(&snapshot, app, direction, &message).await
    }

    async fn decide_in(
        &self,
        snapshot: &ConfigSnapshot,
        app: &AppliedApplication,
        direction: Direction,
        message: &Message,
    ) -> Result<Decision, EngineError> {
        let started = Instant::now();

        let bypass = if !self.is_enabled() {
            Some(BypassReason::FirewallDisabled)
        } else if !app.checks(direction) {
            Some(BypassReason::DirectionNotChecked)
        } else if !self.sampler.sample(app.sample_rate) {
            Some(BypassReason::NotSampled)
        } else {
            None
        };

        let decision = match bypass {
            Some(reason) => {
                debug!("Application {} {} bypassed: {}", app.id, direction, reason.as_str());
                Decision::bypassed(app, direction, reason, snapshot.version)
            }
            None => {
                let rule_set =
                    snapshot
                        .rule_set(&app.firewall_config_id)
                        .ok_or_else(|| EngineError::UnknownRuleSet {
                            app: app.id.clone(),
                            rule_set: app.firewall_config_id.clone(),
                        })?;

                let ctx = EvaluationContext {
                    application: app,
                    direction,
                    message,
                };
                let applicable: Vec<_> = rule_set
                    .rules
                    .iter()
                    .filter(|rule| rule.enabled && rule.kind.applies_to(direction))
                    .collect();
                let verdicts: Vec<EvaluationVerdict> =
                    join_all(applicable.iter().map(|rule| self.evaluator.evaluate(rule, &ctx)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();

                let degraded = verdicts.iter().any(|v| v.degraded);
                let evaluated_rules = verdicts.len();
                let matched: Vec<EvaluationVerdict> = verdicts.into_iter().filter(|v| v.matched).collect();
                let action = matched
                    .iter()
                    .map(|v| DecisionAction::from(v.action))
                    .max()
                    .unwrap_or(DecisionAction::Allow);

                Decision {
                    id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    application_id: app.id.clone(),
                    direction,
                    action,
                    sampled: true,
                    bypass: None,
                    matched,
                    evaluated_rules,
                    degraded,
                    config_version: snapshot.version,
                }
            }
        };

        self.observe(&decision, started);
        Ok(decision)
    }

    fn observe(&self, decision: &Decision, started: Instant) {
        metrics::increment_counter!(
            "firewall_decisions_total",
            "action" => decision.action.as_str(),
            "application" => decision.application_id.clone()
        );
        for verdict in &decision.matched {
            metrics::increment_counter!("firewall_rule_matches_total", "rule" => verdict.rule_id.clone());
        }
        metrics::histogram!("firewall_decision_seconds", started.elapsed().as_secs_f64());

        if decision.action != DecisionAction::Allow {
            info!(
                "Decision {:?} for application {} {}: rules {:?}",
                decision.action,
                decision.application_id,
                decision.direction,
                decision.matched_rule_ids()
            );
        }

        if !self.sinks.is_empty() {
            let record = AuditRecord::from(decision);
            for sink in &self.sinks {
                sink.record(&record);
            }
        }
    }
}

fn lookup<'a>(snapshot: &'a ConfigSnapshot, application_id: &str) -> Result<&'a AppliedApplication, EngineError> {
    snapshot
        .application(application_id)
        .map(|app| app.as_ref())
        .ok_or_else(|| EngineError::UnknownApplication(application_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::ConfigDocument;
    use crate::core::scoring::{MockScoringAdapter, ScoreResult, ScoringCategory};
    use crate::models::FailurePolicy;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl AuditSink for CollectingSink {
        fn record(&self, record: &AuditRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    fn store(rules: serde_json::Value, sample_rate: u32) -> Arc<ConfigStore> {
        let document: ConfigDocument = serde_json::from_value(json!({
            "firewallConfigs": [{ "id": "prod-rules-v1", "name": "Production", "rules": rules }],
            "apps": [{
                "id": 1, "appName": "Customer Service Bot", "firewallConfigId": "prod-rules-v1",
                "sampleRate": sample_rate,
                "endpoints": [{ "hostnames": "chatbot.example.com", "path": "/v1/chat" }],
                "checkInput": true, "inputJsonPath": "$.prompt",
                "checkOutput": true, "outputJsonPath": "$.choices[0].text"
            }]
        }))
        .unwrap();
        let store = Arc::new(ConfigStore::new());
        store.replace(document).unwrap();
        store
    }

    fn engine(store: Arc<ConfigStore>, registry: ScoringRegistry) -> PolicyEngine {
        let evaluator = RuleEvaluator::new(
            registry,
            Arc::new(SlidingWindowLimiter::default()),
            Duration::from_millis(200),
            FailurePolicy::FailOpen,
        );
        PolicyEngine::new(store, evaluator)
    }

    #[tokio::test]
    async fn test_pii_output_denied() {
        let store = store(
            json!([
                { "id": "pii_output", "enabled": true, "action": "Deny",
                  "piiTypes": { "Credit Card Number": true } }
            ]),
            100,
        );
        let engine = engine(store, ScoringRegistry::new());

        let decision = engine
            .decide("1", Direction::Output, &Message::new("Card: 4111111111111111"))
            .await
            .unwrap();
        assert_eq!(decision.action, DecisionAction::Deny);
        assert_eq!(decision.matched_rule_ids(), vec!["pii_output".to_string()]);
        assert!(decision.sampled);

        // PiiOutput does not apply to input
        let input = engine
            .decide("1", Direction::Input, &Message::new("Card: 4111111111111111"))
            .await
            .unwrap();
        assert_eq!(input.action, DecisionAction::Allow);
        assert_eq!(input.evaluated_rules, 0);
    }

    #[tokio::test]
    async fn test_zero_sample_rate_never_evaluates() {
        let store = store(
            json!([{ "id": "toxic_content", "enabled": true, "action": "Deny", "sensitivity": "High" }]),
            0,
        );
        let mut mock = MockScoringAdapter::new();
        mock.expect_category().return_const(ScoringCategory::Toxicity);
        mock.expect_score().never();
        let engine = engine(store, ScoringRegistry::new().with_adapter(Arc::new(mock)));

        for _ in 0..50 {
            let decision = engine.decide("1", Direction::Input, &Message::new("x")).await.unwrap();
            assert_eq!(decision.action, DecisionAction::Allow);
            assert!(!decision.sampled);
            assert_eq!(decision.bypass, Some(BypassReason::NotSampled));
        }
    }

    #[tokio::test]
    async fn test_full_sample_rate_always_evaluates() {
        let store = store(
            json!([{ "id": "toxic_content", "enabled": true, "action": "Alert", "sensitivity": "High" }]),
            100,
        );
        let mut mock = MockScoringAdapter::new();
        mock.expect_category().return_const(ScoringCategory::Toxicity);
        mock.expect_score().times(20).returning(|_, _| ScoreResult::Score(0.9));
        let engine = engine(store, ScoringRegistry::new().with_adapter(Arc::new(mock)));

        for _ in 0..20 {
            let decision = engine.decide("1", Direction::Input, &Message::new("x")).await.unwrap();
            assert!(decision.sampled);
            assert_eq!(decision.action, DecisionAction::Alert);
        }
    }

    #[tokio::test]
    async fn test_deny_dominates_regardless_of_order() {
        let alert_first = json!([
            { "id": "code_detected", "enabled": true, "action": "Alert" },
            { "id": "pii_input", "enabled": true, "action": "Deny", "piiTypes": { "Email Address": true } },
            { "id": "long_message", "enabled": true, "action": "Alert", "maxLength": 10000 }
        ]);
        let deny_first = json!([
            { "id": "pii_input", "enabled": true, "action": "Deny", "piiTypes": { "Email Address": true } },
            { "id": "long_message", "enabled": true, "action": "Alert", "maxLength": 10000 },
            { "id": "code_detected", "enabled": true, "action": "Alert" }
        ]);
        let message = Message::new("<script>send('ops@example.com')</script>");

        for (rules, expected_order) in [
            (alert_first, vec!["code_detected", "pii_input"]),
            (deny_first, vec!["pii_input", "code_detected"]),
        ] {
            let engine = engine(store(rules, 100), ScoringRegistry::new());
            let decision = engine.decide("1", Direction::Input, &message).await.unwrap();
            assert_eq!(decision.action, DecisionAction::Deny);
            assert_eq!(decision.matched_rule_ids(), expected_order);
            assert_eq!(decision.evaluated_rules, 3);
        }
    }

    #[tokio::test]
    async fn test_rate_limit_through_engine() {
        let store = store(
            json!([{ "id": "rate_limiting", "enabled": true, "action": "Deny",
                     "rateLimitConfig": { "*": [{ "requests": 10, "period": 60, "keyBy": "IP Address" }] } }]),
            100,
        );
        let engine = engine(store, ScoringRegistry::new());
        let metadata = RequestMetadata {
            client_ip: Some("1.2.3.4".to_string()),
            ..RequestMetadata::default()
        };
        let message = Message::new("hi").with_metadata(metadata);

        for _ in 0..10 {
            let decision = engine.decide("1", Direction::Input, &message).await.unwrap();
            assert_eq!(decision.action, DecisionAction::Allow);
        }
        let decision = engine.decide("1", Direction::Input, &message).await.unwrap();
        assert_eq!(decision.action, DecisionAction::Deny);
    }

    #[tokio::test]
    async fn test_global_switch_and_audit() {
        let store = store(json!([{ "id": "code_detected", "enabled": true, "action": "Deny" }]), 100);
        let sink = Arc::new(CollectingSink::default());
        let engine = engine(store, ScoringRegistry::new()).with_sink(sink.clone());

        engine.set_enabled(false);
        let decision = engine
            .decide("1", Direction::Input, &Message::new("<script>"))
            .await
            .unwrap();
        assert_eq!(decision.action, DecisionAction::Allow);
        assert_eq!(decision.bypass, Some(BypassReason::FirewallDisabled));

        engine.set_enabled(true);
        let decision = engine
            .decide("1", Direction::Input, &Message::new("<script>"))
            .await
            .unwrap();
        assert_eq!(decision.action, DecisionAction::Deny);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].sampled);
        assert_eq!(records[1].matched_rules, vec!["code_detected".to_string()]);
    }

    #[tokio::test]
    async fn test_inspect_extracts_by_direction() {
        let store = store(json!([{ "id": "code_detected", "enabled": true, "action": "Deny" }]), 100);
        let engine = engine(store, ScoringRegistry::new());

        let response = json!({ "choices": [{ "text": "DROP TABLE users;" }] });
        let decision = engine
            .inspect("1", Direction::Output, &response, RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(decision.action, DecisionAction::Deny);

        let err = engine
            .inspect("1", Direction::Input, &json!({ "text": "hi" }), RequestMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_direction_not_checked_and_unknown_application() {
        let store = store(json!([{ "id": "code_detected", "enabled": true, "action": "Deny" }]), 100);
        let mut app = store.snapshot().to_document().apps.remove(0);
        app.check_output = false;
        store.upsert_application(app).unwrap();
        let engine = engine(store, ScoringRegistry::new());

        let decision = engine
            .decide("1", Direction::Output, &Message::new("<script>"))
            .await
            .unwrap();
        assert_eq!(decision.bypass, Some(BypassReason::DirectionNotChecked));

        assert!(matches!(
            engine.decide("42", Direction::Input, &Message::new("x")).await,
            Err(EngineError::UnknownApplication(_))
        ));
    }

    #[test]
    fn test_random_sampler_bounds() {
        let sampler = RandomSampler;
        assert!((0..1000).all(|_| !sampler.sample(0.0)));
        assert!((0..1000).all(|_| sampler.sample(100.0)));
        let hits = (0..10_000).filter(|_| sampler.sample(50.0)).count();
        assert!((4_000..6_000).contains(&hits));
    }
}
