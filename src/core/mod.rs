//! Core functionality for the firewall engine.
//!
//! This module contains the engine components: configuration documents and
//! their compiled rules, pattern matchers, scoring adapters, the rate
//! limiter, rule evaluation, the policy engine, auditing and analytics.

pub mod analytics;
pub mod audit;
pub mod config_store;
pub mod document;
pub mod evaluator;
pub mod extraction;
pub mod matchers;
pub mod policy_engine;
pub mod rate_limiter;
pub mod rules;
pub mod scoring;

pub use analytics::{Analytics, AnalyticsSummary};
pub use audit::{AuditRecord, AuditSink, LogAuditSink};
pub use config_store::{ConfigSnapshot, ConfigStore};
pub use document::{ApplicationDocument, ConfigDocument, RuleSetDocument};
pub use evaluator::{EvaluationVerdict, Message, RequestMetadata, RuleEvaluator, VerdictDetail};
pub use policy_engine::{BypassReason, Decision, DecisionAction, EngineError, PolicyEngine, RandomSampler, Sampler};
pub use rate_limiter::SlidingWindowLimiter;
pub use rules::{ConfigError, Direction, RuleAction, RuleKind, Sensitivity};
pub use scoring::{ScoreResult, ScoringAdapter, ScoringCategory, ScoringRegistry};
