//! Analytics for the firewall dashboard.
//!
//! [`Analytics`] is an audit sink that folds decisions into the figures the
//! dashboard shows: request totals, alert and deny counts, which rules
//! triggered, per-application activity and a daily time series.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::core::audit::{AuditRecord, AuditSink};
use crate::core::policy_engine::DecisionAction;
use crate::models::AnalyticsConfig;

/// Alerts and denies recorded on one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub alerts: u64,
    pub denies: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub application_id: String,
    pub total_requests: u64,
    pub triggered_requests: u64,
    pub unique_rules: usize,
}

/// Dashboard snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub total_requests: u64,
    pub evaluated_requests: u64,
    pub unsampled_requests: u64,
    pub allowed: u64,
    pub alerts: u64,
    pub denies: u64,
    pub triggered_by_rule: BTreeMap<String, u64>,
    pub applications: Vec<ApplicationSummary>,
    pub daily: Vec<DailyPoint>,
}

#[derive(Default)]
struct AppCounters {
    total_requests: u64,
    triggered_requests: u64,
    rules: BTreeSet<String>,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    evaluated_requests: u64,
    unsampled_requests: u64,
    allowed: u64,
    alerts: u64,
    denies: u64,
    triggered_by_rule: BTreeMap<String, u64>,
    applications: HashMap<String, AppCounters>,
    daily: BTreeMap<NaiveDate, (u64, u64)>,
}

/// Analytics service
pub struct Analytics {
    config: AnalyticsConfig,
    counters: RwLock<Counters>,
}

impl Analytics {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            counters: RwLock::new(Counters::default()),
        }
    }

    pub fn summary(&self) -> AnalyticsSummary {
        let counters = self.counters.read().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut applications: Vec<ApplicationSummary> = counters
            .applications
            .iter()
            .map(|(id, app)| ApplicationSummary {
                application_id: id.clone(),
                total_requests: app.total_requests,
                triggered_requests: app.triggered_requests,
                unique_rules: app.rules.len(),
            })
            .collect();
        applications.sort_by(|a, b| a.application_id.cmp(&b.application_id));

        AnalyticsSummary {
            total_requests: counters.total_requests,
            evaluated_requests: counters.evaluated_requests,
            unsampled_requests: counters.unsampled_requests,
            allowed: counters.allowed,
            alerts: counters.alerts,
            denies: counters.denies,
            triggered_by_rule: counters.triggered_by_rule.clone(),
            applications,
            daily: counters
                .daily
                .iter()
                .map(|(date, (alerts, denies))| DailyPoint {
                    date: *date,
                    alerts: *alerts,
                    denies: *denies,
                })
                .collect(),
        }
    }
}

impl AuditSink for Analytics {
    fn record(&self, record: &AuditRecord) {
        if !self.config.enabled {
            return;
        }
        let mut counters = self.counters.write().unwrap_or_else(|poisoned| poisoned.into_inner());

        counters.total_requests += 1;
        if record.sampled {
            counters.evaluated_requests += 1;
        } else {
            counters.unsampled_requests += 1;
        }
        match record.decision {
            DecisionAction::Allow => counters.allowed += 1,
            DecisionAction::Alert => counters.alerts += 1,
            DecisionAction::Deny => counters.denies += 1,
        }
        for rule in &record.matched_rules {
            *counters.triggered_by_rule.entry(rule.clone()).or_insert(0) += 1;
        }

        let app = counters.applications.entry(record.application_id.clone()).or_default();
        app.total_requests += 1;
        if !record.matched_rules.is_empty() {
            app.triggered_requests += 1;
            app.rules.extend(record.matched_rules.iter().cloned());
        }

        if record.decision != DecisionAction::Allow {
            let day = record.timestamp.date_naive();
            let point = counters.daily.entry(day).or_insert((0, 0));
            match record.decision {
                DecisionAction::Alert => point.0 += 1,
                _ => point.1 += 1,
            }
            let retention = Duration::days(self.config.retention_days.max(1) as i64);
            if let Some(newest) = counters.daily.keys().next_back().copied() {
                let cutoff = newest - retention;
                counters.daily.retain(|date, _| *date > cutoff);
            }
        }
    }
}
