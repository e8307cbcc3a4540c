//! Audit records for every firewall decision.

use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::policy_engine::{BypassReason, Decision, DecisionAction};
use crate::core::rules::Direction;

/// Log target the audit stream is written to
pub const AUDIT_TARGET: &str = "firewall::audit";

/// One line of the audit stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub application_id: String,
    pub direction: Direction,
    pub decision: DecisionAction,
    pub matched_rules: Vec<String>,
    /// False when no rule was evaluated; never treat such an Allow as inspected
    pub sampled: bool,
    pub bypass: Option<BypassReason>,
    pub degraded: bool,
    pub config_version: u64,
}

impl From<&Decision> for AuditRecord {
    fn from(decision: &Decision) -> Self {
        Self {
            id: decision.id,
            timestamp: decision.timestamp,
            application_id: decision.application_id.clone(),
            direction: decision.direction,
            decision: decision.action,
            matched_rules: decision.matched_rule_ids(),
            sampled: decision.sampled,
            bypass: decision.bypass,
            degraded: decision.degraded,
            config_version: decision.config_version,
        }
    }
}

/// Receiver of audit records. Called on the request path, so implementations
/// must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes each record as a JSON line on the `firewall::audit` log target
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, record: &AuditRecord) {
        match serde_json::to_string(record) {
            Ok(line) => log::info!(target: AUDIT_TARGET, "{}", line),
            Err(e) => error!("Failed to serialize audit record {}: {}", record.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            application_id: "1".to_string(),
            direction: Direction::Output,
            decision: DecisionAction::Deny,
            matched_rules: vec!["pii_output".to_string()],
            sampled: true,
            bypass: None,
            degraded: false,
            config_version: 3,
        }
    }

    #[test]
    fn test_record_wire_shape() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["applicationId"], json!("1"));
        assert_eq!(value["direction"], json!("output"));
        assert_eq!(value["decision"], json!("Deny"));
        assert_eq!(value["matchedRules"], json!(["pii_output"]));
        assert_eq!(value["sampled"], json!(true));
        assert!(value["bypass"].is_null());
    }

    #[test]
    fn test_unsampled_record_keeps_reason() {
        let mut unsampled = record();
        unsampled.decision = DecisionAction::Allow;
        unsampled.matched_rules.clear();
        unsampled.sampled = false;
        unsampled.bypass = Some(BypassReason::NotSampled);

        let value = serde_json::to_value(&unsampled).unwrap();
        assert_eq!(value["bypass"], json!("not_sampled"));

        let parsed: AuditRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, unsampled);
    }

    #[test]
    fn test_log_sink_does_not_panic() {
        LogAuditSink.record(&record());
    }
}
