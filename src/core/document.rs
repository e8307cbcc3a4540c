//! Configuration documents as emitted by the configuration console.
//!
//! These types mirror the JSON the console's save handlers produce. They
//! carry no validation; [`crate::core::rules`] turns them into the
//! immutable, compiled values the evaluator reads.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// Whole-store document: every rule set and every application binding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub firewall_configs: Vec<RuleSetDocument>,
    #[serde(default)]
    pub apps: Vec<ApplicationDocument>,
}

/// A named firewall rule set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rules: Vec<RuleDocument>,
}

/// One rule row of the firewall rules table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub sensitivity: Option<String>,
    #[serde(default)]
    pub has_sensitivity: Option<bool>,
    #[serde(default)]
    pub pii_types: BTreeMap<String, bool>,
    #[serde(default)]
    pub custom_pii: Vec<CustomPiiDocument>,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub rate_limit_config: BTreeMap<String, Vec<RateLimitRuleDocument>>,
    #[serde(default, deserialize_with = "optional_number")]
    pub max_length: Option<u64>,
    #[serde(default)]
    pub allowed_languages: Vec<String>,
    #[serde(default)]
    pub failure_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomPiiDocument {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub id: Option<String>,
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRuleDocument {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub id: Option<String>,
    #[serde(alias = "requests", deserialize_with = "number")]
    pub requests_allowed: u64,
    #[serde(alias = "period", deserialize_with = "number")]
    pub period_seconds: u64,
    pub key_by: String,
    #[serde(default)]
    pub api_key_references: Vec<ApiKeyReferenceDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyReferenceDocument {
    pub source: String,
    #[serde(alias = "keyName")]
    pub name: String,
}

/// An applied application as saved from the application editor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDocument {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub firewall_config_id: String,
    #[serde(deserialize_with = "float")]
    pub sample_rate: f64,
    pub endpoints: Vec<EndpointDocument>,
    #[serde(default)]
    pub check_input: bool,
    #[serde(default)]
    pub input_json_path: String,
    #[serde(default, deserialize_with = "optional_number")]
    pub input_max_length: Option<u64>,
    #[serde(default)]
    pub input_encoding: Option<String>,
    #[serde(default)]
    pub check_output: bool,
    #[serde(default)]
    pub output_json_path: String,
    #[serde(default, deserialize_with = "optional_number")]
    pub output_max_length: Option<u64>,
    #[serde(default)]
    pub output_encoding: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDocument {
    #[serde(alias = "hostnamePattern")]
    pub hostnames: String,
    #[serde(default, alias = "pathPrefix")]
    pub path: String,
}

// The console's number inputs hand back strings once edited, and an
// untouched optional field is an empty string. Both shapes are accepted;
// anything else is a type error.

enum Loose {
    Missing,
    Int(u64),
    Float(f64),
    Text(String),
}

struct LooseVisitor;

impl<'de> Visitor<'de> for LooseVisitor {
    type Value = Loose;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number, a numeric string, or null")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Loose, E> {
        Ok(Loose::Int(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Loose, E> {
        if v < 0 {
            return Ok(Loose::Float(v as f64));
        }
        Ok(Loose::Int(v as u64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Loose, E> {
        Ok(Loose::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Loose, E> {
        Ok(Loose::Text(v.trim().to_string()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Loose, E> {
        Ok(Loose::Missing)
    }

    fn visit_none<E: de::Error>(self) -> Result<Loose, E> {
        Ok(Loose::Missing)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Loose, D::Error> {
        d.deserialize_any(LooseVisitor)
    }
}

fn optional_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    match d.deserialize_any(LooseVisitor)? {
        Loose::Missing => Ok(None),
        Loose::Int(v) => Ok(Some(v)),
        Loose::Float(v) if v >= 0.0 && v.fract() == 0.0 => Ok(Some(v as u64)),
        Loose::Float(v) => Err(de::Error::custom(format!("expected a non-negative integer, got {v}"))),
        Loose::Text(s) if s.is_empty() => Ok(None),
        Loose::Text(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a non-negative integer, got '{s}'"))),
    }
}

fn number<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    optional_number(d)?.ok_or_else(|| de::Error::custom("missing number"))
}

fn float<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match d.deserialize_any(LooseVisitor)? {
        Loose::Int(v) => Ok(v as f64),
        Loose::Float(v) => Ok(v),
        Loose::Text(s) => s
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("expected a number, got '{s}'"))),
        Loose::Missing => Err(de::Error::custom("missing number")),
    }
}

pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    optional_string_or_number(d)?.ok_or_else(|| de::Error::custom("missing identifier"))
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match d.deserialize_any(LooseVisitor)? {
        Loose::Missing => Ok(None),
        Loose::Int(v) => Ok(Some(v.to_string())),
        Loose::Float(v) => Ok(Some(v.to_string())),
        Loose::Text(s) if s.is_empty() => Ok(None),
        Loose::Text(s) => Ok(Some(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_application_accepts_console_shape() {
        let doc: ApplicationDocument = serde_json::from_value(json!({
            "id": 1,
            "appName": "Customer Service Bot",
            "tags": ["chatbot"],
            "firewallConfigId": "prod-rules-v1",
            "sampleRate": "75",
            "endpoints": [{ "hostnames": "chatbot.example.com", "path": "/v1/chat" }],
            "checkInput": true,
            "inputJsonPath": "$.prompt",
            "inputMaxLength": "8000",
            "inputEncoding": "None",
            "checkOutput": false,
            "outputJsonPath": "",
            "outputMaxLength": "",
            "outputEncoding": "None"
        }))
        .unwrap();

        assert_eq!(doc.id, "1");
        assert_eq!(doc.sample_rate, 75.0);
        assert_eq!(doc.input_max_length, Some(8000));
        assert_eq!(doc.output_max_length, None);
        assert_eq!(doc.endpoints[0].hostnames, "chatbot.example.com");
    }

    #[test]
    fn test_endpoint_accepts_engine_names() {
        let ep: EndpointDocument = serde_json::from_value(json!({
            "hostnamePattern": "*.example.com",
            "pathPrefix": "/api"
        }))
        .unwrap();
        assert_eq!(ep.hostnames, "*.example.com");
        assert_eq!(ep.path, "/api");
    }

    #[test]
    fn test_rate_limit_rule_aliases() {
        let rule: RateLimitRuleDocument = serde_json::from_value(json!({
            "id": 1,
            "requests": "10",
            "period": 60,
            "keyBy": "API Key",
            "apiKeyReferences": [{ "id": 2, "source": "Header", "keyName": "x-api-key" }]
        }))
        .unwrap();
        assert_eq!(rule.requests_allowed, 10);
        assert_eq!(rule.period_seconds, 60);
        assert_eq!(rule.api_key_references[0].name, "x-api-key");
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let result: Result<ApplicationDocument, _> = serde_json::from_value(json!({
            "id": "a",
            "firewallConfigId": "x",
            "sampleRate": "lots",
            "endpoints": []
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let result: Result<RuleDocument, _> = serde_json::from_value(json!({ "id": "pii_input" }));
        assert!(result.is_err());
    }
}
