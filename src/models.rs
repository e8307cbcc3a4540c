use serde::{Deserialize, Serialize};

/// What the evaluator does when a scoring adapter cannot produce a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the rule as not matched and log a warning
    #[default]
    FailOpen,
    /// Treat the rule as matched with a Deny action
    FailClosed,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Rule evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global firewall switch; when off every message is allowed unevaluated
    pub enabled: bool,
    /// Budget for a single scoring adapter call, in milliseconds
    pub adapter_timeout_ms: u64,
    /// Default behaviour when an adapter is unavailable
    pub failure_policy: FailurePolicy,
    /// Minimum interval between sweeps of idle rate-limit counters
    pub sweep_interval_secs: u64,
}

/// Scoring adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScoringConfig {
    /// External prompt-injection classifier; built-in heuristics when unset
    pub prompt_injection_url: Option<String>,
    /// External toxicity classifier; built-in lexicon when unset
    pub toxicity_url: Option<String>,
    /// External language identifier; built-in script detector when unset
    pub language_url: Option<String>,
    /// Languages allowed when a language rule does not list its own
    pub default_allowed_languages: Vec<String>,
}

/// Rule store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Firewall document loaded at startup
    pub config_file: Option<String>,
}

/// Analytics configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyticsConfig {
    /// Whether to aggregate decisions for the dashboard
    pub enabled: bool,
    /// Days of daily time series to keep
    pub retention_days: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether to install the Prometheus recorder
    pub metrics_enabled: bool,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Engine configuration
    pub engine: EngineConfig,
    /// Scoring adapter configuration
    pub scoring: ScoringConfig,
    /// Rule store configuration
    pub rule_config: RuleConfig,
    /// Analytics configuration
    pub analytics: AnalyticsConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            adapter_timeout_ms: 500,
            failure_policy: FailurePolicy::FailOpen,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            engine: EngineConfig::default(),
            scoring: ScoringConfig {
                default_allowed_languages: vec!["en".to_string()],
                ..ScoringConfig::default()
            },
            rule_config: RuleConfig {
                config_file: Some("config/firewall.json".to_string()),
            },
            analytics: AnalyticsConfig {
                enabled: true,
                retention_days: 30,
            },
            monitoring: MonitoringConfig {
                metrics_enabled: true,
            },
        }
    }
}
