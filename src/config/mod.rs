//! Configuration management for the firewall engine service.
//!
//! This module handles loading the service settings from a configuration
//! file layered with environment variables. Firewall rule sets and
//! application bindings are not service settings; they live in
//! [`crate::core::ConfigStore`].

use std::env;
use ::config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::Config;

/// Load configuration from the config file and `FIREWALL__*` environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_config_from(&config_file)
}

/// Load configuration from an explicit settings file, still layered with the environment
pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .add_source(File::with_name(config_file).required(false))
        .add_source(Environment::with_prefix("FIREWALL").separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("engine.enabled", true)?
        .set_default("engine.adapter_timeout_ms", 500)?
        .set_default("engine.failure_policy", "fail_open")?
        .set_default("engine.sweep_interval_secs", 30)?
        .set_default("scoring.default_allowed_languages", vec!["en"])?
        .set_default("rule_config.config_file", "config/firewall.json")?
        .set_default("analytics.enabled", true)?
        .set_default("analytics.retention_days", 30)?
        .set_default("monitoring.metrics_enabled", true)?
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailurePolicy;

    #[test]
    fn test_defaults_without_config_file() {
        let config = load_config_from("config/does-not-exist").unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(config.engine.enabled);
        assert_eq!(config.engine.adapter_timeout_ms, 500);
        assert_eq!(config.engine.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.scoring.default_allowed_languages, vec!["en".to_string()]);
        assert!(config.scoring.toxicity_url.is_none());
        assert_eq!(config.analytics.retention_days, 30);
    }
}
