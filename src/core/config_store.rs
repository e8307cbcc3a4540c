//! Versioned, validated configuration snapshots.
//!
//! Every change builds a complete [`ConfigSnapshot`] off to the side and
//! swaps it in as one `Arc`. Readers clone the `Arc` and keep evaluating
//! against it for as long as they need; a rejected change never touches
//! the active snapshot.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::core::document::{ApplicationDocument, ConfigDocument, RuleSetDocument};
use crate::core::rules::{AppliedApplication, ConfigError, FirewallRuleSet};

/// Immutable view of every rule set and application binding
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    rule_sets: HashMap<String, Arc<FirewallRuleSet>>,
    /// Document order; endpoint resolution picks the first match
    applications: Vec<Arc<AppliedApplication>>,
}

impl ConfigSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            loaded_at: Utc::now(),
            rule_sets: HashMap::new(),
            applications: Vec::new(),
        }
    }

    fn build(
        version: u64,
        rule_sets: HashMap<String, Arc<FirewallRuleSet>>,
        applications: Vec<Arc<AppliedApplication>>,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for app in &applications {
            if !seen.insert(app.id.as_str()) {
                return Err(ConfigError::DuplicateId("application", app.id.clone()));
            }
            if !rule_sets.contains_key(&app.firewall_config_id) {
                return Err(ConfigError::UnknownRuleSet {
                    app: app.id.clone(),
                    rule_set: app.firewall_config_id.clone(),
                });
            }
        }
        Ok(Self {
            version,
            loaded_at: Utc::now(),
            rule_sets,
            applications,
        })
    }

    pub fn rule_set(&self, id: &str) -> Option<&Arc<FirewallRuleSet>> {
        self.rule_sets.get(id)
    }

    pub fn application(&self, id: &str) -> Option<&Arc<AppliedApplication>> {
        self.applications.iter().find(|app| app.id == id)
    }

    /// First application, in document order, with an endpoint matching the request
    pub fn resolve_application(&self, host: &str, path: &str) -> Option<&Arc<AppliedApplication>> {
        self.applications.iter().find(|app| app.matches_endpoint(host, path))
    }

    pub fn rule_set_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rule_sets.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn application_ids(&self) -> Vec<String> {
        self.applications.iter().map(|app| app.id.clone()).collect()
    }

    /// The document this snapshot was built from
    pub fn to_document(&self) -> ConfigDocument {
        let mut firewall_configs: Vec<RuleSetDocument> =
            self.rule_sets.values().map(|set| set.document.clone()).collect();
        firewall_configs.sort_by(|a, b| a.id.cmp(&b.id));
        ConfigDocument {
            firewall_configs,
            apps: self.applications.iter().map(|app| app.document.clone()).collect(),
        }
    }
}

/// Holder of the active snapshot
pub struct ConfigStore {
    active: RwLock<Arc<ConfigSnapshot>>,
    // serialises writers so versions are never skipped or reused
    writer: Mutex<()>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(ConfigSnapshot::empty())),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the whole configuration
    pub fn replace(&self, document: ConfigDocument) -> Result<u64, ConfigError> {
        self.apply("replace", |_| {
            let mut rule_sets = HashMap::new();
            for doc in document.firewall_configs {
                let set = FirewallRuleSet::compile(doc)?;
                if rule_sets.contains_key(&set.id) {
                    return Err(ConfigError::DuplicateId("firewall config", set.id));
                }
                rule_sets.insert(set.id.clone(), Arc::new(set));
            }
            let applications = document
                .apps
                .into_iter()
                .map(|doc| AppliedApplication::compile(doc).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((rule_sets, applications))
        })
    }

    pub fn load_from_path(&self, path: impl AsRef<Path>) -> Result<u64, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let document: ConfigDocument = serde_json::from_str(&raw)?;
        self.replace(document)
    }

    pub fn upsert_rule_set(&self, document: RuleSetDocument) -> Result<u64, ConfigError> {
        self.apply("upsert_rule_set", |current| {
            let set = FirewallRuleSet::compile(document)?;
            let mut rule_sets = current.rule_sets.clone();
            rule_sets.insert(set.id.clone(), Arc::new(set));
            Ok((rule_sets, current.applications.clone()))
        })
    }

    pub fn remove_rule_set(&self, id: &str) -> Result<u64, ConfigError> {
        self.apply("remove_rule_set", |current| {
            if !current.rule_sets.contains_key(id) {
                return Err(ConfigError::NotFound("firewall config", id.to_string()));
            }
            if let Some(app) = current.applications.iter().find(|app| app.firewall_config_id == id) {
                return Err(ConfigError::RuleSetInUse {
                    rule_set: id.to_string(),
                    app: app.id.clone(),
                });
            }
            let mut rule_sets = current.rule_sets.clone();
            rule_sets.remove(id);
            Ok((rule_sets, current.applications.clone()))
        })
    }

    pub fn upsert_application(&self, document: ApplicationDocument) -> Result<u64, ConfigError> {
        self.apply("upsert_application", |current| {
            let app = Arc::new(AppliedApplication::compile(document)?);
            let mut applications = current.applications.clone();
            match applications.iter_mut().find(|existing| existing.id == app.id) {
                Some(slot) => *slot = app,
                None => applications.push(app),
            }
            Ok((current.rule_sets.clone(), applications))
        })
    }

    pub fn remove_application(&self, id: &str) -> Result<u64, ConfigError> {
        self.apply("remove_application", |current| {
            let mut applications = current.applications.clone();
            let before = applications.len();
            applications.retain(|app| app.id != id);
            if applications.len() == before {
                return Err(ConfigError::NotFound("application", id.to_string()));
            }
            Ok((current.rule_sets.clone(), applications))
        })
    }

    fn apply<F>(&self, operation: &'static str, change: F) -> Result<u64, ConfigError>
    where
        F: FnOnce(
            &ConfigSnapshot,
        ) -> Result<(HashMap<String, Arc<FirewallRuleSet>>, Vec<Arc<AppliedApplication>>), ConfigError>,
    {
        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.snapshot();

        let result = change(current.as_ref())
            .and_then(|(rule_sets, applications)| ConfigSnapshot::build(current.version + 1, rule_sets, applications));

        match result {
            Ok(next) => {
                let version = next.version;
                *self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);
                metrics::increment_counter!("firewall_config_reloads_total", "outcome" => "applied");
                info!("Configuration {} applied, now at version {}", operation, version);
                Ok(version)
            }
            Err(e) => {
                metrics::increment_counter!("firewall_config_reloads_total", "outcome" => "rejected");
                warn!(
                    "Configuration {} rejected, version {} stays active: {}",
                    operation, current.version, e
                );
                Err(e)
            }
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
