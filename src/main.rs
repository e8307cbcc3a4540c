//! AI Firewall Engine
//!
//! This is the main entry point for the firewall rule evaluation service.
//! It initializes the engine components and starts the web server.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use ai_firewall_engine::api::{self, ApiState};
use ai_firewall_engine::config;
use ai_firewall_engine::core::{Analytics, ConfigStore, LogAuditSink, PolicyEngine};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting AI Firewall Engine...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    let metrics = if config.monitoring.metrics_enabled {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?,
        )
    } else {
        None
    };

    // Firewall rule sets and application bindings
    let store = Arc::new(ConfigStore::new());
    if let Some(path) = &config.rule_config.config_file {
        match store.load_from_path(path) {
            Ok(version) => info!("Loaded firewall configuration from {} (version {})", path, version),
            Err(e) => warn!("Starting without firewall configuration from {}: {}", path, e),
        }
    }

    let analytics = Arc::new(Analytics::new(config.analytics.clone()));
    let engine = PolicyEngine::from_config(&config.engine, &config.scoring, store)
        .with_sink(Arc::new(LogAuditSink))
        .with_sink(analytics.clone());

    let state = web::Data::new(ApiState {
        engine: Arc::new(engine),
        analytics,
        metrics,
    });

    info!("Listening on {}:{}", config.server.host, config.server.port);

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?
        .run()
        .await
        .context("HTTP server failed")
}
