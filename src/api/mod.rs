//! API endpoints for the firewall engine.
//!
//! The gateway calls `/evaluate` for every message it forwards; the
//! configuration console saves rule sets and application bindings through
//! the `firewall-configs` and `applications` resources.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use log::warn;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::document::string_or_number;
use crate::core::{
    Analytics, ApplicationDocument, ConfigError, Direction, EngineError, PolicyEngine, RequestMetadata,
    RuleSetDocument,
};

pub struct ApiState {
    pub engine: Arc<PolicyEngine>,
    pub analytics: Arc<Analytics>,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/evaluate").route(web::post().to(evaluate)))
            .service(web::resource("/config").route(web::get().to(get_config)))
            .service(web::resource("/firewall").route(web::put().to(set_firewall)))
            .service(
                web::resource("/firewall-configs/{id}")
                    .route(web::put().to(put_firewall_config))
                    .route(web::delete().to(delete_firewall_config)),
            )
            .service(
                web::resource("/applications/{id}")
                    .route(web::put().to(put_application))
                    .route(web::delete().to(delete_application)),
            )
            .service(web::resource("/analytics/summary").route(web::get().to(analytics_summary))),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

/// Health check endpoint response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
}

/// Message evaluation request from the gateway
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    #[serde(deserialize_with = "string_or_number")]
    pub application_id: String,
    pub direction: Direction,
    pub payload: Value,
    #[serde(flatten)]
    pub metadata: RequestMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionResponse {
    version: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    version: u64,
    loaded_at: chrono::DateTime<chrono::Utc>,
    firewall_enabled: bool,
    firewall_configs: Vec<String>,
    applications: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FirewallSwitch {
    pub enabled: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(status: actix_web::http::StatusCode, message: impl ToString) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: message.to_string(),
    })
}

fn config_result(result: Result<u64, ConfigError>) -> HttpResponse {
    use actix_web::http::StatusCode;
    match result {
        Ok(version) => HttpResponse::Ok().json(VersionResponse { version }),
        Err(e @ ConfigError::NotFound(..)) => error(StatusCode::NOT_FOUND, e),
        Err(e @ ConfigError::RuleSetInUse { .. }) => error(StatusCode::CONFLICT, e),
        Err(e) => error(StatusCode::BAD_REQUEST, e),
    }
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Evaluate one message against its application's rule set
pub async fn evaluate(state: web::Data<ApiState>, req: web::Json<EvaluateRequest>) -> impl Responder {
    use actix_web::http::StatusCode;
    let req = req.into_inner();
    match state
        .engine
        .inspect(&req.application_id, req.direction, &req.payload, req.metadata)
        .await
    {
        Ok(decision) => HttpResponse::Ok().json(decision),
        Err(e @ EngineError::UnknownApplication(_)) => error(StatusCode::NOT_FOUND, e),
        Err(e @ EngineError::Extraction(_)) => {
            warn!("Could not extract message for application {}: {}", req.application_id, e);
            error(StatusCode::UNPROCESSABLE_ENTITY, e)
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn put_firewall_config(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    doc: web::Json<RuleSetDocument>,
) -> impl Responder {
    let mut doc = doc.into_inner();
    doc.id = path.into_inner();
    config_result(state.engine.store().upsert_rule_set(doc))
}

async fn delete_firewall_config(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    config_result(state.engine.store().remove_rule_set(&path))
}

async fn put_application(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    doc: web::Json<ApplicationDocument>,
) -> impl Responder {
    let mut doc = doc.into_inner();
    doc.id = path.into_inner();
    config_result(state.engine.store().upsert_application(doc))
}

async fn delete_application(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    config_result(state.engine.store().remove_application(&path))
}

async fn get_config(state: web::Data<ApiState>) -> impl Responder {
    let snapshot = state.engine.store().snapshot();
    HttpResponse::Ok().json(ConfigResponse {
        version: snapshot.version,
        loaded_at: snapshot.loaded_at,
        firewall_enabled: state.engine.is_enabled(),
        firewall_configs: snapshot.rule_set_ids(),
        applications: snapshot.application_ids(),
    })
}

async fn set_firewall(state: web::Data<ApiState>, req: web::Json<FirewallSwitch>) -> impl Responder {
    state.engine.set_enabled(req.enabled);
    HttpResponse::Ok().json(FirewallSwitch {
        enabled: state.engine.is_enabled(),
    })
}

async fn analytics_summary(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.analytics.summary())
}

async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => error(actix_web::http::StatusCode::NOT_FOUND, "metrics are disabled"),
    }
}
