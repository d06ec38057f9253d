//! Liveness reporting and the HTTP surface around it

use actix_web::{web, HttpResponse};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Anything that can report its own liveness
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> HealthStatus;
}

/// Shared state of the HTTP handlers
pub struct AppState {
    pub health: Arc<dyn HealthCheck>,
    pub registry: Registry,
}

/// Register `/health`, `/ready` and `/metrics`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(health))
        .route("/metrics", web::get().to(metrics));
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.health.check() {
        HealthStatus::Healthy => HttpResponse::Ok().body("OK"),
        HealthStatus::Unhealthy => HttpResponse::ServiceUnavailable().body("UNHEALTHY"),
    }
}

async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
