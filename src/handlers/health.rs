use axum::{extract::State, response::Json};
use tracing::instrument;

use crate::models::HealthResponse;

/// Static facts about the running service reported by the health check
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_name: String,
    pub tracing_enabled: bool,
}

/// Health check endpoint handler
#[instrument(name = "health_check", skip(info))]
pub async fn health_check(State(info): State<ServiceInfo>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: info.service_name,
        version: env!("CARGO_PKG_VERSION").to_string(),
        tracing_enabled: info.tracing_enabled,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
