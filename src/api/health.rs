#![allow(dead_code)]
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::app_state::AppState;
use crate::shield::ShieldState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

/// Individual health checks
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    telemetry: ComponentHealth,
    plan_store: ComponentHealth,
    shield: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self { status: "healthy".to_string(), error: None }
    }

    fn degraded(reason: impl Into<String>) -> Self {
        Self { status: "degraded".to_string(), error: Some(reason.into()) }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self { status: "unhealthy".to_string(), error: Some(error.into()) }
    }
}

/// GET /health - overall health: telemetry source health, plan store
/// reachability, and service shield state.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let telemetry_health = check_telemetry(&state).await;
    let store_health = check_store(&state).await;
    let shield_health = check_shield(&state).await;

    let all_healthy = telemetry_health.status == "healthy" && store_health.status == "healthy" && shield_health.status == "healthy";

    let response = HealthResponse {
        status: if all_healthy { "healthy".to_string() } else { "degraded".to_string() },
        timestamp: chrono::Utc::now(),
        checks: HealthChecks { telemetry: telemetry_health, plan_store: store_health, shield: shield_health },
    };

    let status_code = if all_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(response))
}

async fn check_telemetry(state: &AppState) -> ComponentHealth {
    use crate::domain::telemetry::SourceHealth;
    match state.telemetry.health().await {
        SourceHealth::Healthy => ComponentHealth::healthy(),
        SourceHealth::Degraded { consecutive_failures } => {
            ComponentHealth::degraded(format!("{consecutive_failures} consecutive poll failures"))
        }
    }
}

async fn check_store(state: &AppState) -> ComponentHealth {
    match state.store.get_active(state.box_id()).await {
        Ok(_) => ComponentHealth::healthy(),
        Err(e) => ComponentHealth::unhealthy(e.to_string()),
    }
}

async fn check_shield(state: &AppState) -> ComponentHealth {
    match state.shield.state().await {
        ShieldState::Normal => ComponentHealth::healthy(),
        ShieldState::Suspended => ComponentHealth::degraded("executor writes suspended by an external override"),
    }
}

/// GET /health/ready - Readiness probe for Kubernetes
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_active(state.box_id()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /health/live - Liveness probe for Kubernetes
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}
