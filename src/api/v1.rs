//! Outward interface (§6): a read-only snapshot of the planning core's
//! state plus the two write operations, `request_manual_plan` and
//! `deactivate_plan`.
//!
//! Grounded in the teacher's `api::v1::router` module-per-resource layout
//! and `ApiResponse`-wrapped handler shape, generalized from the teacher's
//! battery/ev_charger/grid/inverter resources to the single planning-core
//! resource this spec names: plans, status, and commands.

use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "swagger")]
use utoipa::ToSchema;

use crate::api::command;
use crate::api::error::ApiError;
use crate::api::response::ApiResponse;
use crate::app_state::AppState;
use crate::auth::{auth_layer, Authenticated};
use crate::domain::plan::{Plan, PlanKind, PlanStatus};
use crate::domain::telemetry::{SourceHealth, TelemetrySnapshot};
use crate::domain::types::Timestamp;
use crate::domain::weather::WeatherWarning;
use crate::shield::ShieldState;
use crate::store::PlanFilter;

pub fn router(state: AppState) -> Router {
    let token: std::sync::Arc<str> = state.config.auth.bearer_token.as_str().into();

    let protected = Router::new()
        .route("/status", get(get_status))
        .route("/plans", get(list_plans))
        .route("/plans/manual", post(request_manual_plan))
        .route("/plans/:id/deactivate", post(deactivate_plan))
        .layer(middleware::from_fn_with_state(token, auth_layer));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
}

#[cfg_attr(feature = "swagger", derive(ToSchema))]
#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub telemetry: Option<TelemetrySnapshot>,
    pub telemetry_health: SourceHealth,
    pub forecast_horizon_points: usize,
    pub active_plan: Option<Plan>,
    pub shield_state: String,
    pub weather_warning: WeatherWarning,
}

/// GET /healthz -- liveness only, unauthenticated (§6, §9).
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /status -- the read-only snapshot named in §6: last telemetry,
/// active plan, shield state, current weather warning.
pub async fn get_status(State(state): State<AppState>, _auth: Authenticated) -> Result<Json<ApiResponse<SystemStatus>>, ApiError> {
    let telemetry = state.shared.telemetry().await;
    let forecast_horizon_points = state.shared.forecast().await.map(|f| f.len()).unwrap_or(0);
    let active_plan = state.store.get_active(state.box_id()).await?;
    let shield_state = match state.shield.state().await {
        ShieldState::Normal => "normal",
        ShieldState::Suspended => "suspended",
    }
    .to_string();
    let telemetry_health = state.telemetry.health().await;
    let weather_warning = state.weather.current_warning().await;

    Ok(Json(ApiResponse::success(SystemStatus {
        telemetry,
        telemetry_health,
        forecast_horizon_points,
        active_plan,
        shield_state,
        weather_warning,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PlanListQuery {
    pub kind: Option<PlanKind>,
    pub status: Option<PlanStatus>,
}

/// GET /plans?kind=&status= -- plan history (§6 "plan history").
pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlanListQuery>,
    _auth: Authenticated,
) -> Result<Json<ApiResponse<Vec<Plan>>>, ApiError> {
    let filter = PlanFilter { kind: query.kind, status: query.status };
    let plans = state.store.list(state.box_id(), filter).await?;
    Ok(Json(ApiResponse::success(plans)))
}

#[cfg_attr(feature = "swagger", derive(ToSchema))]
#[derive(Debug, Deserialize)]
pub struct ManualPlanRequest {
    /// Target state of charge, 0-100.
    pub target_soc_pct: f64,
    /// When the target must be reached, RFC3339.
    pub target_time: chrono::DateTime<chrono::FixedOffset>,
    /// How long to hold at the target once reached.
    pub holding_hours: f64,
    pub holding_mode: crate::domain::telemetry::ModeKind,
}

#[cfg_attr(feature = "swagger", derive(ToSchema))]
#[derive(Debug, Serialize)]
pub struct ManualPlanResponse {
    pub plan_id: Uuid,
}

/// POST /plans/manual -- request a manual plan (§6). Rejected with 409 if
/// a weather-emergency plan is currently active (Open Question 3).
pub async fn request_manual_plan(
    State(state): State<AppState>,
    _auth: Authenticated,
    Json(body): Json<ManualPlanRequest>,
) -> Result<Json<ApiResponse<ManualPlanResponse>>, ApiError> {
    let now = Timestamp::now();
    let plan_id = command::request_manual_plan(
        &state,
        body.target_soc_pct,
        Timestamp(body.target_time),
        body.holding_hours,
        body.holding_mode,
        now,
    )
    .await?;
    Ok(Json(ApiResponse::success(ManualPlanResponse { plan_id })))
}

/// POST /plans/:id/deactivate -- deactivate a plan (§6).
pub async fn deactivate_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    _auth: Authenticated,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let now = Timestamp::now();
    command::deactivate_plan(&state, id, now).await?;
    Ok(Json(ApiResponse::success(())))
}
