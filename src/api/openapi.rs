#[cfg(feature = "swagger")]
use utoipa::OpenApi;

#[cfg(feature = "swagger")]
use crate::api::v1::{ManualPlanRequest, ManualPlanResponse, SystemStatus};

#[cfg(feature = "swagger")]
use crate::domain::plan::{ContextSummary, HoldingWindow, IntervalProjection, Plan, PlanKind, PlanStatus, PlanSummaryMetrics, TargetSocPolicy};

#[cfg(feature = "swagger")]
use crate::domain::telemetry::{BoilerState, ModeKind, SourceHealth, TelemetrySnapshot};

#[cfg(feature = "swagger")]
use crate::domain::types::{Energy, Percentage, Power, Price, Timestamp};

#[cfg(feature = "swagger")]
use crate::domain::weather::{Severity, WeatherWarning};

#[cfg(feature = "swagger")]
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::v1::healthz,
        crate::api::v1::get_status,
        crate::api::v1::list_plans,
        crate::api::v1::request_manual_plan,
        crate::api::v1::deactivate_plan,
    ),
    components(schemas(
        SystemStatus,
        ManualPlanRequest,
        ManualPlanResponse,
        Plan,
        PlanKind,
        PlanStatus,
        PlanSummaryMetrics,
        IntervalProjection,
        HoldingWindow,
        ContextSummary,
        TargetSocPolicy,
        TelemetrySnapshot,
        SourceHealth,
        BoilerState,
        ModeKind,
        WeatherWarning,
        Severity,
        Energy,
        Power,
        Price,
        Percentage,
        Timestamp,
    )),
    tags((name = "battery-box-planner", description = "Battery planning and balancing core API"))
)]
pub struct ApiDoc;
