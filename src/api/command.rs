//! The outward interface's two write operations (§6): request a manual
//! plan, or deactivate a plan. Both go through the same `optimizer`/`store`
//! path the scheduler's own automatic/balancing/weather tasks use.
//!
//! Grounded in `weather_emergency::on_warning`'s synthesize-then-activate
//! shape, generalized here to an operator-supplied target instead of a
//! weather-warning-derived one.

use uuid::Uuid;

use crate::app_state::AppState;
use crate::domain::plan::{PlanKind, SimulationContext, TargetSocPolicy};
use crate::domain::telemetry::ModeKind;
use crate::domain::types::{Energy, Power, Price, Timestamp};
use crate::errors::CoreError;
use crate::optimizer::optimize;
use crate::store::PlanStore;

/// Synthesizes and activates a manual plan targeting `target_soc_pct` by
/// `target_time`, holding there for `holding_hours` in `holding_mode`
/// (§6). Rejected with `CoreError::Overridden` while a weather-emergency
/// plan is active -- manual plans never preempt one (Open Question 3).
#[allow(clippy::too_many_arguments)]
pub async fn request_manual_plan(
    state: &AppState,
    target_soc_pct: f64,
    target_time: Timestamp,
    holding_hours: f64,
    holding_mode: ModeKind,
    now: Timestamp,
) -> Result<Uuid, CoreError> {
    if state.weather_planner.is_active().await {
        let overridden = state.shield.overridden_plan_id().await;
        return Err(CoreError::Overridden {
            plan_id: overridden.unwrap_or_else(Uuid::nil),
        });
    }

    let telemetry = state
        .shared
        .telemetry()
        .await
        .ok_or_else(|| CoreError::ProviderUnavailable { source: "no telemetry snapshot available yet".into() })?;
    let forecast = state
        .shared
        .forecast()
        .await
        .ok_or_else(|| CoreError::ProviderUnavailable { source: "no forecast horizon available yet".into() })?;

    let battery = &state.config.battery;
    let tariff = &state.config.tariff;

    let ctx = SimulationContext {
        capacity: telemetry.capacity,
        initial_soc: telemetry.soc,
        user_min_soc: Energy::kwh(telemetry.capacity.as_kwh() * battery.user_min_soc_pct / 100.0),
        soc_tolerance: Energy::kwh(0.5),
        forecast,
        tariff: tariff.to_tariff_parameters(),
        target_policy: TargetSocPolicy::Hard,
        target_time: Some(target_time),
        holding_hours: Some(holding_hours),
        holding_mode: Some(holding_mode),
        cheap_threshold: Price::czk_per_kwh(tariff.threshold_cheap_czk),
        plan_kind: PlanKind::Manual,
        home_charge_rate: Power::watts(battery.home_charge_rate_w),
        max_charge_power: Power::kilowatts(battery.max_charge_kw),
        max_discharge_power: Power::kilowatts(battery.max_discharge_kw),
        grid_export_limit: Power::kilowatts(battery.grid_export_limit_kw),
    };
    ctx.validate(now)?;

    let plan = optimize(&ctx, now)?;
    let plan_id = state.store.create(state.box_id(), plan).await?;
    state.store.activate(state.box_id(), plan_id, now).await?;
    Ok(plan_id)
}

/// Deactivates `plan_id` if it is the currently active plan (§6). A no-op
/// (`Ok(())`) if the plan is not active -- deactivation is idempotent from
/// the caller's point of view, matching `Plan::transition`'s own
/// idempotent re-activation rule.
pub async fn deactivate_plan(state: &AppState, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError> {
    state.store.deactivate(state.box_id(), plan_id, now).await
}
