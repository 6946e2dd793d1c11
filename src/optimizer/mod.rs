//! Two-pass forward/backward scoring plus DP refinement over a discretized
//! SoC axis, producing a 192-interval `Plan` from a `SimulationContext`
//! (§4.5). Grounded in the teacher's `optimizer` module split, generalized
//! from a single greedy/DP strategy choice to a fixed three-stage pipeline.

pub mod backward;
pub mod dp;
pub mod forward;

use uuid::Uuid;

use crate::domain::plan::{
    ContextSummary, IntervalProjection, Plan, PlanStatus, PlanSummaryMetrics, SimulationContext,
    TargetSocPolicy, PLAN_INTERVALS,
};
use crate::domain::telemetry::ModeKind;
use crate::domain::types::Timestamp;
use crate::errors::CoreError;
use crate::simulation::simulate_interval;

/// Runs the full optimizer pipeline and returns a `simulated`-status plan
/// ready for the plan store. On a `hard` target policy that cannot be met,
/// returns `CoreError::Infeasible` carrying the forward/backward best
/// effort and the remaining shortfall.
pub fn optimize(ctx: &SimulationContext, now: Timestamp) -> Result<Plan, CoreError> {
    ctx.validate(now)?;

    let scored = forward::run(ctx);
    let repaired = backward::run(ctx, scored);
    let best_effort = assemble_plan(ctx, now, repaired);

    match dp::refine(ctx) {
        Ok(modes) => Ok(assemble_plan(ctx, now, simulate_modes(ctx, &modes))),
        Err(_) if ctx.target_policy == TargetSocPolicy::Hard => Err(CoreError::Infeasible {
            shortfall_kwh: shortfall_kwh(ctx, &best_effort),
            best_effort: Box::new(best_effort),
        }),
        Err(_) => Ok(best_effort),
    }
}

fn simulate_modes(ctx: &SimulationContext, modes: &[ModeKind]) -> Vec<IntervalProjection> {
    let mut soc = ctx.initial_soc;
    let mut intervals = Vec::with_capacity(modes.len());
    for (idx, &mode) in modes.iter().enumerate() {
        let projection = simulate_interval(ctx, idx, mode, soc);
        soc = projection.soc_after;
        intervals.push(projection);
    }
    intervals
}

/// Distance between the entering SoC of the holding window and its target,
/// used to report `ErrInfeasible`'s shortfall.
fn shortfall_kwh(ctx: &SimulationContext, plan: &Plan) -> f64 {
    let Some(window) = ctx.holding_window() else {
        return 0.0;
    };
    let target = ctx.capacity.as_kwh();
    plan.intervals
        .iter()
        .find(|i| !i.ts.is_before(&window.start_ts))
        .map(|i| (target - i.soc_before.as_kwh()).max(0.0))
        .unwrap_or(0.0)
}

fn assemble_plan(ctx: &SimulationContext, now: Timestamp, intervals: Vec<IntervalProjection>) -> Plan {
    let total_cost_czk = intervals.iter().map(|i| i.cost_czk).sum();
    let total_import_kwh = intervals.iter().map(|i| i.grid_import.as_kwh()).sum();
    let total_export_kwh = intervals.iter().map(|i| i.grid_export.as_kwh()).sum();
    let final_soc_kwh = intervals
        .last()
        .map(|i| i.soc_after.as_kwh())
        .unwrap_or(ctx.initial_soc.as_kwh());
    let horizon_truncated = intervals.len() < PLAN_INTERVALS;

    Plan {
        plan_id: Uuid::new_v4(),
        kind: ctx.plan_kind,
        status: PlanStatus::Simulated,
        created_ts: now,
        activated_ts: None,
        deactivated_ts: None,
        context_summary: ContextSummary {
            capacity: ctx.capacity,
            initial_soc: ctx.initial_soc,
            user_min_soc: ctx.user_min_soc,
            target_policy: ctx.target_policy,
            holding_window: ctx.holding_window(),
        },
        intervals,
        total_cost_czk,
        summary_metrics: PlanSummaryMetrics {
            total_import_kwh,
            total_export_kwh,
            final_soc_kwh,
            horizon_truncated,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::forecast::{ForecastPoint, TariffParameters};
    use crate::domain::plan::PlanKind;
    use crate::domain::types::{Energy, Power, Price};

    fn ctx(forecast: Vec<ForecastPoint>) -> SimulationContext {
        SimulationContext {
            capacity: Energy::kwh(10.0),
            initial_soc: Energy::kwh(4.0),
            user_min_soc: Energy::kwh(2.0),
            soc_tolerance: Energy::kwh(0.5),
            forecast,
            tariff: TariffParameters {
                vat_rate: 0.21,
                distribution_surcharge_buy: Price::czk_per_kwh(1.0),
                distribution_surcharge_sell: Price::czk_per_kwh(0.1),
                sell_asymmetry: 0.4,
            },
            target_policy: TargetSocPolicy::Soft,
            target_time: None,
            holding_hours: None,
            holding_mode: None,
            cheap_threshold: Price::czk_per_kwh(1.5),
            plan_kind: PlanKind::Automatic,
            home_charge_rate: Power::watts(3000.0),
            max_charge_power: Power::kilowatts(5.0),
            max_discharge_power: Power::kilowatts(5.0),
            grid_export_limit: Power::kilowatts(10.0),
        }
    }

    fn point(pv: f64, load: f64, price: f64) -> ForecastPoint {
        ForecastPoint {
            ts: Timestamp::now(),
            pv: Energy::kwh(pv),
            load: Energy::kwh(load),
            spot_price: Price::czk_per_kwh(price),
        }
    }

    #[test]
    fn optimize_produces_a_simulated_plan_for_a_soft_horizon() {
        let context = ctx((0..8).map(|i| point(0.3, 0.4, 1.0 + i as f64 * 0.1)).collect());
        let plan = optimize(&context, Timestamp::now()).unwrap();
        assert_eq!(plan.status, PlanStatus::Simulated);
        assert_eq!(plan.intervals.len(), 8);
    }

    #[test]
    fn infeasible_hard_target_surfaces_best_effort_and_shortfall() {
        let mut context = ctx(vec![point(0.0, 0.1, 2.0)]);
        context.target_policy = TargetSocPolicy::Hard;
        context.target_time = Some(context.forecast[0].ts);
        context.holding_hours = Some(1.0);
        context.holding_mode = Some(ModeKind::HomeI);
        context.capacity = Energy::kwh(100.0);
        context.initial_soc = Energy::kwh(1.0);

        let err = optimize(&context, Timestamp::now()).unwrap_err();
        match err {
            CoreError::Infeasible { shortfall_kwh, .. } => assert!(shortfall_kwh > 0.0),
            other => panic!("expected Infeasible, got {other:?}"),
        }
    }
}
