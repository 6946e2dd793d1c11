//! Dynamic-programming refinement over a discretized SoC axis (§4.5).
//!
//! Grounded in the teacher's `optimizer::dp::DynamicProgrammingOptimizer`:
//! a backward value-iteration table over bucketed SoC states with
//! backtrack pointers, generalized here from 3 generic actions and 51
//! 2%-buckets to the 4 `ModeKind`s and a 0.5 kWh step.

use crate::domain::plan::{PlanError, SimulationContext, TargetSocPolicy, PLAN_INTERVALS};
use crate::domain::telemetry::ModeKind;
use crate::domain::types::Energy;
use crate::simulation::simulate_interval;

const SOC_STEP_KWH: f64 = 0.5;
const ALL_MODES: [ModeKind; 4] = [ModeKind::HomeI, ModeKind::HomeIi, ModeKind::HomeIii, ModeKind::HomeUps];

struct Grid {
    step: f64,
    num_states: usize,
    capacity: f64,
}

impl Grid {
    fn new(capacity: Energy) -> Self {
        let capacity = capacity.as_kwh();
        let num_states = (capacity / SOC_STEP_KWH).round() as usize + 1;
        Self { step: SOC_STEP_KWH, num_states, capacity }
    }

    fn index(&self, soc: Energy) -> usize {
        let raw = (soc.as_kwh() / self.step).round() as i64;
        raw.clamp(0, self.num_states as i64 - 1) as usize
    }

    fn soc(&self, idx: usize) -> Energy {
        Energy::kwh((idx as f64 * self.step).min(self.capacity))
    }
}

struct WindowBounds {
    start_idx: usize,
    end_idx: usize,
    mode: ModeKind,
}

fn resolve_window(ctx: &SimulationContext) -> Option<WindowBounds> {
    let window = ctx.holding_window()?;
    let start_idx = ctx.forecast.iter().position(|p| !p.ts.is_before(&window.start_ts))?;
    let end_idx = ctx
        .forecast
        .iter()
        .position(|p| !p.ts.is_before(&window.end_ts()))
        .unwrap_or(ctx.forecast.len());
    Some(WindowBounds { start_idx, end_idx, mode: window.holding_mode })
}

/// Solves `V[t][s] = min over mode of cost(t, mode, s) + V[t+1][s']`
/// backward from the horizon end. Intervals inside a holding window are
/// forced to the window's mode; for a `hard` target policy, states at the
/// window's entering boundary that miss the target by more than the
/// context's SoC tolerance are marked infeasible.
pub fn refine(ctx: &SimulationContext) -> Result<Vec<ModeKind>, PlanError> {
    let n = ctx.forecast.len().min(PLAN_INTERVALS);
    if n == 0 {
        return Err(PlanError::EmptyPlan);
    }
    let grid = Grid::new(ctx.capacity);
    let window = resolve_window(ctx);

    let mut value = vec![vec![0.0_f64; grid.num_states]; n + 1];
    let mut choice = vec![vec![None::<ModeKind>; grid.num_states]; n + 1];

    for t in (0..n).rev() {
        let forced_mode = window
            .as_ref()
            .filter(|w| t >= w.start_idx && t < w.end_idx)
            .map(|w| w.mode);
        let candidate_modes: Vec<ModeKind> = match forced_mode {
            Some(mode) => vec![mode],
            None => ALL_MODES.to_vec(),
        };

        for s in 0..grid.num_states {
            let soc_before = grid.soc(s);
            let mut best_cost = f64::INFINITY;
            let mut best_mode = None;
            let mut best_soc_after = f64::NEG_INFINITY;

            for &mode in &candidate_modes {
                let projection = simulate_interval(ctx, t, mode, soc_before);
                let next_idx = grid.index(projection.soc_after);
                let future = value[t + 1][next_idx];
                if !future.is_finite() {
                    continue;
                }
                let total = projection.cost_czk + future;
                let soc_after = projection.soc_after.as_kwh();
                let better = match best_mode {
                    None => true,
                    Some(current_best) => {
                        if total < best_cost {
                            true
                        } else if total > best_cost {
                            false
                        } else if soc_after != best_soc_after {
                            // Equal DP cost: prefer the trajectory with higher final SoC.
                            soc_after > best_soc_after
                        } else {
                            // Equal cost and equal resulting SoC: fall back to the
                            // per-interval tie-break order (§4.5).
                            mode.tie_break_rank() > current_best.tie_break_rank()
                        }
                    }
                };
                if better {
                    best_cost = total;
                    best_mode = Some(mode);
                    best_soc_after = soc_after;
                }
            }

            if let Some(w) = &window {
                if t == w.start_idx && ctx.target_policy == TargetSocPolicy::Hard {
                    let target = ctx.capacity.as_kwh();
                    if (soc_before.as_kwh() - target).abs() > ctx.soc_tolerance.as_kwh() {
                        best_cost = f64::INFINITY;
                        best_mode = None;
                    }
                }
            }

            value[t][s] = best_cost;
            choice[t][s] = best_mode;
        }
    }

    let start_idx = grid.index(ctx.initial_soc);
    if !value[0][start_idx].is_finite() {
        return Err(PlanError::Validation(
            "no feasible trajectory honors the holding window's target SoC".into(),
        ));
    }

    let mut modes = Vec::with_capacity(n);
    let mut s = start_idx;
    for t in 0..n {
        let mode = choice[t][s].ok_or_else(|| PlanError::Validation("dp backtrack hit an infeasible state".into()))?;
        modes.push(mode);
        let projection = simulate_interval(ctx, t, mode, grid.soc(s));
        s = grid.index(projection.soc_after);
    }
    Ok(modes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::forecast::{ForecastPoint, TariffParameters};
    use crate::domain::plan::PlanKind;
    use crate::domain::types::{Power, Price, Timestamp};

    fn ctx(forecast: Vec<ForecastPoint>) -> SimulationContext {
        SimulationContext {
            capacity: Energy::kwh(4.0),
            initial_soc: Energy::kwh(2.0),
            user_min_soc: Energy::kwh(1.0),
            soc_tolerance: Energy::kwh(0.5),
            forecast,
            tariff: TariffParameters {
                vat_rate: 0.0,
                distribution_surcharge_buy: Price::czk_per_kwh(0.0),
                distribution_surcharge_sell: Price::czk_per_kwh(0.0),
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
    fn refine_finds_a_trajectory_for_a_short_soft_horizon() {
        let context = ctx(vec![point(0.5, 0.3, 2.0), point(0.0, 0.4, 3.0)]);
        let modes = refine(&context).unwrap();
        assert_eq!(modes.len(), 2);
    }

    #[test]
    fn hard_target_infeasible_when_capacity_cannot_be_reached() {
        let mut context = ctx(vec![point(0.0, 1.0, 2.0)]);
        context.target_policy = TargetSocPolicy::Hard;
        context.target_time = Some(context.forecast[0].ts);
        context.holding_hours = Some(1.0);
        context.holding_mode = Some(ModeKind::HomeI);
        let result = refine(&context);
        assert!(result.is_err());
    }

    #[test]
    fn holding_window_forces_its_mode() {
        let mut context = ctx(vec![point(0.0, 0.1, 2.0), point(0.0, 0.1, 2.0)]);
        context.initial_soc = Energy::kwh(4.0);
        context.target_time = Some(context.forecast[0].ts);
        context.holding_hours = Some(0.25);
        context.holding_mode = Some(ModeKind::HomeI);
        let modes = refine(&context).unwrap();
        assert_eq!(modes[0], ModeKind::HomeI);
    }
}
