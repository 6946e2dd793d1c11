//! Deficit-repair pass: walks the provisional trajectory backward and
//! upgrades an earlier interval to a charging mode whenever a later deficit
//! is found, then re-simulates forward from the upgrade point (§4.5).

use crate::domain::plan::{IntervalProjection, SimulationContext};
use crate::domain::telemetry::ModeKind;
use crate::simulation::simulate_interval;

/// Best-effort: if no earlier interval can be upgraded, the remaining
/// deficit is left in place for the caller to surface as a shortfall.
pub fn run(ctx: &SimulationContext, mut intervals: Vec<IntervalProjection>) -> Vec<IntervalProjection> {
    loop {
        let Some(deficit_idx) = intervals.iter().position(|i| i.deficit) else {
            break;
        };

        let upgrade = (0..deficit_idx).rev().find_map(|j| {
            let mode = intervals[j].mode;
            if mode == ModeKind::HomeIii || mode == ModeKind::HomeUps {
                return None;
            }
            let point = &ctx.forecast[j];
            let charging_mode = if point.pv.as_kwh() > point.load.as_kwh() {
                ModeKind::HomeIii
            } else {
                ModeKind::HomeUps
            };
            Some((j, charging_mode))
        });

        let Some((j, new_mode)) = upgrade else {
            break;
        };

        let mut soc = if j == 0 {
            ctx.initial_soc
        } else {
            intervals[j - 1].soc_after
        };
        for idx in j..intervals.len() {
            let mode = if idx == j { new_mode } else { intervals[idx].mode };
            let projection = simulate_interval(ctx, idx, mode, soc);
            soc = projection.soc_after;
            intervals[idx] = projection;
        }
    }
    intervals
}
