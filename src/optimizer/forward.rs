//! Scoring pass: picks a provisional mode per interval and simulates the
//! resulting trajectory from `initial_soc` (§4.5 "forward pass").

use crate::domain::plan::{IntervalProjection, SimulationContext, PLAN_INTERVALS};
use crate::domain::telemetry::ModeKind;
use crate::domain::types::Energy;
use crate::simulation::simulate_interval;

const SOC_BUFFER_KWH: f64 = 0.5;

/// Always produces a full-length trajectory; intervals may still carry
/// `deficit` for the backward pass to repair.
pub fn run(ctx: &SimulationContext) -> Vec<IntervalProjection> {
    let n = ctx.forecast.len().min(PLAN_INTERVALS);
    let mut intervals = Vec::with_capacity(n);
    let mut soc = ctx.initial_soc;

    for idx in 0..n {
        let mode = score_mode(ctx, idx, soc);
        let projection = simulate_interval(ctx, idx, mode, soc);
        soc = projection.soc_after;
        intervals.push(projection);
    }
    intervals
}

fn score_mode(ctx: &SimulationContext, idx: usize, soc: Energy) -> ModeKind {
    let point = &ctx.forecast[idx];
    let (buy, _) = ctx.tariff.apply(point.spot_price);
    let buffer = Energy::kwh(SOC_BUFFER_KWH);

    if point.pv.as_kwh() > point.load.as_kwh() {
        ModeKind::HomeIii
    } else if soc.as_kwh() > (ctx.user_min_soc + buffer).as_kwh()
        && buy.as_czk_per_kwh() >= ctx.cheap_threshold.as_czk_per_kwh()
        && point.load.as_kwh() > point.pv.as_kwh()
    {
        ModeKind::HomeIi
    } else if buy.as_czk_per_kwh() < ctx.cheap_threshold.as_czk_per_kwh() && soc.as_kwh() < ctx.capacity.as_kwh() {
        ModeKind::HomeUps
    } else {
        ModeKind::HomeI
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::forecast::{ForecastPoint, TariffParameters};
    use crate::domain::plan::{PlanKind, TargetSocPolicy};
    use crate::domain::types::{Power, Price, Timestamp};

    fn ctx(forecast: Vec<ForecastPoint>) -> SimulationContext {
        SimulationContext {
            capacity: Energy::kwh(15.36),
            initial_soc: Energy::kwh(5.0),
            user_min_soc: Energy::kwh(3.0),
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
    fn prefers_solar_priority_when_pv_surplus() {
        let context = ctx(vec![point(2.0, 0.5, 2.0)]);
        let intervals = run(&context);
        assert_eq!(intervals[0].mode, ModeKind::HomeIii);
    }

    #[test]
    fn prefers_ups_when_cheap_and_below_capacity() {
        let context = ctx(vec![point(0.0, 1.0, 0.5)]);
        let intervals = run(&context);
        assert_eq!(intervals[0].mode, ModeKind::HomeUps);
    }

    #[test]
    fn produces_full_length_trajectory() {
        let context = ctx((0..10).map(|_| point(0.2, 0.3, 2.0)).collect());
        let intervals = run(&context);
        assert_eq!(intervals.len(), 10);
    }
}
