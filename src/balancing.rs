//! Balancing Detector (C7): opportunistic/economic/forced triggers with
//! iterative median validation, evaluated every 30 minutes (§4.7).
//!
//! Grounded in the teacher's `controller::scheduler::TaskScheduler`
//! (`src/controller/scheduler.rs`) for the periodic-evaluation shape, and
//! `controller::mod.rs`'s `state_history: VecDeque<...>` ring buffer for
//! the 48h price window this module scans in-memory rather than querying
//! a database.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BalancingConfig, BatteryConfig, TariffConfig};
use crate::domain::forecast::ForecastPoint;
use crate::domain::plan::{PlanKind, SimulationContext, TargetSocPolicy};
use crate::domain::telemetry::{ModeKind, TelemetrySnapshot};
use crate::domain::types::{Energy, Power, Price, Timestamp};
use crate::errors::CoreError;
use crate::optimizer::optimize;
use crate::shield::ServiceShield;
use crate::simulation::simulate_interval;
use crate::store::PlanStore;

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Forced,
    Opportunistic,
    Economic,
}

/// Runs the three balancing triggers in forced > opportunistic > economic
/// precedence order every `check_interval_min` (§4.7). Balancing never
/// supersedes an active weather-emergency plan and defers while the
/// Service Shield reports a quarantined external override.
pub struct BalancingDetector {
    store: Arc<dyn PlanStore>,
    shield: Arc<ServiceShield>,
    box_id: String,
    battery: BatteryConfig,
    tariff: TariffConfig,
    balancing: BalancingConfig,
    last_balancing_ts: RwLock<Option<Timestamp>>,
}

impl BalancingDetector {
    pub fn new(
        store: Arc<dyn PlanStore>,
        shield: Arc<ServiceShield>,
        box_id: String,
        battery: BatteryConfig,
        tariff: TariffConfig,
        balancing: BalancingConfig,
    ) -> Self {
        Self { store, shield, box_id, battery, tariff, balancing, last_balancing_ts: RwLock::new(None) }
    }

    /// Evaluates all three triggers and activates the first one that both
    /// fires and isn't deferred. `forecast` must cover at least 48h from
    /// `now`. Returns the id of the plan activated, if any.
    pub async fn evaluate(
        &self,
        telemetry: &TelemetrySnapshot,
        forecast: &[ForecastPoint],
        now: Timestamp,
        weather_plan_active: bool,
    ) -> Result<Option<Uuid>, CoreError> {
        if weather_plan_active {
            info!("balancing deferred: weather plan active");
            return Ok(None);
        }
        if !self.shield.is_writable(now).await {
            info!("balancing deferred: service shield suspended");
            return Ok(None);
        }

        if let Some(plan_id) = self.try_forced(telemetry, forecast, now).await? {
            return Ok(Some(plan_id));
        }
        if let Some(plan_id) = self.try_opportunistic(telemetry, forecast, now).await? {
            return Ok(Some(plan_id));
        }
        if let Some(plan_id) = self.try_economic(telemetry, forecast, now).await? {
            return Ok(Some(plan_id));
        }
        Ok(None)
    }

    async fn try_forced(
        &self,
        telemetry: &TelemetrySnapshot,
        forecast: &[ForecastPoint],
        now: Timestamp,
    ) -> Result<Option<Uuid>, CoreError> {
        let last = *self.last_balancing_ts.read().await;
        let due = last
            .map(|ts| now.duration_since(&ts).num_days() >= self.balancing.forced_interval_days as i64)
            .unwrap_or(true);
        if !due {
            return Ok(None);
        }

        let window_intervals = (self.balancing.balancing_window_hours as usize) * 4;
        let Some(window) = cheapest_window(forecast, window_intervals, None) else {
            return Ok(None);
        };

        info!(window_start = %window.start.ts, "forced balancing trigger fired");
        let plan_id = self
            .synthesize_and_activate(telemetry, forecast, now, window.start.ts, ModeKind::HomeUps)
            .await?;
        *self.last_balancing_ts.write().await = Some(now);
        Ok(Some(plan_id))
    }

    async fn try_opportunistic(
        &self,
        telemetry: &TelemetrySnapshot,
        forecast: &[ForecastPoint],
        now: Timestamp,
    ) -> Result<Option<Uuid>, CoreError> {
        if telemetry.soc_pct() < self.balancing.opportunistic_threshold_soc_pct {
            return Ok(None);
        }

        let charge_mode = if forecast.iter().take(8).any(|p| p.pv.as_kwh() > 0.0) {
            ModeKind::HomeIii
        } else {
            ModeKind::HomeUps
        };

        let Some(full_at) = self.time_to_full(telemetry, forecast, charge_mode) else {
            warn!("opportunistic trigger: forecast horizon too short to reach full SoC");
            return Ok(None);
        };

        info!(%full_at, ?charge_mode, "opportunistic balancing trigger fired");
        let plan_id = self
            .synthesize_and_activate(telemetry, forecast, now, full_at, charge_mode)
            .await?;
        *self.last_balancing_ts.write().await = Some(now);
        Ok(Some(plan_id))
    }

    async fn try_economic(
        &self,
        telemetry: &TelemetrySnapshot,
        forecast: &[ForecastPoint],
        now: Timestamp,
    ) -> Result<Option<Uuid>, CoreError> {
        let median = median_price(forecast);
        let window_intervals = (self.balancing.balancing_window_hours as usize) * 4;
        let Some(window) = cheapest_window(forecast, window_intervals, Some(median)) else {
            return Ok(None);
        };

        info!(window_start = %window.start.ts, median_czk = median.as_czk_per_kwh(), "economic balancing trigger fired");
        let plan_id = self
            .synthesize_and_activate(telemetry, forecast, now, window.start.ts, ModeKind::HomeUps)
            .await?;
        *self.last_balancing_ts.write().await = Some(now);
        Ok(Some(plan_id))
    }

    /// Simulates `charge_mode` from the current SoC forward through
    /// `forecast` until capacity is reached, returning the timestamp of the
    /// first interval at/above capacity (§4.7's "estimated time to charge").
    fn time_to_full(&self, telemetry: &TelemetrySnapshot, forecast: &[ForecastPoint], charge_mode: ModeKind) -> Option<Timestamp> {
        let ctx = self.base_context(telemetry, forecast.to_vec(), TargetSocPolicy::Soft, None, None, None);
        let mut soc = telemetry.soc;
        for (idx, point) in forecast.iter().enumerate() {
            let projection = simulate_interval(&ctx, idx, charge_mode, soc);
            soc = projection.soc_after;
            if soc.as_kwh() >= ctx.capacity.as_kwh() - ctx.soc_tolerance.as_kwh() {
                return Some(point.ts.add_minutes(15));
            }
        }
        None
    }

    async fn synthesize_and_activate(
        &self,
        telemetry: &TelemetrySnapshot,
        forecast: &[ForecastPoint],
        now: Timestamp,
        holding_start: Timestamp,
        holding_mode: ModeKind,
    ) -> Result<Uuid, CoreError> {
        let ctx = self.base_context(
            telemetry,
            forecast.to_vec(),
            TargetSocPolicy::Hard,
            Some(holding_start),
            Some(self.balancing.holding_hours_default),
            Some(holding_mode),
        );
        let plan = optimize(&ctx, now)?;
        let plan_id = self.store.create(&self.box_id, plan).await?;
        self.store.activate(&self.box_id, plan_id, now).await?;
        Ok(plan_id)
    }

    fn base_context(
        &self,
        telemetry: &TelemetrySnapshot,
        forecast: Vec<ForecastPoint>,
        target_policy: TargetSocPolicy,
        target_time: Option<Timestamp>,
        holding_hours: Option<f64>,
        holding_mode: Option<ModeKind>,
    ) -> SimulationContext {
        SimulationContext {
            capacity: telemetry.capacity,
            initial_soc: telemetry.soc,
            user_min_soc: Energy::kwh(telemetry.capacity.as_kwh() * self.battery.user_min_soc_pct / 100.0),
            soc_tolerance: Energy::kwh(0.5),
            forecast,
            tariff: self.tariff.to_tariff_parameters(),
            target_policy,
            target_time,
            holding_hours,
            holding_mode,
            cheap_threshold: Price::czk_per_kwh(self.tariff.threshold_cheap_czk),
            plan_kind: PlanKind::Balancing,
            home_charge_rate: Power::watts(self.battery.home_charge_rate_w),
            max_charge_power: Power::kilowatts(self.battery.max_charge_kw),
            max_discharge_power: Power::kilowatts(self.battery.max_discharge_kw),
            grid_export_limit: Power::kilowatts(self.battery.grid_export_limit_kw),
        }
    }
}

struct WindowCandidate<'a> {
    start: &'a ForecastPoint,
    mean_price: f64,
}

/// Returns the lowest-mean-price window of `window_intervals` consecutive
/// forecast points. If `median` is `Some`, a candidate is rejected unless
/// every one of its intervals has a price at or below the median (§4.7's
/// iterative median validation, P6).
fn cheapest_window(forecast: &[ForecastPoint], window_intervals: usize, median: Option<Price>) -> Option<WindowCandidate<'_>> {
    if forecast.len() < window_intervals || window_intervals == 0 {
        return None;
    }

    let mut best: Option<WindowCandidate> = None;
    for start in 0..=(forecast.len() - window_intervals) {
        let window = &forecast[start..start + window_intervals];
        if let Some(m) = median {
            if window.iter().any(|p| p.spot_price.as_czk_per_kwh() > m.as_czk_per_kwh()) {
                continue;
            }
        }
        let mean = window.iter().map(|p| p.spot_price.as_czk_per_kwh()).sum::<f64>() / window_intervals as f64;
        if best.as_ref().map(|b| mean < b.mean_price).unwrap_or(true) {
            best = Some(WindowCandidate { start: &forecast[start], mean_price: mean });
        }
    }
    best
}

/// The trailing 48h price median used by the economic trigger's iterative
/// validation (resolved Open Question: 48h trailing, not rolling — see
/// DESIGN.md).
fn median_price(forecast: &[ForecastPoint]) -> Price {
    let mut prices: Vec<f64> = forecast.iter().map(|p| p.spot_price.as_czk_per_kwh()).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if prices.is_empty() {
        return Price::czk_per_kwh(0.0);
    }
    let mid = prices.len() / 2;
    let value = if prices.len() % 2 == 0 { (prices[mid - 1] + prices[mid]) / 2.0 } else { prices[mid] };
    Price::czk_per_kwh(value)
}

impl TariffConfig {
    pub fn to_tariff_parameters(&self) -> crate::domain::forecast::TariffParameters {
        crate::domain::forecast::TariffParameters {
            vat_rate: self.vat_rate,
            distribution_surcharge_buy: Price::czk_per_kwh(self.distribution_surcharge_buy_czk),
            distribution_surcharge_sell: Price::czk_per_kwh(self.distribution_surcharge_sell_czk),
            sell_asymmetry: self.sell_asymmetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::BoilerState;
    use std::sync::Arc;
    use std::time::Duration;

    fn battery_config() -> BatteryConfig {
        BatteryConfig {
            box_id: "box-1".into(),
            capacity_kwh: 15.36,
            user_min_soc_pct: 33.0,
            home_charge_rate_w: 3000.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            grid_export_limit_kw: 10.0,
        }
    }

    fn tariff_config() -> TariffConfig {
        TariffConfig {
            vat_rate: 0.21,
            distribution_surcharge_buy_czk: 1.0,
            distribution_surcharge_sell_czk: 0.1,
            sell_asymmetry: 0.4,
            threshold_cheap_czk: 1.5,
        }
    }

    fn balancing_config() -> BalancingConfig {
        BalancingConfig {
            opportunistic_threshold_soc_pct: 90.0,
            holding_hours_default: 3.0,
            balancing_window_hours: 6,
            forced_interval_days: 30,
            check_interval_min: 30,
        }
    }

    fn telemetry(soc_kwh: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            capacity: Energy::kwh(15.36),
            soc: Energy::kwh(soc_kwh),
            current_mode: ModeKind::HomeI,
            boiler_state: BoilerState::Off,
            grid_export_limit: Power::kilowatts(10.0),
            last_update_ts: Timestamp::now(),
        }
    }

    fn point(ts: Timestamp, pv: f64, load: f64, price: f64) -> ForecastPoint {
        ForecastPoint { ts, pv: Energy::kwh(pv), load: Energy::kwh(load), spot_price: Price::czk_per_kwh(price) }
    }

    fn flat_forecast(now: Timestamp, hours: i64, price: f64) -> Vec<ForecastPoint> {
        (0..hours * 4).map(|i| point(now.add_minutes(15 * i), 0.0, 0.2, price)).collect()
    }

    struct InMemoryStore {
        plans: tokio::sync::Mutex<std::collections::HashMap<Uuid, crate::domain::plan::Plan>>,
    }

    #[async_trait::async_trait]
    impl PlanStore for InMemoryStore {
        async fn create(&self, _box_id: &str, plan: crate::domain::plan::Plan) -> Result<Uuid, CoreError> {
            let id = plan.plan_id;
            self.plans.lock().await.insert(id, plan);
            Ok(id)
        }
        async fn activate(&self, _box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError> {
            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(&plan_id).unwrap();
            plan.transition(crate::domain::plan::PlanStatus::Active, now)?;
            Ok(())
        }
        async fn deactivate(&self, _box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError> {
            let mut plans = self.plans.lock().await;
            let plan = plans.get_mut(&plan_id).unwrap();
            plan.transition(crate::domain::plan::PlanStatus::Deactivated, now)?;
            Ok(())
        }
        async fn get_active(&self, _box_id: &str) -> Result<Option<crate::domain::plan::Plan>, CoreError> {
            let plans = self.plans.lock().await;
            Ok(plans.values().find(|p| p.status == crate::domain::plan::PlanStatus::Active).cloned())
        }
        async fn list(&self, _box_id: &str, _filter: crate::store::PlanFilter) -> Result<Vec<crate::domain::plan::Plan>, CoreError> {
            Ok(self.plans.lock().await.values().cloned().collect())
        }
    }

    fn detector() -> BalancingDetector {
        let store = Arc::new(InMemoryStore { plans: tokio::sync::Mutex::new(Default::default()) });
        let shield = Arc::new(ServiceShield::new(Duration::from_secs(900)));
        BalancingDetector::new(store, shield, "box-1".into(), battery_config(), tariff_config(), balancing_config())
    }

    #[test]
    fn median_price_of_even_length_series_averages_middle_two() {
        let now = Timestamp::now();
        let forecast = vec![point(now, 0.0, 0.0, 1.0), point(now, 0.0, 0.0, 3.0)];
        assert_eq!(median_price(&forecast).as_czk_per_kwh(), 2.0);
    }

    #[test]
    fn economic_window_rejects_candidate_with_interval_above_median() {
        let now = Timestamp::now();
        let mut forecast = flat_forecast(now, 48, 2.8);
        // Inject a spike at 07:00 within an otherwise cheap 02:00-08:00 window.
        for p in forecast.iter_mut().take(24).skip(20) {
            p.spot_price = Price::czk_per_kwh(1.1);
        }
        forecast[27].spot_price = Price::czk_per_kwh(3.0);
        let median = median_price(&forecast);
        let window = cheapest_window(&forecast[20..44], 24, Some(median));
        assert!(window.is_none() || window.unwrap().mean_price < 1.5);
    }

    #[tokio::test]
    async fn opportunistic_trigger_fires_above_threshold_soc() {
        let now = Timestamp::now();
        let telem = telemetry(15.0); // 97.7% of 15.36 kWh
        let forecast = flat_forecast(now, 48, 2.0);
        let detector = detector();
        let result = detector.evaluate(&telem, &forecast, now, false).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn balancing_defers_while_weather_plan_active() {
        let now = Timestamp::now();
        let telem = telemetry(15.0);
        let forecast = flat_forecast(now, 48, 2.0);
        let detector = detector();
        let result = detector.evaluate(&telem, &forecast, now, true).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn balancing_defers_while_shield_suspended() {
        let now = Timestamp::now();
        let telem = telemetry(15.0);
        let forecast = flat_forecast(now, 48, 2.0);
        let store = Arc::new(InMemoryStore { plans: tokio::sync::Mutex::new(Default::default()) });
        let shield = Arc::new(ServiceShield::new(Duration::from_secs(900)));
        shield.observe_unexpected_mode(ModeKind::HomeIi, now, None).await;
        let detector = BalancingDetector::new(store, shield, "box-1".into(), battery_config(), tariff_config(), balancing_config());
        let result = detector.evaluate(&telem, &forecast, now, false).await.unwrap();
        assert!(result.is_none());
    }
}
