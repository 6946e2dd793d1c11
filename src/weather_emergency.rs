//! Weather Emergency Planner (C8): synthesizes a hard-target weather plan
//! on severe/extreme alerts and keeps it refreshed as the warning horizon
//! shrinks (§4.8). The SoC-maintenance override during holding lives in
//! `executor` (§4.8's own text names it part of "the executor contract").
//!
//! Grounded in `provider::weather`'s polling shape and `balancing`'s
//! sibling trigger-evaluation pattern (both are periodic detectors reacting
//! to an external signal and activating a plan via the same `PlanStore`).

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::{BatteryConfig, TariffConfig};
use crate::domain::forecast::ForecastPoint;
use crate::domain::plan::{PlanKind, SimulationContext, TargetSocPolicy};
use crate::domain::telemetry::{ModeKind, TelemetrySnapshot};
use crate::domain::types::{Energy, Power, Price, Timestamp};
use crate::domain::weather::WeatherWarning;
use crate::errors::CoreError;
use crate::optimizer::optimize;
use crate::store::PlanStore;

use tokio::sync::RwLock;

struct ActiveWeatherPlan {
    plan_id: Uuid,
    expected_end_ts: Timestamp,
}

/// Tracks the currently active weather plan (if any) so the hourly refresh
/// can detect a change in `expected_end_ts` and re-synthesize (§4.8).
pub struct WeatherEmergencyPlanner {
    store: Arc<dyn PlanStore>,
    box_id: String,
    battery: BatteryConfig,
    tariff: TariffConfig,
    active: RwLock<Option<ActiveWeatherPlan>>,
}

impl WeatherEmergencyPlanner {
    pub fn new(store: Arc<dyn PlanStore>, box_id: String, battery: BatteryConfig, tariff: TariffConfig) -> Self {
        Self { store, box_id, battery, tariff, active: RwLock::new(None) }
    }

    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Reacts to a fresh `WeatherWarning` (§4.8). On `severe`/`extreme`,
    /// synthesizes (or refreshes, if `expected_end_ts` changed) the weather
    /// plan. When severity drops below `severe`, deactivates it and lets
    /// the automatic plan resume on the next scheduler tick.
    pub async fn on_warning(
        &self,
        warning: &WeatherWarning,
        telemetry: &TelemetrySnapshot,
        forecast: &[ForecastPoint],
        now: Timestamp,
    ) -> Result<(), CoreError> {
        if !warning.severity.is_emergency() {
            self.deactivate_if_active(now).await?;
            return Ok(());
        }

        let needs_refresh = {
            let active = self.active.read().await;
            match active.as_ref() {
                Some(a) => a.expected_end_ts != warning.expected_end_ts,
                None => true,
            }
        };
        if !needs_refresh {
            return Ok(());
        }

        let remaining_hours = warning.expected_end_ts.duration_since(&now).num_minutes() as f64 / 60.0;
        if remaining_hours <= 0.0 {
            self.deactivate_if_active(now).await?;
            return Ok(());
        }

        info!(remaining_hours, "synthesizing weather emergency plan");
        let ctx = self.context(telemetry, forecast.to_vec(), now, remaining_hours);
        let plan = optimize(&ctx, now)?;
        let plan_id = self.store.create(&self.box_id, plan).await?;
        self.store.activate(&self.box_id, plan_id, now).await?;

        *self.active.write().await = Some(ActiveWeatherPlan { plan_id, expected_end_ts: warning.expected_end_ts });
        Ok(())
    }

    async fn deactivate_if_active(&self, now: Timestamp) -> Result<(), CoreError> {
        let plan_id = {
            let mut active = self.active.write().await;
            active.take().map(|a| a.plan_id)
        };
        if let Some(plan_id) = plan_id {
            info!(%plan_id, "weather severity dropped below severe, deactivating weather plan");
            self.store.deactivate(&self.box_id, plan_id, now).await?;
        }
        Ok(())
    }

    fn context(&self, telemetry: &TelemetrySnapshot, forecast: Vec<ForecastPoint>, now: Timestamp, remaining_hours: f64) -> SimulationContext {
        // Holding mode for the interval is resolved by the executor's
        // SoC-maintenance override (§4.8): HOME_UPS while SoC < 100%, else
        // HOME_III. The optimizer is seeded with HOME_UPS so the DP target a
        // full charge; the executor enforces the runtime switch at read time.
        SimulationContext {
            capacity: telemetry.capacity,
            initial_soc: telemetry.soc,
            user_min_soc: Energy::kwh(telemetry.capacity.as_kwh() * self.battery.user_min_soc_pct / 100.0),
            soc_tolerance: Energy::kwh(0.5),
            forecast,
            tariff: self.tariff.to_tariff_parameters(),
            target_policy: TargetSocPolicy::Hard,
            target_time: Some(now),
            holding_hours: Some(remaining_hours),
            holding_mode: Some(ModeKind::HomeUps),
            cheap_threshold: Price::czk_per_kwh(self.tariff.threshold_cheap_czk),
            plan_kind: PlanKind::Weather,
            home_charge_rate: Power::watts(self.battery.home_charge_rate_w),
            max_charge_power: Power::kilowatts(self.battery.max_charge_kw),
            max_discharge_power: Power::kilowatts(self.battery.max_discharge_kw),
            grid_export_limit: Power::kilowatts(self.battery.grid_export_limit_kw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::BoilerState;
    use crate::domain::weather::Severity;
    use std::collections::HashMap;

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

    fn flat_forecast(now: Timestamp, hours: i64) -> Vec<ForecastPoint> {
        (0..hours * 4)
            .map(|i| ForecastPoint {
                ts: now.add_minutes(15 * i),
                pv: Energy::kwh(0.0),
                load: Energy::kwh(0.2),
                spot_price: Price::czk_per_kwh(2.0),
            })
            .collect()
    }

    struct InMemoryStore {
        plans: tokio::sync::Mutex<HashMap<Uuid, crate::domain::plan::Plan>>,
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
            plans.get_mut(&plan_id).unwrap().transition(crate::domain::plan::PlanStatus::Active, now)?;
            Ok(())
        }
        async fn deactivate(&self, _box_id: &str, plan_id: Uuid, now: Timestamp) -> Result<(), CoreError> {
            let mut plans = self.plans.lock().await;
            plans.get_mut(&plan_id).unwrap().transition(crate::domain::plan::PlanStatus::Deactivated, now)?;
            Ok(())
        }
        async fn get_active(&self, _box_id: &str) -> Result<Option<crate::domain::plan::Plan>, CoreError> {
            Ok(self.plans.lock().await.values().find(|p| p.status == crate::domain::plan::PlanStatus::Active).cloned())
        }
        async fn list(&self, _box_id: &str, _filter: crate::store::PlanFilter) -> Result<Vec<crate::domain::plan::Plan>, CoreError> {
            Ok(self.plans.lock().await.values().cloned().collect())
        }
    }

    fn planner() -> WeatherEmergencyPlanner {
        let store = Arc::new(InMemoryStore { plans: tokio::sync::Mutex::new(HashMap::new()) });
        WeatherEmergencyPlanner::new(store, "box-1".into(), battery_config(), tariff_config())
    }

    #[tokio::test]
    async fn severe_warning_activates_a_weather_plan() {
        let now = Timestamp::now();
        let planner = planner();
        let warning = WeatherWarning { severity: Severity::Severe, start_ts: now, expected_end_ts: now.add_minutes(9 * 60) };
        planner.on_warning(&warning, &telemetry(8.0), &flat_forecast(now, 48), now).await.unwrap();
        assert!(planner.is_active().await);
    }

    #[tokio::test]
    async fn minor_warning_does_not_activate() {
        let now = Timestamp::now();
        let planner = planner();
        let warning = WeatherWarning { severity: Severity::Minor, start_ts: now, expected_end_ts: now.add_minutes(60) };
        planner.on_warning(&warning, &telemetry(8.0), &flat_forecast(now, 48), now).await.unwrap();
        assert!(!planner.is_active().await);
    }

    #[tokio::test]
    async fn severity_drop_deactivates_the_weather_plan() {
        let now = Timestamp::now();
        let planner = planner();
        let severe = WeatherWarning { severity: Severity::Severe, start_ts: now, expected_end_ts: now.add_minutes(9 * 60) };
        planner.on_warning(&severe, &telemetry(8.0), &flat_forecast(now, 48), now).await.unwrap();
        assert!(planner.is_active().await);

        let calm = WeatherWarning { severity: Severity::None, start_ts: now, expected_end_ts: now };
        planner.on_warning(&calm, &telemetry(8.0), &flat_forecast(now, 48), now.add_minutes(30)).await.unwrap();
        assert!(!planner.is_active().await);
    }

    #[tokio::test]
    async fn changed_expected_end_triggers_resynthesis() {
        let now = Timestamp::now();
        let planner = planner();
        let first = WeatherWarning { severity: Severity::Severe, start_ts: now, expected_end_ts: now.add_minutes(9 * 60) };
        planner.on_warning(&first, &telemetry(8.0), &flat_forecast(now, 48), now).await.unwrap();
        let first_plan_id = planner.active.read().await.as_ref().unwrap().plan_id;

        let second = WeatherWarning { severity: Severity::Severe, start_ts: now, expected_end_ts: now.add_minutes(14 * 60) };
        planner
            .on_warning(&second, &telemetry(8.0), &flat_forecast(now, 48), now.add_minutes(60))
            .await
            .unwrap();
        let second_plan_id = planner.active.read().await.as_ref().unwrap().plan_id;
        assert_ne!(first_plan_id, second_plan_id);
    }
}
