//! Root task supervisor (§5): one `tokio::spawn` per periodic
//! responsibility, sharing a `tokio_util::sync::CancellationToken` root
//! signal and graceful shutdown.
//!
//! Grounded in the teacher's `controller::spawn_controller_tasks`: a
//! `JoinSet` of cooperatively-cancelled loops plus a bounded drain on
//! shutdown, generalized from the teacher's single controller loop to one
//! task per C1/C2/C3/C5/C7/C8/C9 responsibility.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancing::BalancingDetector;
use crate::config::{BatteryConfig, PollingConfig, TariffConfig};
use crate::domain::forecast::ForecastPoint;
use crate::domain::plan::{PlanKind, SimulationContext, TargetSocPolicy};
use crate::domain::telemetry::TelemetrySnapshot;
use crate::domain::types::{Energy, Power, Price, Timestamp};
use crate::executor::PlanExecutor;
use crate::optimizer::optimize;
use crate::provider::forecast::PvLoadForecastProvider;
use crate::provider::price::SpotPriceProvider;
use crate::provider::telemetry::TelemetryClient;
use crate::provider::weather::WeatherWatcher;
use crate::shield::ServiceShield;
use crate::store::PlanStore;
use crate::weather_emergency::WeatherEmergencyPlanner;

/// The 48h horizon built by the forecast refresh task and consumed by the
/// optimizer refresh and balancing check tasks (§4.2, §4.5, §4.7).
const FORECAST_HORIZON_HOURS: u32 = 48;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything spawned tasks need, gathered so `spawn_core_tasks` doesn't
/// take a dozen positional arguments.
pub struct SchedulerDeps {
    pub telemetry: Arc<TelemetryClient>,
    pub price: Arc<SpotPriceProvider>,
    pub forecast: Arc<PvLoadForecastProvider>,
    pub weather: Arc<WeatherWatcher>,
    pub shield: Arc<ServiceShield>,
    pub store: Arc<dyn PlanStore>,
    pub balancing: Arc<BalancingDetector>,
    pub weather_planner: Arc<WeatherEmergencyPlanner>,
    pub executor: Arc<PlanExecutor>,
    pub box_id: String,
    pub battery: BatteryConfig,
    pub tariff: TariffConfig,
    pub polling: PollingConfig,
    pub weather_refresh_min: u64,
    pub balancing_check_interval_min: u64,
    pub shared: Arc<SharedState>,
}

/// Shared, most-recently-observed inputs, refreshed by the polling tasks
/// and read by the optimizer/balancing/executor tasks without each of them
/// re-hitting the network (§5 suspension-point discipline). Also read
/// directly by the outward API's status endpoint, so the host integration
/// sees the same data the scheduler itself acts on.
#[derive(Default)]
pub struct SharedState {
    telemetry: RwLock<Option<TelemetrySnapshot>>,
    forecast: RwLock<Option<Vec<ForecastPoint>>>,
}

impl SharedState {
    pub async fn telemetry(&self) -> Option<TelemetrySnapshot> {
        self.telemetry.read().await.clone()
    }

    pub async fn forecast(&self) -> Option<Vec<ForecastPoint>> {
        self.forecast.read().await.clone()
    }
}

/// Handle to the running task set; `shutdown` cancels the root token and
/// drains the `JoinSet` with a bounded timeout.
pub struct CoreTasks {
    tasks: JoinSet<()>,
    token: CancellationToken,
}

impl CoreTasks {
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let drain = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "core task panicked during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("core tasks did not exit within the shutdown grace period");
        }
    }
}

/// Spawns one task per periodic responsibility named in §5 and returns a
/// handle that cancels and drains them all on `shutdown()`.
pub fn spawn_core_tasks(deps: SchedulerDeps) -> CoreTasks {
    let token = CancellationToken::new();
    let shared = deps.shared.clone();
    let mut tasks = JoinSet::new();

    tasks.spawn(standard_poll_task(deps.telemetry.clone(), shared.clone(), deps.polling.standard_poll_s, token.clone()));
    tasks.spawn(extended_poll_task(deps.telemetry.clone(), deps.polling.extended_poll_s, token.clone()));
    tasks.spawn(forecast_refresh_task(deps.price.clone(), deps.forecast.clone(), shared.clone(), deps.polling.optimizer_refresh_min, token.clone()));
    tasks.spawn(weather_poll_task(
        deps.weather.clone(),
        deps.weather_planner.clone(),
        shared.clone(),
        deps.weather_refresh_min,
        token.clone(),
    ));
    tasks.spawn(optimizer_refresh_task(
        deps.store.clone(),
        deps.weather_planner.clone(),
        shared.clone(),
        deps.box_id.clone(),
        deps.battery.clone(),
        deps.tariff.clone(),
        deps.polling.optimizer_refresh_min,
        token.clone(),
    ));
    tasks.spawn(balancing_check_task(
        deps.balancing.clone(),
        deps.weather_planner.clone(),
        shared.clone(),
        deps.balancing_check_interval_min,
        token.clone(),
    ));
    tasks.spawn(executor_tick_task(
        deps.executor.clone(),
        deps.store.clone(),
        deps.telemetry.clone(),
        deps.box_id.clone(),
        deps.polling.executor_tick_s,
        token.clone(),
    ));

    CoreTasks { tasks, token }
}

/// Caps the exponential backoff applied after consecutive poll failures
/// (§4.1 "On failure, exponential backoff with cap"). Chosen as a ceiling
/// well above either endpoint's normal cadence so a persistently failing
/// source doesn't hammer the vendor cloud while `SourceHealth` is degraded.
const POLL_BACKOFF_CAP_SECS: u64 = 900;

/// Doubles `period_s` per consecutive failure (1-indexed), capped at
/// `POLL_BACKOFF_CAP_SECS`. `failures == 0` (healthy) isn't called through
/// this path -- callers fall back to the normal jittered period instead.
fn backoff_for(period_s: u64, failures: u32) -> Duration {
    let factor = 1u64 << failures.min(16);
    Duration::from_secs(period_s.saturating_mul(factor).min(POLL_BACKOFF_CAP_SECS))
}

/// `standard_poll_s` ± up to 5s jitter on success, keeping the period
/// bounded 25-35s at the default (§8 scenario 6). On failure, sleeps an
/// exponentially growing, capped backoff instead of the normal jitter
/// (§4.1); `TelemetryClient` itself tracks consecutive failures for the
/// `degraded` health signal, so this loop just needs its own counter to
/// size the backoff.
async fn standard_poll_task(telemetry: Arc<TelemetryClient>, shared: Arc<SharedState>, period_s: u64, token: CancellationToken) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let now = Timestamp::now();
        let sleep_for = match telemetry.get_stats(now).await {
            Ok(snapshot) => {
                *shared.telemetry.write().await = Some(snapshot);
                consecutive_failures = 0;
                let jitter_s = rand::thread_rng().gen_range(-5i64..=5);
                Duration::from_secs((period_s as i64 + jitter_s).max(1) as u64)
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "standard telemetry poll failed, backing off");
                backoff_for(period_s, consecutive_failures)
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = token.cancelled() => { info!("standard poll task shutting down"); return; }
        }
    }
}

async fn extended_poll_task(telemetry: Arc<TelemetryClient>, period_s: u64, token: CancellationToken) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let now = Timestamp::now();
        let sleep_for = match telemetry.get_extended_stats(now).await {
            Ok(_) => {
                consecutive_failures = 0;
                Duration::from_secs(period_s)
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "extended telemetry poll failed, backing off");
                backoff_for(period_s, consecutive_failures)
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = token.cancelled() => { info!("extended poll task shutting down"); return; }
        }
    }
}

/// Rebuilds the 48h PV/load/price horizon (C2) on the optimizer's refresh
/// cadence, since the optimizer is the only consumer that needs the full
/// horizon refreshed (balancing reuses the same cached horizon).
async fn forecast_refresh_task(
    price: Arc<SpotPriceProvider>,
    forecast: Arc<PvLoadForecastProvider>,
    shared: Arc<SharedState>,
    period_min: u64,
    token: CancellationToken,
) {
    loop {
        let now = Timestamp::now();
        match forecast.build_horizon(now, FORECAST_HORIZON_HOURS, &price).await {
            Ok(points) => *shared.forecast.write().await = Some(points),
            Err(e) => warn!(error = %e, "forecast horizon refresh failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(period_min * 60)) => {}
            _ = token.cancelled() => { info!("forecast refresh task shutting down"); return; }
        }
    }
}

/// Polls the weather alert source (C3) on `weather_refresh_min` (default
/// 60, §4.3/§6) and feeds the result straight into the weather emergency
/// planner's dynamic refresh (C8), since a stale warning would otherwise
/// hold a weather plan open past its actual end.
async fn weather_poll_task(
    weather: Arc<WeatherWatcher>,
    weather_planner: Arc<WeatherEmergencyPlanner>,
    shared: Arc<SharedState>,
    period_min: u64,
    token: CancellationToken,
) {
    loop {
        let now = Timestamp::now();
        if let Err(e) = weather.poll(now).await {
            warn!(error = %e, "weather poll failed");
        }

        let telemetry = shared.telemetry.read().await.clone();
        let forecast = shared.forecast.read().await.clone();
        if let (Some(telemetry), Some(forecast)) = (telemetry, forecast) {
            let warning = weather.current_warning().await;
            if let Err(e) = weather_planner.on_warning(&warning, &telemetry, &forecast, now).await {
                warn!(error = %e, "weather emergency planner refresh failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(period_min * 60)) => {}
            _ = token.cancelled() => { info!("weather poll task shutting down"); return; }
        }
    }
}

/// Produces the baseline automatic plan (C5) on its refresh cadence.
/// Per §9's "C7/C8 may create and activate a Plan via C6 overriding any
/// automatic plan", this task only installs a fresh automatic plan when no
/// plan is active or the active plan is itself `Automatic` -- it never
/// preempts a balancing or weather plan in flight.
#[allow(clippy::too_many_arguments)]
async fn optimizer_refresh_task(
    store: Arc<dyn PlanStore>,
    weather_planner: Arc<WeatherEmergencyPlanner>,
    shared: Arc<SharedState>,
    box_id: String,
    battery: BatteryConfig,
    tariff: TariffConfig,
    period_min: u64,
    token: CancellationToken,
) {
    loop {
        let now = Timestamp::now();
        if !weather_planner.is_active().await {
            if let Err(e) = refresh_automatic_plan(&store, &shared, &box_id, &battery, &tariff, now).await {
                warn!(error = %e, "optimizer refresh failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(period_min * 60)) => {}
            _ = token.cancelled() => { info!("optimizer refresh task shutting down"); return; }
        }
    }
}

async fn refresh_automatic_plan(
    store: &Arc<dyn PlanStore>,
    shared: &SharedState,
    box_id: &str,
    battery: &BatteryConfig,
    tariff: &TariffConfig,
    now: Timestamp,
) -> Result<(), crate::errors::CoreError> {
    let telemetry = shared.telemetry.read().await.clone();
    let forecast = shared.forecast.read().await.clone();
    let (Some(telemetry), Some(forecast)) = (telemetry, forecast) else {
        return Ok(());
    };

    let active = store.get_active(box_id).await?;
    let may_replace = active.as_ref().map(|p| p.kind == PlanKind::Automatic).unwrap_or(true);
    if !may_replace {
        return Ok(());
    }

    let ctx = SimulationContext {
        capacity: telemetry.capacity,
        initial_soc: telemetry.soc,
        user_min_soc: Energy::kwh(telemetry.capacity.as_kwh() * battery.user_min_soc_pct / 100.0),
        soc_tolerance: Energy::kwh(0.5),
        forecast,
        tariff: tariff.to_tariff_parameters(),
        target_policy: TargetSocPolicy::Soft,
        target_time: None,
        holding_hours: None,
        holding_mode: None,
        cheap_threshold: Price::czk_per_kwh(tariff.threshold_cheap_czk),
        plan_kind: PlanKind::Automatic,
        home_charge_rate: Power::watts(battery.home_charge_rate_w),
        max_charge_power: Power::kilowatts(battery.max_charge_kw),
        max_discharge_power: Power::kilowatts(battery.max_discharge_kw),
        grid_export_limit: Power::kilowatts(battery.grid_export_limit_kw),
    };

    let plan = optimize(&ctx, now)?;
    let plan_id = store.create(box_id, plan).await?;
    store.activate(box_id, plan_id, now).await?;
    info!(%plan_id, "activated refreshed automatic plan");
    Ok(())
}

async fn balancing_check_task(
    balancing: Arc<BalancingDetector>,
    weather_planner: Arc<WeatherEmergencyPlanner>,
    shared: Arc<SharedState>,
    check_interval_min: u64,
    token: CancellationToken,
) {
    loop {
        let now = Timestamp::now();
        let telemetry = shared.telemetry.read().await.clone();
        let forecast = shared.forecast.read().await.clone();
        if let (Some(telemetry), Some(forecast)) = (telemetry, forecast) {
            let weather_active = weather_planner.is_active().await;
            match balancing.evaluate(&telemetry, &forecast, now, weather_active).await {
                Ok(Some(plan_id)) => info!(%plan_id, "balancing trigger activated a plan"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "balancing check failed"),
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(check_interval_min * 60)) => {}
            _ = token.cancelled() => { info!("balancing check task shutting down"); return; }
        }
    }
}

async fn executor_tick_task(
    executor: Arc<PlanExecutor>,
    store: Arc<dyn PlanStore>,
    telemetry_client: Arc<TelemetryClient>,
    box_id: String,
    period_s: u64,
    token: CancellationToken,
) {
    loop {
        let now = Timestamp::now();
        match telemetry_client.get_stats(now).await {
            Ok(snapshot) => match store.get_active(&box_id).await {
                Ok(plan) => {
                    if let Err(e) = executor.tick(plan.as_ref(), &snapshot, now).await {
                        warn!(error = %e, "executor tick failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to read active plan for executor tick"),
            },
            Err(e) => warn!(error = %e, "executor tick could not obtain a fresh telemetry snapshot"),
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(period_s)) => {}
            _ = token.cancelled() => { info!("executor tick task shutting down"); return; }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure_up_to_the_cap() {
        assert_eq!(backoff_for(30, 1), Duration::from_secs(60));
        assert_eq!(backoff_for(30, 2), Duration::from_secs(120));
        assert_eq!(backoff_for(30, 5), Duration::from_secs(900));
    }

    #[test]
    fn backoff_never_exceeds_the_cap_regardless_of_failure_count() {
        assert_eq!(backoff_for(300, 20), Duration::from_secs(POLL_BACKOFF_CAP_SECS));
    }
}

