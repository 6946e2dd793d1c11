//! Wires the ambient config into the C1-C10 components and holds the
//! `Arc`s both the scheduler and the outward API share (§5, §6).
//!
//! Grounded in the teacher's `controller::AppState`: a single struct built
//! once at startup, cloned cheaply into the router and into the spawned
//! task set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::balancing::BalancingDetector;
use crate::config::Config;
use crate::executor::PlanExecutor;
use crate::provider::forecast::PvLoadForecastProvider;
use crate::provider::price::SpotPriceProvider;
use crate::provider::telemetry::{Credentials, TelemetryClient};
use crate::provider::weather::WeatherWatcher;
use crate::scheduler::{SchedulerDeps, SharedState};
use crate::shield::ServiceShield;
use crate::store::{FilePlanStore, PlanStore};
use crate::domain::types::Timestamp;

/// Everything a request handler or a spawned task needs. Cheap to clone:
/// every field is an `Arc` or a small owned value from config.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub telemetry: Arc<TelemetryClient>,
    pub price: Arc<SpotPriceProvider>,
    pub forecast: Arc<PvLoadForecastProvider>,
    pub weather: Arc<WeatherWatcher>,
    pub shield: Arc<ServiceShield>,
    pub store: Arc<dyn PlanStore>,
    pub balancing: Arc<BalancingDetector>,
    pub weather_planner: Arc<crate::weather_emergency::WeatherEmergencyPlanner>,
    pub executor: Arc<PlanExecutor>,
    pub shared: Arc<SharedState>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let now = Timestamp::now();
        let box_id = config.battery.box_id.clone();

        let shield = Arc::new(ServiceShield::new(Duration::from_secs(config.polling.shield_timeout_min * 60)));

        let credentials = Credentials {
            username: config.source.username.clone().unwrap_or_default(),
            password: config.source.password.clone().unwrap_or_default(),
        };
        let telemetry = Arc::new(TelemetryClient::new(config.source.base_url.clone(), credentials, shield.clone())?);

        let price = Arc::new(SpotPriceProvider::new(config.source.price_base_url.clone(), Duration::from_secs(3600))?);
        let forecast = Arc::new(PvLoadForecastProvider::new(config.source.forecast_base_url.clone())?);
        let weather = Arc::new(WeatherWatcher::new(
            config.weather.api_url.clone(),
            config.weather.latitude,
            config.weather.longitude,
            now,
        )?);

        let file_store = FilePlanStore::new(config.store.directory.clone());
        if let Err(e) = file_store.reconcile(&box_id).await {
            tracing::warn!(error = %e, "plan store reconciliation failed at startup");
        }
        let store: Arc<dyn PlanStore> = Arc::new(file_store);

        let balancing = Arc::new(BalancingDetector::new(
            store.clone(),
            shield.clone(),
            box_id.clone(),
            config.battery.clone(),
            config.tariff.clone(),
            config.balancing.clone(),
        ));

        let weather_planner = Arc::new(crate::weather_emergency::WeatherEmergencyPlanner::new(
            store.clone(),
            box_id.clone(),
            config.battery.clone(),
            config.tariff.clone(),
        ));

        let executor = Arc::new(PlanExecutor::new(telemetry.clone(), shield.clone()));

        Ok(Self {
            config: Arc::new(config),
            telemetry,
            price,
            forecast,
            weather,
            shield,
            store,
            balancing,
            weather_planner,
            executor,
            shared: Arc::new(SharedState::default()),
        })
    }

    pub fn box_id(&self) -> &str {
        &self.config.battery.box_id
    }

    pub fn scheduler_deps(&self) -> SchedulerDeps {
        SchedulerDeps {
            telemetry: self.telemetry.clone(),
            price: self.price.clone(),
            forecast: self.forecast.clone(),
            weather: self.weather.clone(),
            shield: self.shield.clone(),
            store: self.store.clone(),
            balancing: self.balancing.clone(),
            weather_planner: self.weather_planner.clone(),
            executor: self.executor.clone(),
            box_id: self.box_id().to_string(),
            battery: self.config.battery.clone(),
            tariff: self.config.tariff.clone(),
            polling: self.config.polling.clone(),
            weather_refresh_min: self.config.weather.refresh_min,
            balancing_check_interval_min: self.config.balancing.check_interval_min,
            shared: self.shared.clone(),
        }
    }
}
