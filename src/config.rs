use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration, loaded from TOML plus `BBP__`-prefixed
/// environment variables (§6 "Configuration surface").
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub auth: AuthConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub tariff: TariffConfig,

    #[validate(nested)]
    pub polling: PollingConfig,

    #[validate(nested)]
    pub balancing: BalancingConfig,

    #[validate(nested)]
    pub weather: WeatherConfig,

    #[validate(nested)]
    pub store: StoreConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,

    #[validate(nested)]
    pub source: DataSourceConfig,
}

/// HTTP API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub enable_cors: bool,

    #[serde(default = "default_true")]
    pub enable_compression: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse server socket address")
    }
}

/// Outward API bearer-token check (§9 Non-goals: no full auth flow).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AuthConfig {
    #[validate(length(min = 16))]
    pub bearer_token: String,
}

/// Battery box identity and physical limits.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BatteryConfig {
    #[validate(length(min = 1))]
    pub box_id: String,

    #[validate(range(min = 0.1, max = 1000.0))]
    pub capacity_kwh: f64,

    #[validate(range(min = 20.0, max = 100.0))]
    #[serde(default = "default_user_min_soc_pct")]
    pub user_min_soc_pct: f64,

    #[serde(default = "default_home_charge_rate_w")]
    pub home_charge_rate_w: f64,

    #[serde(default = "default_max_charge_kw")]
    pub max_charge_kw: f64,

    #[serde(default = "default_max_discharge_kw")]
    pub max_discharge_kw: f64,

    #[serde(default = "default_grid_export_limit_kw")]
    pub grid_export_limit_kw: f64,
}

/// Tariff coefficients applied to the raw spot price (§4.2). The concrete
/// VAT rate and surcharges are supplied, not derived.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TariffConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub vat_rate: f64,

    pub distribution_surcharge_buy_czk: f64,

    pub distribution_surcharge_sell_czk: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub sell_asymmetry: f64,

    #[validate(range(min = 0.5, max = 5.0))]
    #[serde(default = "default_threshold_cheap_czk")]
    pub threshold_cheap_czk: f64,
}

/// Scheduler tick periods for C1/C2/C3 and the derived tasks (§5).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PollingConfig {
    #[validate(range(min = 30, max = 300))]
    #[serde(default = "default_standard_poll_s")]
    pub standard_poll_s: u64,

    #[validate(range(min = 300, max = 3600))]
    #[serde(default = "default_extended_poll_s")]
    pub extended_poll_s: u64,

    #[serde(default = "default_optimizer_refresh_min")]
    pub optimizer_refresh_min: u64,

    #[serde(default = "default_executor_tick_s")]
    pub executor_tick_s: u64,

    #[validate(range(min = 5, max = 60))]
    #[serde(default = "default_shield_timeout_min")]
    pub shield_timeout_min: u64,
}

/// Balancing detector thresholds (§4.7).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BalancingConfig {
    #[serde(default = "default_opportunistic_threshold_soc_pct")]
    pub opportunistic_threshold_soc_pct: f64,

    #[serde(default = "default_holding_hours_default")]
    pub holding_hours_default: f64,

    #[serde(default = "default_balancing_window_hours")]
    pub balancing_window_hours: u32,

    #[serde(default = "default_forced_interval_days")]
    pub forced_interval_days: u32,

    #[serde(default = "default_check_interval_min")]
    pub check_interval_min: u64,
}

/// Weather warning source configuration (§4.3/§4.8).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WeatherConfig {
    #[validate(url)]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    #[serde(default = "default_weather_refresh_min")]
    pub refresh_min: u64,
}

/// Plan Store directory layout (§4.6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StoreConfig {
    pub directory: PathBuf,
}

/// Logging configuration, adapted from the teacher's telemetry setup.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Telemetry/price/forecast transport mode: both use the same data model.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceMode {
    Cloud,
    Local,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DataSourceConfig {
    pub mode: DataSourceMode,

    #[validate(url)]
    pub base_url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[validate(url)]
    pub price_base_url: String,

    #[validate(url)]
    pub forecast_base_url: String,
}

fn default_true() -> bool { true }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_user_min_soc_pct() -> f64 { 33.0 }
fn default_home_charge_rate_w() -> f64 { 3000.0 }
fn default_max_charge_kw() -> f64 { 5.0 }
fn default_max_discharge_kw() -> f64 { 5.0 }
fn default_grid_export_limit_kw() -> f64 { 10.0 }
fn default_threshold_cheap_czk() -> f64 { 1.5 }
fn default_standard_poll_s() -> u64 { 30 }
fn default_extended_poll_s() -> u64 { 300 }
fn default_optimizer_refresh_min() -> u64 { 30 }
fn default_executor_tick_s() -> u64 { 60 }
fn default_shield_timeout_min() -> u64 { 15 }
fn default_opportunistic_threshold_soc_pct() -> f64 { 90.0 }
fn default_holding_hours_default() -> f64 { 3.0 }
fn default_balancing_window_hours() -> u32 { 6 }
fn default_forced_interval_days() -> u32 { 30 }
fn default_check_interval_min() -> u64 { 30 }
fn default_weather_refresh_min() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }

impl AppConfig {
    /// Loads `config/default.toml`, an optional environment-specific overlay,
    /// then `BBP__`-prefixed environment variables, in that order.
    pub fn load() -> Result<Self> {
        Self::load_with_env(std::env::var("APP_ENV").ok().as_deref())
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")).nested());
        }

        figment = figment.merge(Env::prefixed("BBP__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

pub type Config = AppConfig;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_parses_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            enable_cors: false,
            enable_compression: true,
        };
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn battery_config_rejects_user_min_soc_below_floor() {
        let config = BatteryConfig {
            box_id: "box-1".into(),
            capacity_kwh: 15.36,
            user_min_soc_pct: 5.0,
            home_charge_rate_w: 3000.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            grid_export_limit_kw: 10.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn data_source_mode_round_trips() {
        let json = r#""cloud""#;
        let mode: DataSourceMode = serde_json::from_str(json).unwrap();
        assert_eq!(mode, DataSourceMode::Cloud);
    }
}
