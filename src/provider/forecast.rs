//! PV/Load Forecast Provider (C2, forecast half): fetches PV yield and load
//! forecasts and interpolates them onto the quarter-hour grid, then joins
//! them with the spot price to produce `ForecastPoint`s for the optimizer.
//!
//! Grounded in the teacher's `SmhiClient` (`src/forecast/weather.rs`): same
//! single-`reqwest::Client`-plus-`base_url` shape. Dropped the persistence
//! fallback (no counterpart here: §4.2 Non-goals rule out synthetic
//! extrapolation, a provider outage surfaces as `ProviderUnavailable`
//! instead of degrading silently).

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::domain::forecast::ForecastPoint;
use crate::domain::types::{Energy, Timestamp};
use crate::errors::CoreError;
use crate::provider::price::SpotPriceProvider;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RawSeriesPoint {
    ts: chrono::DateTime<chrono::FixedOffset>,
    kwh: f64,
}

/// Fetches raw PV/load series and assembles `ForecastPoint`s by joining
/// trapezoidally-interpolated PV/load values with the spot price provider's
/// quarter-hour resampled price (§4.2).
pub struct PvLoadForecastProvider {
    client: reqwest::Client,
    base_url: String,
}

impl PvLoadForecastProvider {
    pub fn new(base_url: String) -> Result<Self, CoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("battery-box-planner/0.1"));
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("forecast client build failed: {e}") })?;
        Ok(Self { client, base_url })
    }

    /// Builds the quarter-hour grid of `ForecastPoint`s spanning `[now, now + horizon_h)`,
    /// interpolating PV/load and resampling price for each slot.
    pub async fn build_horizon(
        &self,
        now: Timestamp,
        horizon_h: u32,
        price_provider: &SpotPriceProvider,
    ) -> Result<Vec<ForecastPoint>, CoreError> {
        let pv_series = self.fetch_series("/api/forecast/pv").await?;
        let load_series = self.fetch_series("/api/forecast/load").await?;

        let intervals = (horizon_h as i64) * 4;
        let mut points = Vec::with_capacity(intervals as usize);
        let mut ts = now.floor_to_interval();
        for _ in 0..intervals {
            let pv = crate::domain::forecast::interpolate_quarter_hour(&pv_series, ts)
                .ok_or_else(|| CoreError::ProviderUnavailable { source: "no PV forecast coverage for interval".into() })?;
            let load = crate::domain::forecast::interpolate_quarter_hour(&load_series, ts)
                .ok_or_else(|| CoreError::ProviderUnavailable { source: "no load forecast coverage for interval".into() })?;
            let spot_price = price_provider.quarter_hour_price(ts).await?;

            points.push(ForecastPoint {
                ts,
                pv: Energy::kwh(pv.max(0.0)),
                load: Energy::kwh(load.max(0.0)),
                spot_price,
            });
            ts = ts.add_minutes(15);
        }

        Ok(points)
    }

    async fn fetch_series(&self, path: &str) -> Result<Vec<(Timestamp, f64)>, CoreError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("forecast GET {path} failed: {e}") })?;

        if !response.status().is_success() {
            return Err(CoreError::ProviderUnavailable { source: format!("forecast API {path} returned {}", response.status()) });
        }

        let raw: Vec<RawSeriesPoint> = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("forecast body parse failed for {path}: {e}") })?;

        let mut series: Vec<(Timestamp, f64)> = raw.into_iter().map(|r| (Timestamp(r.ts), r.kwh)).collect();
        series.sort_by(|a, b| a.0.inner().cmp(&b.0.inner()));
        Ok(series)
    }
}
