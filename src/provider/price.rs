//! Spot Price Provider (C2, price half): fetches a day-ahead hourly price
//! series and replicates it onto the quarter-hour grid.
//!
//! Grounded in the teacher's `ElprisetJustNuPriceForecaster`
//! (`src/forecast/prices.rs`): a cloned `reqwest::Client` plus a
//! `TTL`-checked `Arc<RwLock<Option<(DateTime<Utc>, ...)>>>` cache cell.
//! Kept the shape, dropped the SEK/Nordpool/DB-fallback specifics that have
//! no counterpart here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::types::{Price, Timestamp};
use crate::errors::CoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
struct RawPricePoint {
    time_start: chrono::DateTime<chrono::FixedOffset>,
    czk_per_kwh: f64,
}

struct Cache {
    fetched_at: Timestamp,
    series: Vec<(Timestamp, Price)>,
}

/// Fetches the day-ahead hourly spot price series and exposes it resampled
/// onto the quarter-hour grid (§4.2). Caches the raw series in memory and
/// only refetches once `ttl` elapses, mirroring the teacher's price
/// forecaster.
pub struct SpotPriceProvider {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: Arc<RwLock<Option<Cache>>>,
}

impl SpotPriceProvider {
    pub fn new(base_url: String, ttl: Duration) -> Result<Self, CoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("battery-box-planner/0.1"));
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("price client build failed: {e}") })?;

        Ok(Self { client, base_url, ttl, cache: Arc::new(RwLock::new(None)) })
    }

    /// Returns the hourly spot price series, refetching if the cache is
    /// stale. Fails with `ProviderUnavailable` if fewer than 24h of horizon
    /// remain after the fetch (§4.2 Non-goals: no synthetic extrapolation).
    pub async fn hourly_series(&self, now: Timestamp) -> Result<Vec<(Timestamp, Price)>, CoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(c) = cache.as_ref() {
                if now.duration_since(&c.fetched_at).num_seconds() < self.ttl.as_secs() as i64 {
                    return Ok(c.series.clone());
                }
            }
        }

        let series = self.fetch(now).await?;
        let horizon_end = series.last().map(|(ts, _)| *ts);
        let horizon_ok = horizon_end
            .map(|end| end.duration_since(&now).num_hours() >= MIN_HORIZON_HOURS)
            .unwrap_or(false);
        if !horizon_ok {
            warn!("price horizon shorter than 24h after fetch");
            return Err(CoreError::ProviderUnavailable { source: "price horizon < 24h".into() });
        }

        let mut cache = self.cache.write().await;
        *cache = Some(Cache { fetched_at: now, series: series.clone() });
        Ok(series)
    }

    /// Resamples the cached hourly series onto the quarter-hour grid (§4.2:
    /// replicate the hourly price across its four 15-minute children).
    pub async fn quarter_hour_price(&self, ts: Timestamp) -> Result<Price, CoreError> {
        let series = self.hourly_series(ts).await?;
        crate::domain::forecast::resample_hourly_price(&series, ts)
            .ok_or_else(|| CoreError::ProviderUnavailable { source: "no price point for requested interval".into() })
    }

    async fn fetch(&self, now: Timestamp) -> Result<Vec<(Timestamp, Price)>, CoreError> {
        let url = format!("{}/api/prices/today", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("price GET failed: {e}") })?;

        if !response.status().is_success() {
            return Err(CoreError::ProviderUnavailable { source: format!("price API returned {}", response.status()) });
        }

        let raw: Vec<RawPricePoint> = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("price body parse failed: {e}") })?;

        let mut points: Vec<(Timestamp, Price)> = raw
            .into_iter()
            .map(|r| (Timestamp(r.time_start.with_minute(0).unwrap_or(r.time_start)), Price::czk_per_kwh(r.czk_per_kwh)))
            .collect();
        points.sort_by(|a, b| a.0.inner().cmp(&b.0.inner()));
        let _ = now;
        Ok(points)
    }
}
