//! Weather Alert Watcher (C3): polls a generic severity-bearing JSON
//! endpoint hourly and publishes the latest `WeatherWarning` for the
//! balancing detector and weather emergency planner to read (§4.3).
//!
//! Grounded in the teacher's `SmhiClient` (`src/forecast/weather.rs`): a
//! single `reqwest::Client` plus `base_url`, polled on an interval and
//! published through a shared cell -- generalized from SMHI's structured
//! forecast points to a generic `{severity, start, end}` alert payload,
//! since the spec's weather source is abstract.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::domain::types::Timestamp;
use crate::domain::weather::{Severity, WeatherWarning};
use crate::errors::CoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RawWarning {
    severity: Severity,
    start_ts: chrono::DateTime<chrono::FixedOffset>,
    expected_end_ts: chrono::DateTime<chrono::FixedOffset>,
}

/// Holds the most recently published `WeatherWarning` behind a read-mostly
/// lock; `poll()` is invoked by the scheduler on an hourly cadence (§4.3,
/// §5) and is the sole writer.
pub struct WeatherWatcher {
    client: reqwest::Client,
    api_url: String,
    latitude: f64,
    longitude: f64,
    current: Arc<RwLock<WeatherWarning>>,
}

impl WeatherWatcher {
    pub fn new(api_url: String, latitude: f64, longitude: f64, now: Timestamp) -> Result<Self, CoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("battery-box-planner/0.1"));
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("weather client build failed: {e}") })?;

        Ok(Self {
            client,
            api_url,
            latitude,
            longitude,
            current: Arc::new(RwLock::new(WeatherWarning::none(now))),
        })
    }

    pub async fn current_warning(&self) -> WeatherWarning {
        *self.current.read().await
    }

    /// Refreshes the published warning. On fetch or parse failure the prior
    /// warning is retained and a `ProviderUnavailable` is surfaced to the
    /// caller for health tracking -- no fallback synthesis, unlike the
    /// teacher's persistence forecast (§4.3's source is an alert feed, not a
    /// control-loop input that must never go silent).
    pub async fn poll(&self, now: Timestamp) -> Result<(), CoreError> {
        let url = format!(
            "{}?lat={:.6}&lon={:.6}",
            self.api_url.trim_end_matches('/'),
            self.latitude,
            self.longitude
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            error!(error = %e, "weather API request failed");
            CoreError::ProviderUnavailable { source: format!("weather GET failed: {e}") }
        })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "weather API returned non-success status");
            return Err(CoreError::ProviderUnavailable { source: format!("weather API returned {}", response.status()) });
        }

        let raw: RawWarning = response.json().await.map_err(|e| {
            error!(error = %e, "weather API body parse failed");
            CoreError::ProviderUnavailable { source: format!("weather body parse failed: {e}") }
        })?;

        let warning = WeatherWarning {
            severity: raw.severity,
            start_ts: Timestamp(raw.start_ts),
            expected_end_ts: Timestamp(raw.expected_end_ts),
        };

        let mut current = self.current.write().await;
        *current = warning;
        let _ = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn defaults_to_none_before_first_poll() {
        let watcher = WeatherWatcher::new("http://example.invalid".into(), 50.0, 14.0, Timestamp::now()).unwrap();
        assert_eq!(watcher.current_warning().await.severity, Severity::None);
    }

    #[tokio::test]
    async fn poll_publishes_fetched_warning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "severity": "severe",
                "start_ts": "2026-01-01T10:00:00+01:00",
                "expected_end_ts": "2026-01-01T18:00:00+01:00",
            })))
            .mount(&server)
            .await;

        let watcher = WeatherWatcher::new(server.uri(), 50.0, 14.0, Timestamp::now()).unwrap();
        watcher.poll(Timestamp::now()).await.unwrap();
        let warning = watcher.current_warning().await;
        assert_eq!(warning.severity, Severity::Severe);
        assert!(warning.severity.is_emergency());
    }

    #[tokio::test]
    async fn failed_poll_retains_prior_warning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let watcher = WeatherWatcher::new(server.uri(), 50.0, 14.0, Timestamp::now()).unwrap();
        let result = watcher.poll(Timestamp::now()).await;
        assert!(result.is_err());
        assert_eq!(watcher.current_warning().await.severity, Severity::None);
    }
}
