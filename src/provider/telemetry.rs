//! Telemetry Client (C1): authenticated session HTTP access to the vendor
//! cloud (or a LAN mirror, selected by `DataSourceMode`), ETag-cached
//! polling, and write operations announced to the Service Shield (§4.1).
//!
//! Grounded in the teacher's `ElprisetJustNuPriceForecaster`: a cloned
//! `reqwest::Client` plus an `Arc<RwLock<...>>` cache cell with a TTL
//! check, generalized here from a time-based TTL to an ETag/`If-None-Match`
//! revalidation cycle, and extended with session-cookie re-authentication
//! (teacher has no session concept; this is new surface grounded in the
//! spec's §6 "form-login producing a session cookie").

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::plan::CommandParams;
use crate::domain::telemetry::{BoilerState, ModeKind, SourceHealth, TelemetrySnapshot};
use crate::domain::types::{Energy, Power, Timestamp};
use crate::errors::CoreError;
use crate::shield::ServiceShield;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    capacity_kwh: f64,
    soc_kwh: f64,
    current_mode: ModeKind,
    boiler_on: bool,
    grid_export_limit_w: f64,
}

#[derive(Debug, Serialize)]
struct SetModeBody {
    mode: ModeKind,
}

#[derive(Debug, Serialize)]
struct SetGridLimitBody {
    watts: i64,
}

#[derive(Debug, Serialize)]
struct SetBoilerBody {
    on: bool,
}

struct CacheEntry {
    etag: Option<String>,
    body: TelemetrySnapshot,
}

struct Endpoint {
    cache: RwLock<Option<CacheEntry>>,
    health: RwLock<SourceHealth>,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            cache: RwLock::new(None),
            health: RwLock::new(SourceHealth::Healthy),
        }
    }
}

/// Credentials for the form-login session (§6).
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Speaks the vendor's JSON dialect against either `cloud` or `local`
/// base URLs -- both share identical wire semantics (§4.1 design note), so
/// one struct parametrized by base URL covers `DataSourceMode::Cloud` and
/// `DataSourceMode::Local`.
pub struct TelemetryClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    session_cookie: RwLock<Option<String>>,
    stats: Endpoint,
    extended_stats: Endpoint,
    shield: Arc<ServiceShield>,
}

impl TelemetryClient {
    pub fn new(base_url: String, credentials: Credentials, shield: Arc<ServiceShield>) -> Result<Self, CoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("battery-box-planner/0.1"));
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .cookie_store(true)
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("telemetry client build failed: {e}") })?;

        Ok(Self {
            client,
            base_url,
            credentials,
            session_cookie: RwLock::new(None),
            stats: Endpoint::new(),
            extended_stats: Endpoint::new(),
            shield: shield.clone(),
        })
    }

    /// `GetStats` (§4.1): ETag-revalidated poll of the primary endpoint.
    pub async fn get_stats(&self, now: Timestamp) -> Result<TelemetrySnapshot, CoreError> {
        self.poll_endpoint(&self.stats, "/api/stats", now).await
    }

    /// `GetExtendedStats` (§4.1): lower-cadence endpoint, same caching rules.
    pub async fn get_extended_stats(&self, now: Timestamp) -> Result<TelemetrySnapshot, CoreError> {
        self.poll_endpoint(&self.extended_stats, "/api/stats/extended", now).await
    }

    pub async fn health(&self) -> SourceHealth {
        *self.stats.health.read().await
    }

    async fn poll_endpoint(&self, endpoint: &Endpoint, path: &str, now: Timestamp) -> Result<TelemetrySnapshot, CoreError> {
        match self.poll_once(endpoint, path, now).await {
            Ok(snapshot) => {
                let mut health = endpoint.health.write().await;
                *health = SourceHealth::Healthy;
                Ok(snapshot)
            }
            Err(e) => {
                let mut health = endpoint.health.write().await;
                let failures = match *health {
                    SourceHealth::Degraded { consecutive_failures } => consecutive_failures + 1,
                    SourceHealth::Healthy => 1,
                };
                *health = if failures >= 3 {
                    warn!(%path, failures, "telemetry source degraded after 3 consecutive failures");
                    SourceHealth::Degraded { consecutive_failures: failures }
                } else {
                    SourceHealth::Degraded { consecutive_failures: failures }
                };
                Err(e)
            }
        }
    }

    async fn poll_once(&self, endpoint: &Endpoint, path: &str, now: Timestamp) -> Result<TelemetrySnapshot, CoreError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let etag = {
            let cache = endpoint.cache.read().await;
            cache.as_ref().and_then(|c| c.etag.clone())
        };

        let response = self.send_authenticated(|client| {
            let mut req = client.get(&url);
            if let Some(tag) = &etag {
                req = req.header(IF_NONE_MATCH, tag);
            }
            req
        }).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            let cache = endpoint.cache.read().await;
            return cache
                .as_ref()
                .map(|c| TelemetrySnapshot { last_update_ts: now, ..c.body.clone() })
                .ok_or_else(|| CoreError::ProviderUnavailable { source: "304 with no prior cached body".into() });
        }

        if !response.status().is_success() {
            return Err(CoreError::ProviderUnavailable {
                source: format!("telemetry GET {path} returned {}", response.status()),
            });
        }

        let new_etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let raw: RawSnapshot = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("telemetry body parse failed: {e}") })?;

        let snapshot = TelemetrySnapshot {
            capacity: Energy::kwh(raw.capacity_kwh),
            soc: Energy::kwh(raw.soc_kwh),
            current_mode: raw.current_mode,
            boiler_state: if raw.boiler_on { BoilerState::On } else { BoilerState::Off },
            grid_export_limit: Power::watts(raw.grid_export_limit_w),
            last_update_ts: now,
        };

        let mut cache = endpoint.cache.write().await;
        *cache = Some(CacheEntry { etag: new_etag, body: snapshot.clone() });
        Ok(snapshot)
    }

    /// `SetMode` (§4.1). Announced to the Service Shield before issuance.
    pub async fn set_mode(&self, mode: ModeKind, now: Timestamp) -> Result<(), CoreError> {
        self.shield.announce(CommandParams::SetMode { mode }, now).await;
        self.write("/api/control/mode", &SetModeBody { mode }).await
    }

    /// `SetGridLimit` (§4.1).
    pub async fn set_grid_limit(&self, watts: i64, now: Timestamp) -> Result<(), CoreError> {
        self.shield.announce(CommandParams::SetGridLimit { watts }, now).await;
        self.write("/api/control/grid-limit", &SetGridLimitBody { watts }).await
    }

    /// `SetBoiler` (§4.1).
    pub async fn set_boiler(&self, on: bool, now: Timestamp) -> Result<(), CoreError> {
        self.shield.announce(CommandParams::SetBoiler { on }, now).await;
        self.write("/api/control/boiler", &SetBoilerBody { on }).await
    }

    async fn write<B: Serialize>(&self, path: &str, body: &B) -> Result<(), CoreError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .send_authenticated(|client| client.post(&url).json(body))
            .await?;
        if !response.status().is_success() {
            return Err(CoreError::ActuationFailed { command: format!("{path} returned {}", response.status()) });
        }
        Ok(())
    }

    /// Sends a request, re-authenticating once on a session-expiry response
    /// (401/403) and retrying the request a single time (§4.1).
    async fn send_authenticated<F>(&self, build: F) -> Result<reqwest::Response, CoreError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.ensure_session().await?;
        let response = build(&self.client)
            .send()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("telemetry request failed: {e}") })?;

        if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN {
            info!("telemetry session expired, re-authenticating");
            self.authenticate().await?;
            return build(&self.client)
                .send()
                .await
                .map_err(|e| CoreError::ProviderUnavailable { source: format!("telemetry retry failed: {e}") });
        }

        Ok(response)
    }

    async fn ensure_session(&self) -> Result<(), CoreError> {
        if self.session_cookie.read().await.is_some() {
            return Ok(());
        }
        self.authenticate().await
    }

    async fn authenticate(&self) -> Result<(), CoreError> {
        let url = format!("{}/api/login", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .form(&[("username", &self.credentials.username), ("password", &self.credentials.password)])
            .send()
            .await
            .map_err(|e| CoreError::ProviderUnavailable { source: format!("telemetry login failed: {e}") })?;

        if !response.status().is_success() {
            return Err(CoreError::ProviderUnavailable {
                source: format!("telemetry login returned {}", response.status()),
            });
        }

        let mut cookie = self.session_cookie.write().await;
        *cookie = Some("established".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials { username: "u".into(), password: "p".into() }
    }

    fn shield() -> Arc<ServiceShield> {
        Arc::new(ServiceShield::new(Duration::from_secs(900)))
    }

    #[tokio::test]
    async fn get_stats_parses_snapshot_and_caches_etag() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET")).and(path("/api/stats"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_json(serde_json::json!({
                        "capacity_kwh": 15.36,
                        "soc_kwh": 8.0,
                        "current_mode": "HOME_I",
                        "boiler_on": false,
                        "grid_export_limit_w": 5000.0
                    })),
            )
            .mount(&server)
            .await;

        let client = TelemetryClient::new(server.uri(), credentials(), shield()).unwrap();
        let snapshot = client.get_stats(Timestamp::now()).await.unwrap();
        assert_eq!(snapshot.current_mode, ModeKind::HomeI);
        assert_eq!(snapshot.soc.as_kwh(), 8.0);
    }

    #[tokio::test]
    async fn not_modified_reuses_cached_body_with_fresh_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET")).and(path("/api/stats")).and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET")).and(path("/api/stats"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_json(serde_json::json!({
                        "capacity_kwh": 15.36,
                        "soc_kwh": 8.0,
                        "current_mode": "HOME_I",
                        "boiler_on": false,
                        "grid_export_limit_w": 5000.0
                    })),
            )
            .mount(&server)
            .await;

        let client = TelemetryClient::new(server.uri(), credentials(), shield()).unwrap();
        let first = client.get_stats(Timestamp::now()).await.unwrap();
        let second = client.get_stats(Timestamp::now().add_minutes(1)).await.unwrap();
        assert_eq!(second.soc, first.soc);
        assert!(second.last_update_ts.is_after(&first.last_update_ts) || second.last_update_ts == first.last_update_ts);
    }

    #[tokio::test]
    async fn three_consecutive_failures_marks_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET")).and(path("/api/stats"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TelemetryClient::new(server.uri(), credentials(), shield()).unwrap();
        for _ in 0..3 {
            let _ = client.get_stats(Timestamp::now()).await;
        }
        assert!(matches!(client.health().await, SourceHealth::Degraded { consecutive_failures: 3 }));
    }

    #[tokio::test]
    async fn set_mode_announces_to_shield_before_write() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST")).and(path("/api/control/mode"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let shield = shield();
        let client = TelemetryClient::new(server.uri(), credentials(), shield.clone()).unwrap();
        client.set_mode(ModeKind::HomeUps, Timestamp::now()).await.unwrap();

        let now = Timestamp::now();
        shield.observe_unexpected_mode(ModeKind::HomeUps, now, None).await;
        assert_eq!(shield.state().await, crate::shield::ShieldState::Normal);
    }
}
