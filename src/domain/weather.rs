use serde::{Deserialize, Serialize};

use super::types::Timestamp;

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Moderate,
    Severe,
    Extreme,
}

impl Severity {
    pub fn is_emergency(&self) -> bool {
        matches!(self, Severity::Severe | Severity::Extreme)
    }
}

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeatherWarning {
    pub severity: Severity,
    pub start_ts: Timestamp,
    pub expected_end_ts: Timestamp,
}

impl WeatherWarning {
    pub fn none(now: Timestamp) -> Self {
        Self {
            severity: Severity::None,
            start_ts: now,
            expected_end_ts: now,
        }
    }
}
