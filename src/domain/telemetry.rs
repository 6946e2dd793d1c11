use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::types::{Energy, Power, Timestamp};

/// The four inverter operating modes.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeKind {
    /// Grid priority: loads served from PV and grid, battery idle.
    HomeI,
    /// Battery priority / conserve: loads served by battery down to user_min_soc.
    HomeIi,
    /// Solar priority: battery charges from PV surplus only, never from grid.
    HomeIii,
    /// Grid-charge to full: battery charged from grid up to target SoC.
    HomeUps,
}

impl ModeKind {
    /// Tie-break rank used when two modes score equally: higher wins.
    /// HOME_III > HOME_II > HOME_I > HOME_UPS.
    pub fn tie_break_rank(&self) -> u8 {
        match self {
            ModeKind::HomeIii => 3,
            ModeKind::HomeIi => 2,
            ModeKind::HomeI => 1,
            ModeKind::HomeUps => 0,
        }
    }
}

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BoilerState {
    On,
    Off,
}

/// Current inverter state as retrieved from the vendor cloud (or LAN mirror).
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub capacity: Energy,
    pub soc: Energy,
    pub current_mode: ModeKind,
    pub boiler_state: BoilerState,
    pub grid_export_limit: Power,
    pub last_update_ts: Timestamp,
}

impl TelemetrySnapshot {
    /// `0 <= soc <= capacity`.
    pub fn is_valid(&self) -> bool {
        self.soc.as_kwh() >= 0.0 && self.soc.as_kwh() <= self.capacity.as_kwh()
    }

    pub fn soc_pct(&self) -> f64 {
        if self.capacity.as_kwh() <= 0.0 {
            0.0
        } else {
            100.0 * self.soc.as_kwh() / self.capacity.as_kwh()
        }
    }
}

/// Health of an upstream telemetry/price/forecast/weather source.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Degraded { consecutive_failures: u32 },
}

impl Default for SourceHealth {
    fn default() -> Self {
        SourceHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_tie_break_order() {
        assert!(ModeKind::HomeIii.tie_break_rank() > ModeKind::HomeIi.tie_break_rank());
        assert!(ModeKind::HomeIi.tie_break_rank() > ModeKind::HomeI.tie_break_rank());
        assert!(ModeKind::HomeI.tie_break_rank() > ModeKind::HomeUps.tie_break_rank());
    }

    #[test]
    fn snapshot_validity() {
        let snap = TelemetrySnapshot {
            capacity: Energy::kwh(15.36),
            soc: Energy::kwh(10.0),
            current_mode: ModeKind::HomeI,
            boiler_state: BoilerState::Off,
            grid_export_limit: Power::kilowatts(5.0),
            last_update_ts: Timestamp::now(),
        };
        assert!(snap.is_valid());
        assert!((snap.soc_pct() - 65.104166).abs() < 0.01);
    }

    #[test]
    fn mode_serde_roundtrip() {
        let m = ModeKind::HomeUps;
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"HOME_UPS\"");
        let back: ModeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
