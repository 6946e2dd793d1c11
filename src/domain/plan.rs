use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::forecast::ForecastPoint;
use super::telemetry::ModeKind;
use super::types::{Energy, Price, Timestamp};

pub const PLAN_INTERVALS: usize = 192;

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanKind {
    Automatic,
    Manual,
    Balancing,
    Weather,
}

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanStatus {
    Simulated,
    Active,
    Deactivated,
}

/// Whether a plan's target SoC is a scoring bonus (`soft`, automatic plans)
/// or a hard constraint (`hard`, manual/balancing/weather plans) -- §4.5.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSocPolicy {
    Soft,
    Hard,
}

/// A contiguous range of intervals during which a balancing or weather plan
/// forces `holding_mode` and requires the entering SoC to hit `target_soc`.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingWindow {
    pub start_ts: Timestamp,
    pub duration_h: f64,
    pub target_soc_pct: f64,
    pub holding_mode: ModeKind,
}

impl HoldingWindow {
    pub fn end_ts(&self) -> Timestamp {
        self.start_ts.add_minutes((self.duration_h * 60.0).round() as i64)
    }

    pub fn contains(&self, ts: &Timestamp) -> bool {
        !ts.is_before(&self.start_ts) && ts.is_before(&self.end_ts())
    }
}

/// The frozen inputs to a single optimizer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationContext {
    pub capacity: Energy,
    pub initial_soc: Energy,
    pub user_min_soc: Energy,
    /// SoC boundary tolerance, default 0.5 kWh.
    pub soc_tolerance: Energy,
    pub forecast: Vec<ForecastPoint>,
    pub tariff: super::forecast::TariffParameters,
    pub target_policy: TargetSocPolicy,
    pub target_time: Option<Timestamp>,
    pub holding_hours: Option<f64>,
    pub holding_mode: Option<ModeKind>,
    pub cheap_threshold: Price,
    pub plan_kind: PlanKind,
    pub home_charge_rate: super::types::Power,
    pub max_charge_power: super::types::Power,
    pub max_discharge_power: super::types::Power,
    pub grid_export_limit: super::types::Power,
}

impl SimulationContext {
    pub fn holding_window(&self) -> Option<HoldingWindow> {
        match (self.target_time, self.holding_hours, self.holding_mode) {
            (Some(start_ts), Some(duration_h), Some(holding_mode)) => Some(HoldingWindow {
                start_ts,
                duration_h,
                target_soc_pct: 100.0,
                holding_mode,
            }),
            _ => None,
        }
    }

    /// ErrValidation checks per §7: target_time in the past, target_soc > 100,
    /// holding_hours < 1.
    pub fn validate(&self, now: Timestamp) -> Result<(), PlanError> {
        if let Some(t) = self.target_time {
            if t.is_before(&now) {
                return Err(PlanError::Validation("target_time is in the past".into()));
            }
        }
        if let Some(h) = self.holding_hours {
            if h < 1.0 {
                return Err(PlanError::Validation("holding_hours must be >= 1".into()));
            }
        }
        if self.user_min_soc.as_kwh() > self.capacity.as_kwh() {
            return Err(PlanError::Validation("user_min_soc exceeds capacity".into()));
        }
        Ok(())
    }
}

/// One simulated quarter-hour interval of a plan.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalProjection {
    pub ts: Timestamp,
    pub mode: ModeKind,
    pub soc_before: Energy,
    pub soc_after: Energy,
    pub grid_import: Energy,
    pub grid_export: Energy,
    pub battery_charge: Energy,
    pub battery_discharge: Energy,
    pub cost_czk: f64,
    /// Set by the simulator's forward pass when `soc_after` would fall below
    /// `user_min_soc - tolerance` before clamping redirection (§4.4).
    pub deficit: bool,
}

impl IntervalProjection {
    /// P2: soc_after ≈ soc_before + charge − discharge within 0.0005 kWh.
    pub fn energy_balance_holds(&self) -> bool {
        let expected = self.soc_before + self.battery_charge - self.battery_discharge;
        expected.approx_eq(&self.soc_after)
    }
}

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummaryMetrics {
    pub total_import_kwh: f64,
    pub total_export_kwh: f64,
    pub final_soc_kwh: f64,
    pub horizon_truncated: bool,
}

/// A snapshot of the context that produced a plan, copied by value so the
/// plan never shares a reference to live telemetry or forecast state.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub capacity: Energy,
    pub initial_soc: Energy,
    pub user_min_soc: Energy,
    pub target_policy: TargetSocPolicy,
    pub holding_window: Option<HoldingWindow>,
}

#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub kind: PlanKind,
    pub status: PlanStatus,
    pub created_ts: Timestamp,
    pub activated_ts: Option<Timestamp>,
    pub deactivated_ts: Option<Timestamp>,
    pub context_summary: ContextSummary,
    pub intervals: Vec<IntervalProjection>,
    pub total_cost_czk: f64,
    pub summary_metrics: PlanSummaryMetrics,
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("plan has no intervals")]
    EmptyPlan,
    #[error("plan does not cover exactly {expected} intervals (has {actual})")]
    WrongIntervalCount { expected: usize, actual: usize },
    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition { from: PlanStatus, to: PlanStatus },
    #[error("validation failed: {0}")]
    Validation(String),
}

impl Plan {
    /// P1: every interval covers exactly one timestamp in [created, +48h).
    pub fn interval_for(&self, ts: &Timestamp) -> Option<&IntervalProjection> {
        self.intervals.iter().find(|i| {
            let start = i.ts;
            let end = start.add_minutes(15);
            !ts.is_before(&start) && ts.is_before(&end)
        })
    }

    pub fn validate_shape(&self) -> Result<(), PlanError> {
        if self.intervals.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        if self.intervals.len() != PLAN_INTERVALS && !self.summary_metrics.horizon_truncated {
            return Err(PlanError::WrongIntervalCount {
                expected: PLAN_INTERVALS,
                actual: self.intervals.len(),
            });
        }
        Ok(())
    }

    /// `simulated -> active -> deactivated` is the only legal path;
    /// re-activating the same plan_id is idempotent.
    pub fn transition(&mut self, to: PlanStatus, now: Timestamp) -> Result<(), PlanError> {
        use PlanStatus::*;
        match (self.status, to) {
            (Simulated, Active) => {
                self.status = Active;
                self.activated_ts = Some(now);
                Ok(())
            }
            (Active, Active) => Ok(()), // idempotent re-activation
            (Active, Deactivated) => {
                self.status = Deactivated;
                self.deactivated_ts = Some(now);
                Ok(())
            }
            (from, to) if from == to => Ok(()),
            (from, to) => Err(PlanError::IllegalTransition { from, to }),
        }
    }

    pub fn is_immutable(&self) -> bool {
        matches!(self.status, PlanStatus::Deactivated)
    }
}

/// Issued by the executor (C9) and tracked by the service shield (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandParams {
    SetMode { mode: ModeKind },
    SetGridLimit { watts: i64 },
    SetBoiler { on: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub params: CommandParams,
    pub issued_ts: Timestamp,
}
