//! Plan Executor (C9): every scheduler tick, resolves the active plan's
//! current interval, reconciles it against telemetry, and issues the
//! minimal command set through the Telemetry Client (§4.9). Also enforces
//! the weather plan's SoC-maintenance override (§4.8).
//!
//! Grounded in the teacher's main control-loop tick handling
//! (`controller/mod.rs`): sensor-read, compare-against-target, retry-with-
//! sleep-then-continue shape, generalized from a fixed 1s retry to the
//! spec's 10s-spaced double retry before surfacing `ActuationFailed`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::plan::{Plan, PlanKind};
use crate::domain::telemetry::{ModeKind, TelemetrySnapshot};
use crate::domain::types::Timestamp;
use crate::errors::CoreError;
use crate::provider::telemetry::TelemetryClient;
use crate::shield::ServiceShield;

const RETRY_SPACING: Duration = Duration::from_secs(10);
const EXTERNAL_CHANGE_GRACE_SECS: i64 = 300;

struct LastIssued {
    mode: ModeKind,
    issued_ts: Timestamp,
}

/// Reconciles the box's current telemetry mode with the active plan's
/// current interval on every tick. Retries a failing command twice with
/// 10s spacing before surfacing `ErrActuationFailed`; never panics the
/// process on a persistent actuation failure.
pub struct PlanExecutor {
    telemetry: Arc<TelemetryClient>,
    shield: Arc<ServiceShield>,
    last_issued: RwLock<Option<LastIssued>>,
}

impl PlanExecutor {
    pub fn new(telemetry: Arc<TelemetryClient>, shield: Arc<ServiceShield>) -> Self {
        Self { telemetry, shield, last_issued: RwLock::new(None) }
    }

    /// Runs one reconciliation tick against `plan` (if any) and the latest
    /// `snapshot`. Returns the command issued, if one was needed.
    pub async fn tick(&self, plan: Option<&Plan>, snapshot: &TelemetrySnapshot, now: Timestamp) -> Result<Option<ModeKind>, CoreError> {
        let Some(plan) = plan else {
            return Ok(None);
        };
        let Some(interval) = plan.interval_for(&now) else {
            return Ok(None);
        };

        let desired_mode = self.resolve_desired_mode(plan, interval, snapshot, now);

        if snapshot.current_mode == desired_mode {
            self.shield.observe_converged(now).await;
            return Ok(None);
        }

        let explained_by_us = {
            let last = self.last_issued.read().await;
            last.as_ref()
                .map(|l| l.mode == snapshot.current_mode && now.duration_since(&l.issued_ts).num_seconds() <= EXTERNAL_CHANGE_GRACE_SECS)
                .unwrap_or(false)
        };
        if !explained_by_us {
            self.shield.observe_unexpected_mode(snapshot.current_mode, now, Some(plan.plan_id)).await;
        }

        if !self.shield.is_writable(now).await {
            return Err(CoreError::Overridden { plan_id: plan.plan_id });
        }

        self.issue_with_retry(desired_mode, now).await?;
        *self.last_issued.write().await = Some(LastIssued { mode: desired_mode, issued_ts: now });
        Ok(Some(desired_mode))
    }

    /// §4.8's SoC-maintenance override: during a weather plan's holding
    /// window, revert to HOME_UPS for the affected interval if SoC has
    /// fallen below capacity, even when the stored interval specifies
    /// HOME_III.
    fn resolve_desired_mode(
        &self,
        plan: &Plan,
        interval: &crate::domain::plan::IntervalProjection,
        snapshot: &TelemetrySnapshot,
        now: Timestamp,
    ) -> ModeKind {
        let in_holding = plan
            .context_summary
            .holding_window
            .as_ref()
            .map(|w| w.contains(&now))
            .unwrap_or(false);

        if plan.kind == PlanKind::Weather && in_holding && interval.mode == ModeKind::HomeIii {
            let soc_below_full = snapshot.soc.as_kwh() < snapshot.capacity.as_kwh() - 0.5;
            if soc_below_full {
                return ModeKind::HomeUps;
            }
        }

        interval.mode
    }

    async fn issue_with_retry(&self, mode: ModeKind, now: Timestamp) -> Result<(), CoreError> {
        let mut attempt = 0;
        loop {
            match self.telemetry.set_mode(mode, now).await {
                Ok(()) => {
                    info!(?mode, "executor issued mode command");
                    return Ok(());
                }
                Err(e) if attempt < 2 => {
                    attempt += 1;
                    warn!(?mode, attempt, error = %e, "mode command failed, retrying");
                    tokio::time::sleep(RETRY_SPACING).await;
                }
                Err(_) => {
                    warn!(?mode, "mode command failed after retries");
                    return Err(CoreError::ActuationFailed { command: format!("SetMode({mode})") });
                }
            }
        }
    }
}
