//! Service Shield (C10): suspends executor writes when an external actor
//! (the vendor mobile app) changes the inverter mode outside the active
//! plan (§4.10).
//!
//! Grounded in the teacher's `controller::safety_monitor::SafetyMonitor`:
//! a state machine plus a `tokio::sync::RwLock`-guarded state struct,
//! generalized from continuous physical-limit checks to a TTL-pruned
//! command-announcement queue (teacher's `state_history: VecDeque<...>`
//! ring buffer, bounded by time instead of capacity here).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::plan::CommandParams;
use crate::domain::telemetry::ModeKind;
use crate::domain::types::Timestamp;

const DEFAULT_QUEUE_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShieldState {
    Normal,
    Suspended,
}

struct Inner {
    state: ShieldState,
    suspended_until: Option<Timestamp>,
    overridden_plan_id: Option<Uuid>,
    queue: VecDeque<(CommandParams, Timestamp)>,
}

/// Guards executor writes per §4.10. `shield_timeout` is the suspension
/// duration (default 15 min, configurable 5-60 min); `queue_ttl` bounds how
/// long an announced command is considered "recently issued" when matching
/// against an observed telemetry change (default 60s per §4.10).
pub struct ServiceShield {
    shield_timeout: Duration,
    queue_ttl: Duration,
    inner: RwLock<Inner>,
}

impl ServiceShield {
    pub fn new(shield_timeout: Duration) -> Self {
        Self {
            shield_timeout,
            queue_ttl: Duration::from_secs(DEFAULT_QUEUE_TTL_SECS as u64),
            inner: RwLock::new(Inner {
                state: ShieldState::Normal,
                suspended_until: None,
                overridden_plan_id: None,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Every C1 write registers here before issuance (§4.1, §4.10).
    pub async fn announce(&self, command: CommandParams, issued_ts: Timestamp) {
        let mut inner = self.inner.write().await;
        inner.queue.push_back((command, issued_ts));
        prune(&mut inner.queue, issued_ts, self.queue_ttl);
    }

    /// True if `normal` and the executor may issue commands this tick.
    pub async fn is_writable(&self, now: Timestamp) -> bool {
        let mut inner = self.inner.write().await;
        self.maybe_release(&mut inner, now);
        inner.state == ShieldState::Normal
    }

    /// Called by the executor when telemetry shows a mode change it did not
    /// request within `queue_ttl`. If the change is explained by a recently
    /// announced command, it's a no-op (expected reconciliation); otherwise
    /// the shield suspends for `shield_timeout` (§4.10, scenario 5).
    pub async fn observe_unexpected_mode(
        &self,
        observed_mode: ModeKind,
        now: Timestamp,
        active_plan_id: Option<Uuid>,
    ) {
        let mut inner = self.inner.write().await;
        prune(&mut inner.queue, now, self.queue_ttl);

        let explained = inner.queue.iter().any(|(cmd, _)| {
            matches!(cmd, CommandParams::SetMode { mode } if *mode == observed_mode)
        });
        if explained {
            return;
        }

        if inner.state == ShieldState::Normal {
            warn!(?observed_mode, "external override detected, suspending executor writes");
            inner.state = ShieldState::Suspended;
            inner.suspended_until = Some(now.add_minutes((self.shield_timeout.as_secs() / 60) as i64));
            inner.overridden_plan_id = active_plan_id;
        }
    }

    /// Convergence release: telemetry mode matches the plan again (§4.10).
    pub async fn observe_converged(&self, now: Timestamp) {
        let mut inner = self.inner.write().await;
        if inner.state == ShieldState::Suspended {
            info!("telemetry converged to planned mode, releasing service shield");
            self.release(&mut inner, now);
        }
    }

    pub async fn state(&self) -> ShieldState {
        self.inner.read().await.state
    }

    pub async fn overridden_plan_id(&self) -> Option<Uuid> {
        self.inner.read().await.overridden_plan_id
    }

    fn maybe_release(&self, inner: &mut Inner, now: Timestamp) {
        if inner.state == ShieldState::Suspended {
            if let Some(until) = inner.suspended_until {
                if !now.is_before(&until) {
                    info!("service shield suspension timed out, releasing");
                    self.release(inner, now);
                }
            }
        }
    }

    fn release(&self, inner: &mut Inner, _now: Timestamp) {
        inner.state = ShieldState::Normal;
        inner.suspended_until = None;
        inner.overridden_plan_id = None;
    }
}

fn prune(queue: &mut VecDeque<(CommandParams, Timestamp)>, now: Timestamp, ttl: Duration) {
    while let Some((_, ts)) = queue.front() {
        if now.duration_since(ts).num_seconds() > ttl.as_secs() as i64 {
            queue.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_normal_and_writable() {
        let shield = ServiceShield::new(Duration::from_secs(900));
        assert_eq!(shield.state().await, ShieldState::Normal);
        assert!(shield.is_writable(Timestamp::now()).await);
    }

    #[tokio::test]
    async fn unexplained_mode_change_suspends() {
        let shield = ServiceShield::new(Duration::from_secs(900));
        let now = Timestamp::now();
        shield.observe_unexpected_mode(ModeKind::HomeIi, now, None).await;
        assert_eq!(shield.state().await, ShieldState::Suspended);
        assert!(!shield.is_writable(now).await);
    }

    #[tokio::test]
    async fn announced_command_does_not_suspend() {
        let shield = ServiceShield::new(Duration::from_secs(900));
        let now = Timestamp::now();
        shield
            .announce(CommandParams::SetMode { mode: ModeKind::HomeI }, now)
            .await;
        shield.observe_unexpected_mode(ModeKind::HomeI, now, None).await;
        assert_eq!(shield.state().await, ShieldState::Normal);
    }

    #[tokio::test]
    async fn suspension_releases_after_timeout() {
        let shield = ServiceShield::new(Duration::from_secs(900)); // 15 min, rounds to 15
        let now = Timestamp::now();
        shield.observe_unexpected_mode(ModeKind::HomeIi, now, None).await;
        assert!(!shield.is_writable(now.add_minutes(5)).await);
        assert!(shield.is_writable(now.add_minutes(16)).await);
        assert_eq!(shield.state().await, ShieldState::Normal);
    }

    #[tokio::test]
    async fn convergence_releases_suspension() {
        let shield = ServiceShield::new(Duration::from_secs(900));
        let now = Timestamp::now();
        shield.observe_unexpected_mode(ModeKind::HomeIi, now, None).await;
        shield.observe_converged(now.add_minutes(1)).await;
        assert_eq!(shield.state().await, ShieldState::Normal);
    }
}
