//! Session protection guard.
//!
//! Decides whether a new betting cycle may start. Evaluation is a pure
//! function of the configuration, an explicit `ProtectionState` and the
//! session's `CycleRecord` history; `ProtectionGuard` wraps it with the
//! latch/alert/unblock lifecycle.
//!
//! Blocking conditions are checked in a fixed order and the first match wins:
//! stop-loss percent, stop-loss absolute, take-profit, loss streak,
//! clustered total losses, session operation limit.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

use crate::engine::accountant::CycleSummary;
use crate::storage::{AlertKind, AlertSink};
use crate::types::{CycleRecord, GaleError, Outcome, Scenario};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Guard thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Block when the session loss reaches this percentage of the reference.
    pub stop_loss_pct: Decimal,
    /// Block when the session loss reaches this amount.
    pub stop_loss_abs: Option<Decimal>,
    /// Block when the session profit reaches this amount.
    pub take_profit_abs: Option<Decimal>,
    /// Block after this many consecutive losing bets.
    pub max_loss_streak: usize,
    /// Distinct total-loss cycles needed for the cluster rule.
    pub cluster_min_total_losses: usize,
    /// Loss percentage that must be exceeded for the cluster rule to fire.
    pub cluster_min_loss_pct: Decimal,
    /// Completed cycles allowed per session.
    pub max_ops_per_session: Option<u64>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(20),
            stop_loss_abs: None,
            take_profit_abs: None,
            max_loss_streak: 5,
            cluster_min_total_losses: 3,
            cluster_min_loss_pct: dec!(10),
            max_ops_per_session: Some(50),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Whether the session reference balance has been pinned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePhase {
    /// Reference is the configured starting balance; the first sync replaces it.
    Provisional,
    /// Reference is pinned for the rest of the session.
    Fixed,
}

/// Why the guard blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    StopLossPercent,
    StopLossAbsolute,
    TakeProfit,
    LossStreak,
    ClusteredTotalLosses,
    SessionLimit,
}

impl BlockReason {
    pub fn label(&self) -> &'static str {
        match self {
            BlockReason::StopLossPercent => "stop-loss percent",
            BlockReason::StopLossAbsolute => "stop-loss absolute",
            BlockReason::TakeProfit => "take-profit",
            BlockReason::LossStreak => "loss streak",
            BlockReason::ClusteredTotalLosses => "clustered catastrophic losses",
            BlockReason::SessionLimit => "session limit",
        }
    }

    fn alert_kind(&self) -> AlertKind {
        match self {
            BlockReason::StopLossPercent | BlockReason::StopLossAbsolute => AlertKind::StopLoss,
            BlockReason::TakeProfit => AlertKind::Info,
            BlockReason::LossStreak => AlertKind::LossStreak,
            BlockReason::ClusteredTotalLosses => AlertKind::TotalLoss,
            BlockReason::SessionLimit => AlertKind::Warning,
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-session guard counters. Owned by one session; never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionState {
    pub reference_balance: Decimal,
    pub phase: ReferencePhase,
    /// Authoritative balance; `None` means derive it from history.
    pub current_balance: Option<Decimal>,
    pub ops_this_session: u64,
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
}

impl ProtectionState {
    /// Fresh state with a provisional reference balance.
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            reference_balance: initial_balance,
            phase: ReferencePhase::Provisional,
            current_balance: None,
            ops_this_session: 0,
            blocked: false,
            block_reason: None,
        }
    }

    /// Current balance: the authoritative figure if one was synced,
    /// else the reference plus the signed profit of every record.
    pub fn effective_balance(&self, history: &[CycleRecord]) -> Decimal {
        self.current_balance.unwrap_or_else(|| {
            self.reference_balance + history.iter().map(|r| r.signed_profit).sum::<Decimal>()
        })
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Snapshot of the numbers the guard looked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub balance: Decimal,
    pub reference_balance: Decimal,
    /// Session loss as a percentage of the reference, floored at 0.
    pub loss_pct: Decimal,
    /// Balance minus reference (negative when losing).
    pub profit: Decimal,
    pub loss_streak: usize,
    /// Distinct cycles that closed as a total loss.
    pub total_loss_cycles: usize,
    pub ops_this_session: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<BlockReason>,
    pub metrics: RiskMetrics,
}

// ---------------------------------------------------------------------------
// Pure evaluation
// ---------------------------------------------------------------------------

/// Consecutive losing bets at the tail of `history`. Ties are skipped,
/// a win ends the scan.
pub fn loss_streak(history: &[CycleRecord]) -> usize {
    let mut streak = 0;
    for record in history.iter().rev() {
        match record.outcome {
            Outcome::Loss => streak += 1,
            Outcome::Tie => continue,
            Outcome::Win => break,
        }
    }
    streak
}

/// Number of distinct sequences tagged as total loss.
pub fn total_loss_cycles(history: &[CycleRecord]) -> usize {
    history
        .iter()
        .filter(|r| r.scenario == Some(Scenario::TotalLoss))
        .map(|r| r.sequence_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

/// Compute the metrics the guard decides on.
pub fn metrics(state: &ProtectionState, history: &[CycleRecord]) -> RiskMetrics {
    let balance = state.effective_balance(history);
    let reference = state.reference_balance;
    let loss_pct = if reference > Decimal::ZERO {
        ((reference - balance) / reference * dec!(100)).max(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };

    RiskMetrics {
        balance,
        reference_balance: reference,
        loss_pct,
        profit: balance - reference,
        loss_streak: loss_streak(history),
        total_loss_cycles: total_loss_cycles(history),
        ops_this_session: state.ops_this_session,
    }
}

/// Decide whether a new cycle may start. Never mutates anything.
pub fn evaluate(config: &GuardConfig, state: &ProtectionState, history: &[CycleRecord]) -> Verdict {
    let m = metrics(state, history);

    if state.blocked {
        return Verdict {
            allowed: false,
            reason: state.block_reason,
            metrics: m,
        };
    }

    let reason = first_violation(config, &m);
    Verdict {
        allowed: reason.is_none(),
        reason,
        metrics: m,
    }
}

fn first_violation(config: &GuardConfig, m: &RiskMetrics) -> Option<BlockReason> {
    let drawdown = m.reference_balance - m.balance;

    if m.loss_pct >= config.stop_loss_pct {
        return Some(BlockReason::StopLossPercent);
    }
    if let Some(limit) = config.stop_loss_abs {
        if drawdown >= limit {
            return Some(BlockReason::StopLossAbsolute);
        }
    }
    if let Some(target) = config.take_profit_abs {
        if m.profit >= target {
            return Some(BlockReason::TakeProfit);
        }
    }
    if m.loss_streak >= config.max_loss_streak {
        return Some(BlockReason::LossStreak);
    }
    if m.total_loss_cycles >= config.cluster_min_total_losses && m.loss_pct > config.cluster_min_loss_pct {
        return Some(BlockReason::ClusteredTotalLosses);
    }
    if let Some(max_ops) = config.max_ops_per_session {
        if m.ops_this_session >= max_ops {
            return Some(BlockReason::SessionLimit);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Stateful guard for one session.
#[derive(Debug, Clone)]
pub struct ProtectionGuard {
    config: GuardConfig,
    state: ProtectionState,
}

impl ProtectionGuard {
    pub fn new(config: GuardConfig, initial_balance: Decimal) -> Self {
        Self {
            config,
            state: ProtectionState::new(initial_balance),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn state(&self) -> &ProtectionState {
        &self.state
    }

    pub fn is_blocked(&self) -> bool {
        self.state.blocked
    }

    /// Feed an authoritative balance. The first call pins the reference.
    pub fn synchronize(&mut self, balance: Decimal) {
        if self.state.phase == ReferencePhase::Provisional {
            self.state.reference_balance = balance;
            self.state.phase = ReferencePhase::Fixed;
            info!(reference = %balance, "Session reference balance fixed");
        }
        self.state.current_balance = Some(balance);
    }

    /// Pin the reference explicitly. Rejected once the reference is fixed.
    pub fn fix_reference(&mut self, balance: Decimal) -> Result<(), GaleError> {
        if self.state.phase == ReferencePhase::Fixed {
            return Err(GaleError::ReferenceAlreadyFixed {
                reference: self.state.reference_balance,
            });
        }
        self.state.reference_balance = balance;
        self.state.phase = ReferencePhase::Fixed;
        info!(reference = %balance, "Session reference balance fixed");
        Ok(())
    }

    /// Count a finished cycle against the session limit.
    pub fn record_completed_cycle(&mut self, summary: &CycleSummary) {
        self.state.ops_this_session += 1;
        if summary.scenario == Scenario::TotalLoss {
            warn!(
                sequence_id = %summary.sequence_id,
                net = %summary.net_profit,
                ops = self.state.ops_this_session,
                "Total-loss cycle recorded"
            );
        }
    }

    /// Evaluate, latch a block, and alert on the transition to blocked.
    pub fn check(&mut self, history: &[CycleRecord], alerts: &dyn AlertSink) -> Verdict {
        let verdict = evaluate(&self.config, &self.state, history);

        if !verdict.allowed && !self.state.blocked {
            self.state.blocked = true;
            self.state.block_reason = verdict.reason;

            if let Some(reason) = verdict.reason {
                let m = &verdict.metrics;
                warn!(
                    reason = %reason,
                    balance = %m.balance,
                    loss_pct = %m.loss_pct.round_dp(2),
                    streak = m.loss_streak,
                    total_losses = m.total_loss_cycles,
                    ops = m.ops_this_session,
                    "Protection guard blocked the session"
                );
                alerts.log_alert(
                    reason.alert_kind(),
                    &format!("Session blocked: {reason}"),
                    serde_json::to_value(m).unwrap_or_default(),
                );
            }
        }

        verdict
    }

    /// Manual unblock. Clears the latch and the op counter only.
    pub fn unblock(&mut self, alerts: &dyn AlertSink) {
        let previous = self.state.block_reason.take();
        self.state.blocked = false;
        self.state.ops_this_session = 0;

        info!(previous = ?previous.map(|r| r.label()), "Protection guard unblocked");
        alerts.log_alert(
            AlertKind::Info,
            "Session manually unblocked",
            serde_json::json!({ "previous_reason": previous.map(|r| r.label()) }),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
