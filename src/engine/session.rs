//! Live session runner.
//!
//! Drives one betting cycle at a time through a `Brokerage`:
//! protection check → ladder → bet each level → record the settlement →
//! resync the balance. Everything is sequential inside one task; the only
//! suspension points are the bar-boundary wait and settlement.
//!
//! A settlement that times out or fails in transport becomes an unknown
//! outcome: the cycle is abandoned as a total loss and the broker is asked
//! to reconnect. The bet itself is never re-placed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::Brokerage;
use crate::engine::accountant::{new_sequence_id, CycleAccountant, CycleSummary, Settlement, Step};
use crate::storage::{AlertKind, AlertSink, RecordStore};
use crate::strategy::guard::{GuardConfig, ProtectionGuard, Verdict};
use crate::strategy::ladder::{LadderSpec, StakeLadder};
use crate::types::{CycleRecord, Direction, GaleError, Scenario};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ladder: LadderSpec,
    /// Replace the correction factor with `1 / payout`.
    pub full_correction: bool,
    pub max_tie_retries: u32,
    /// Option expiry, also the bar period used for alignment.
    pub bet_duration_secs: u64,
    pub settle_timeout: Duration,
    pub reconnect_attempts: u32,
    /// Wait for the next bar boundary before the entry bet.
    pub align_to_bar: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ladder: LadderSpec::default(),
            full_correction: false,
            max_tie_retries: 1,
            bet_duration_secs: 300,
            settle_timeout: Duration::from_secs(900),
            reconnect_attempts: 3,
            align_to_bar: true,
        }
    }
}

impl SessionConfig {
    /// Ladder parameters with the correction option applied.
    pub fn effective_ladder(&self) -> LadderSpec {
        let mut spec = self.ladder.clone();
        if self.full_correction {
            spec.correction_factor = LadderSpec::full_correction(spec.payout);
        }
        spec
    }
}

/// Time until the next multiple of `period_secs` since the epoch.
pub fn delay_to_boundary(now: DateTime<Utc>, period_secs: u64) -> Duration {
    if period_secs == 0 {
        return Duration::ZERO;
    }
    let period_ms = period_secs as i64 * 1000;
    let into_period = now.timestamp_millis().rem_euclid(period_ms);
    if into_period == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((period_ms - into_period) as u64)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The guard refused to start a cycle.
    Blocked(Verdict),
    Completed(CycleSummary),
    /// Cancellation was observed. The cycle (if any) stays open.
    Cancelled {
        sequence_id: Option<String>,
        levels_executed: usize,
        net_profit: Decimal,
    },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session<B: Brokerage, S: RecordStore> {
    broker: Arc<B>,
    store: S,
    alerts: Arc<dyn AlertSink>,
    guard: ProtectionGuard,
    config: SessionConfig,
    cancel: Arc<AtomicBool>,
    history: Vec<CycleRecord>,
}

impl<B: Brokerage, S: RecordStore> Session<B, S> {
    pub fn new(
        broker: Arc<B>,
        store: S,
        alerts: Arc<dyn AlertSink>,
        guard_config: GuardConfig,
        config: SessionConfig,
        initial_balance: Decimal,
    ) -> Result<Self, GaleError> {
        StakeLadder::build(config.effective_ladder())?;
        Ok(Self {
            broker,
            store,
            alerts,
            guard: ProtectionGuard::new(guard_config, initial_balance),
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            history: Vec::new(),
        })
    }

    /// Flag that stops the session at the next level boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn guard(&self) -> &ProtectionGuard {
        &self.guard
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Records of cycles run in this session.
    pub fn history(&self) -> &[CycleRecord] {
        &self.history
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Pin the reference balance from the broker.
    pub async fn start(&mut self) -> Result<Decimal> {
        let balance = self
            .broker
            .get_balance()
            .await
            .context("Failed to fetch starting balance")?;
        self.guard.synchronize(balance);
        info!(
            balance = %balance,
            stakes = ?StakeLadder::build(self.config.effective_ladder()).map(|l| l.stakes()).unwrap_or_default(),
            "Session started"
        );
        Ok(balance)
    }

    /// Clear a guard block.
    pub fn unblock(&mut self) {
        self.guard.unblock(self.alerts.as_ref());
    }

    /// Run one full cycle in `direction` on `instrument`.
    pub async fn run_cycle(&mut self, instrument: &str, direction: Direction) -> Result<CycleOutcome> {
        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled {
                sequence_id: None,
                levels_executed: 0,
                net_profit: Decimal::ZERO,
            });
        }

        let verdict = self.guard.check(&self.history, self.alerts.as_ref());
        if !verdict.allowed {
            info!(
                reason = verdict.reason.map(|r| r.label()).unwrap_or("blocked"),
                "Cycle refused by protection guard"
            );
            return Ok(CycleOutcome::Blocked(verdict));
        }

        let ladder = StakeLadder::build(self.config.effective_ladder())?;
        if verdict.metrics.balance < ladder.total_loss_if_all_lost() {
            warn!(
                balance = %verdict.metrics.balance,
                at_risk = %ladder.total_loss_if_all_lost(),
                "Balance cannot cover a full ladder"
            );
            self.alerts.log_alert(
                AlertKind::Warning,
                "Balance below full ladder exposure",
                serde_json::json!({
                    "balance": verdict.metrics.balance,
                    "total_loss_if_all_lost": ladder.total_loss_if_all_lost(),
                }),
            );
        }

        if self.config.align_to_bar {
            let wait = delay_to_boundary(Utc::now(), self.config.bet_duration_secs);
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for bar boundary");
            tokio::time::sleep(wait).await;
        }

        let sequence_id = new_sequence_id(Utc::now());
        let mut cycle = CycleAccountant::open(
            sequence_id.clone(),
            instrument,
            ladder,
            self.config.max_tie_retries,
        );
        info!(
            sequence_id = %sequence_id,
            instrument,
            direction = %direction,
            stakes = ?cycle.ladder().stakes(),
            "Cycle started"
        );

        loop {
            let Some(level) = cycle.current_level().cloned() else {
                // Closed cycles return below; an exhausted ladder cannot happen.
                return Err(GaleError::CycleClosed { sequence_id }.into());
            };

            let settlement = self.place(instrument, direction, level.stake).await;
            let report = cycle.settle(direction, settlement, Utc::now())?;

            // In-memory history stays authoritative for the guard even if the store is down.
            if let Err(e) = self.store.append(&report.record) {
                self.storage_failed("append", &sequence_id, &e);
            }
            self.history.push(report.record);
            self.resync().await;

            match report.step {
                Step::Closed(summary) => {
                    self.finish(&summary);
                    return Ok(CycleOutcome::Completed(summary));
                }
                Step::Advance { .. } | Step::Retry { .. } => {
                    if self.cancelled() {
                        warn!(
                            sequence_id = %sequence_id,
                            levels = cycle.records().len(),
                            running = %cycle.net_profit(),
                            "Cancelled between levels; cycle left open"
                        );
                        return Ok(CycleOutcome::Cancelled {
                            sequence_id: Some(sequence_id),
                            levels_executed: cycle.records().len(),
                            net_profit: cycle.net_profit(),
                        });
                    }
                }
            }
        }
    }

    fn finish(&mut self, summary: &CycleSummary) {
        for record in self
            .history
            .iter_mut()
            .filter(|r| r.sequence_id == summary.sequence_id)
        {
            record.scenario = Some(summary.scenario);
        }

        self.guard.record_completed_cycle(summary);

        if summary.scenario == Scenario::TotalLoss {
            self.alerts.log_alert(
                AlertKind::TotalLoss,
                &format!("Cycle {} closed as total loss", summary.sequence_id),
                serde_json::to_value(summary).unwrap_or_default(),
            );
        }

        if let Err(e) = self.store.tag_scenario(&summary.sequence_id, summary.scenario) {
            self.storage_failed("tag_scenario", &summary.sequence_id, &e);
        }
    }

    fn storage_failed(&self, operation: &str, sequence_id: &str, e: &anyhow::Error) {
        error!(operation, sequence_id, error = %e, "Record store failed; continuing from memory");
        self.alerts.log_alert(
            AlertKind::Warning,
            "Record store failure",
            serde_json::json!({
                "operation": operation,
                "sequence_id": sequence_id,
                "error": format!("{e:#}"),
            }),
        );
    }

    /// Place one bet and wait for it, converting failures to `Unknown`.
    async fn place(&self, instrument: &str, direction: Direction, stake: Decimal) -> Settlement {
        let fut = self
            .broker
            .place_and_await(instrument, direction, stake, self.config.bet_duration_secs);

        match tokio::time::timeout(self.config.settle_timeout, fut).await {
            Ok(Ok(trade)) => {
                debug!(
                    instrument,
                    stake = %stake,
                    outcome = %trade.outcome,
                    profit = %trade.profit,
                    "Level settled"
                );
                Settlement::Settled {
                    outcome: trade.outcome,
                    profit: trade.profit,
                }
            }
            Ok(Err(e)) => {
                error!(instrument, stake = %stake, error = %e, "Bet failed; outcome unknown");
                self.reconnect().await;
                Settlement::Unknown
            }
            Err(_) => {
                error!(
                    instrument,
                    stake = %stake,
                    timeout_secs = self.config.settle_timeout.as_secs_f64(),
                    "Settlement timed out; outcome unknown"
                );
                self.reconnect().await;
                Settlement::Unknown
            }
        }
    }

    async fn reconnect(&self) {
        for attempt in 1..=self.config.reconnect_attempts {
            match self.broker.reconnect().await {
                Ok(()) => {
                    info!(attempt, "Broker reconnected");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
            }
        }
        if self.config.reconnect_attempts > 0 {
            error!(attempts = self.config.reconnect_attempts, "Giving up on reconnect");
        }
    }

    async fn resync(&mut self) {
        match self.broker.get_balance().await {
            Ok(balance) => self.guard.synchronize(balance),
            Err(e) => warn!(error = %e, "Balance resync failed; using history-derived balance"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
