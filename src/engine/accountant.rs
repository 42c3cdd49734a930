//! Cycle accountant: per-level settlement, scenario classification and
//! record keeping for one betting cycle.
//!
//! A cycle is `OPEN` from its first level until a settlement closes it.
//! Every executed level produces exactly one `CycleRecord`; when the cycle
//! closes, its scenario is back-filled onto all of its rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::strategy::ladder::{StakeLadder, StakeLevel};
use crate::types::{CycleRecord, Direction, GaleError, Outcome, Scenario};

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// What the brokerage (or the simulator) reported for one level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Settlement {
    Settled { outcome: Outcome, profit: Decimal },
    /// No settlement was received (timeout or transport failure).
    Unknown,
}

impl Settlement {
    /// A settlement whose profit is derived from stake and payout.
    pub fn computed(outcome: Outcome, stake: Decimal, payout: Decimal, dp: u32) -> Self {
        Settlement::Settled {
            outcome,
            profit: outcome.signed_profit(stake, payout, dp),
        }
    }
}

/// Final account of a closed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub sequence_id: String,
    pub scenario: Scenario,
    /// Sum of the signed profit of every executed level.
    pub net_profit: Decimal,
    pub levels_executed: usize,
    /// Closed because a settlement never arrived.
    pub abandoned: bool,
}

/// What the caller should do after a settlement.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Bet the next ladder level.
    Advance { next_level: usize },
    /// Bet the same level again after a tie.
    Retry { level: usize },
    Closed(CycleSummary),
}

/// One settled level: the record that was appended and the next step.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelReport {
    pub record: CycleRecord,
    pub step: Step,
}

/// Transition of the cycle state machine, before any bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    Retry,
    Close(Scenario),
}

/// Scenario logic as a pure function of the level position and outcome.
///
/// `ties_used` is how many ties have already been retried at this level.
pub fn classify(level: usize, is_final: bool, outcome: Outcome, ties_used: u32, max_tie_retries: u32) -> Transition {
    match outcome {
        Outcome::Win if level == 0 => Transition::Close(Scenario::EntryWin),
        Outcome::Win => Transition::Close(Scenario::RecoveryWin),
        Outcome::Loss if is_final => Transition::Close(Scenario::TotalLoss),
        Outcome::Loss => Transition::Advance,
        Outcome::Tie if !is_final && ties_used < max_tie_retries => Transition::Retry,
        Outcome::Tie => Transition::Close(Scenario::Tie),
    }
}

/// Sequence id in the `YYYYmmdd_HHMMSS_xxxxxxxx` format used by the record store.
pub fn new_sequence_id(at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", at.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

/// Accounting state of one cycle.
#[derive(Debug, Clone)]
pub struct CycleAccountant {
    sequence_id: String,
    instrument: String,
    ladder: StakeLadder,
    max_tie_retries: u32,
    level: usize,
    ties_at_level: u32,
    net_profit: Decimal,
    records: Vec<CycleRecord>,
    closed: Option<CycleSummary>,
}

impl CycleAccountant {
    /// Open a new cycle over a computed ladder.
    pub fn open(
        sequence_id: impl Into<String>,
        instrument: impl Into<String>,
        ladder: StakeLadder,
        max_tie_retries: u32,
    ) -> Self {
        let sequence_id = sequence_id.into();
        let instrument = instrument.into();
        debug!(
            sequence_id = %sequence_id,
            instrument = %instrument,
            stakes = ?ladder.stakes(),
            "Cycle opened"
        );
        Self {
            sequence_id,
            instrument,
            ladder,
            max_tie_retries,
            level: 0,
            ties_at_level: 0,
            net_profit: Decimal::ZERO,
            records: Vec::new(),
            closed: None,
        }
    }

    pub fn sequence_id(&self) -> &str {
        &self.sequence_id
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn ladder(&self) -> &StakeLadder {
        &self.ladder
    }

    /// The level to bet next, or `None` once the cycle is closed.
    pub fn current_level(&self) -> Option<&StakeLevel> {
        if self.closed.is_some() {
            return None;
        }
        self.ladder.level(self.level)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn summary(&self) -> Option<&CycleSummary> {
        self.closed.as_ref()
    }

    /// Running sum of signed profits.
    pub fn net_profit(&self) -> Decimal {
        self.net_profit
    }

    pub fn records(&self) -> &[CycleRecord] {
        &self.records
    }

    /// Settle the current level.
    pub fn settle(
        &mut self,
        direction: Direction,
        settlement: Settlement,
        at: DateTime<Utc>,
    ) -> Result<LevelReport, GaleError> {
        if self.closed.is_some() {
            return Err(GaleError::CycleClosed {
                sequence_id: self.sequence_id.clone(),
            });
        }
        let level = self.ladder.level(self.level).cloned().ok_or_else(|| GaleError::CycleClosed {
            sequence_id: self.sequence_id.clone(),
        })?;

        // An unsettled level is booked as a full loss.
        let (outcome, profit, abandoned) = match settlement {
            Settlement::Settled { outcome, profit } => (outcome, profit, false),
            Settlement::Unknown => (Outcome::Loss, -level.stake, true),
        };

        self.net_profit += profit;
        self.records.push(CycleRecord {
            sequence_id: self.sequence_id.clone(),
            level_label: level.label,
            instrument: self.instrument.clone(),
            direction,
            stake: level.stake,
            outcome,
            signed_profit: profit,
            scenario: None,
            timestamp: at,
        });

        let transition = if abandoned {
            Transition::Close(Scenario::TotalLoss)
        } else {
            classify(
                self.level,
                self.ladder.is_final(self.level),
                outcome,
                self.ties_at_level,
                self.max_tie_retries,
            )
        };

        let step = match transition {
            Transition::Advance => {
                self.level += 1;
                self.ties_at_level = 0;
                debug!(
                    sequence_id = %self.sequence_id,
                    next_level = self.level,
                    running = %self.net_profit,
                    "Level lost, advancing"
                );
                Step::Advance { next_level: self.level }
            }
            Transition::Retry => {
                self.ties_at_level += 1;
                debug!(
                    sequence_id = %self.sequence_id,
                    level = self.level,
                    retries = self.ties_at_level,
                    "Tie, retrying level"
                );
                Step::Retry { level: self.level }
            }
            Transition::Close(scenario) => Step::Closed(self.close(scenario, abandoned)),
        };

        let record = self.records.last().cloned().ok_or_else(|| GaleError::CycleClosed {
            sequence_id: self.sequence_id.clone(),
        })?;

        Ok(LevelReport { record, step })
    }

    fn close(&mut self, scenario: Scenario, abandoned: bool) -> CycleSummary {
        for record in &mut self.records {
            record.scenario = Some(scenario);
        }

        let summary = CycleSummary {
            sequence_id: self.sequence_id.clone(),
            scenario,
            net_profit: self.net_profit,
            levels_executed: self.records.len(),
            abandoned,
        };

        if scenario == Scenario::TotalLoss {
            warn!(
                sequence_id = %summary.sequence_id,
                instrument = %self.instrument,
                net = %summary.net_profit,
                levels = summary.levels_executed,
                abandoned,
                "Cycle closed: total loss"
            );
        } else {
            info!(
                sequence_id = %summary.sequence_id,
                instrument = %self.instrument,
                scenario = %scenario,
                net = %summary.net_profit,
                levels = summary.levels_executed,
                "Cycle closed"
            );
        }

        self.closed = Some(summary.clone());
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
