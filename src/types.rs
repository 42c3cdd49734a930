//! Shared types for the GALE engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that strategy, engine, backtest
//! and storage modules can depend on them without circular references.
//! `CycleRecord` is the persisted schema; downstream reporting reads it,
//! so its field names and encodings must not drift.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Price bars
// ---------------------------------------------------------------------------

/// A single historical price bar (oldest→newest ordering is assumed
/// wherever a slice of bars is passed around).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, unix seconds.
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Bar {
    /// A flat bar where every price equals `close`. Handy for synthetic series.
    pub fn flat(time: i64, close: Decimal) -> Self {
        Self {
            time,
            open: close,
            high: close,
            low: close,
            close,
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Bet direction on a binary option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    /// The opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Call => Direction::Put,
            Direction::Put => Direction::Call,
        }
    }

    /// Settle this direction against a pair of closes.
    ///
    /// `Call` wins when the exit close is above the entry close, `Put` when it
    /// is below; equal closes are a tie for either direction.
    pub fn settle(&self, entry_close: Decimal, exit_close: Decimal) -> Outcome {
        if exit_close == entry_close {
            return Outcome::Tie;
        }
        let rose = exit_close > entry_close;
        match (self, rose) {
            (Direction::Call, true) | (Direction::Put, false) => Outcome::Win,
            _ => Outcome::Loss,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Call => write!(f, "CALL"),
            Direction::Put => write!(f, "PUT"),
        }
    }
}

/// Attempt to parse a string into a Direction (case-insensitive).
impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "call" | "up" | "buy" => Ok(Direction::Call),
            "put" | "down" | "sell" => Ok(Direction::Put),
            _ => Err(anyhow::anyhow!("Unknown direction: {s}")),
        }
    }
}

/// Settlement result of a single bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Win,
    Loss,
    /// Equal open/close at expiry: the stake is refunded.
    Tie,
}

impl Outcome {
    /// Signed profit of a bet with this outcome, given stake and payout.
    ///
    /// Wins are rounded to `dp` decimal places (the currency minor unit).
    pub fn signed_profit(&self, stake: Decimal, payout: Decimal, dp: u32) -> Decimal {
        match self {
            Outcome::Win => crate::strategy::ladder::round_money(stake * payout, dp),
            Outcome::Loss => -stake,
            Outcome::Tie => Decimal::ZERO,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Win => write!(f, "WIN"),
            Outcome::Loss => write!(f, "LOSS"),
            Outcome::Tie => write!(f, "TIE"),
        }
    }
}

/// Classification of a finished cycle. Encoded as 0–3 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Scenario {
    /// Cycle ended on a tie.
    Tie = 0,
    /// Won on the entry bet.
    EntryWin = 1,
    /// Won on a recovery level.
    RecoveryWin = 2,
    /// Lost every level (or abandoned with an unknown outcome).
    TotalLoss = 3,
}

impl Scenario {
    pub const ALL: &'static [Scenario] = &[
        Scenario::Tie,
        Scenario::EntryWin,
        Scenario::RecoveryWin,
        Scenario::TotalLoss,
    ];

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl From<Scenario> for u8 {
    fn from(s: Scenario) -> u8 {
        s.code()
    }
}

impl TryFrom<u8> for Scenario {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Scenario::Tie),
            1 => Ok(Scenario::EntryWin),
            2 => Ok(Scenario::RecoveryWin),
            3 => Ok(Scenario::TotalLoss),
            other => Err(format!("invalid scenario code: {other}")),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scenario::Tie => write!(f, "C0 (tie)"),
            Scenario::EntryWin => write!(f, "C1 (entry win)"),
            Scenario::RecoveryWin => write!(f, "C2 (recovery win)"),
            Scenario::TotalLoss => write!(f, "C3 (total loss)"),
        }
    }
}

/// Position of a bet within a ladder: the entry or the N-th recovery.
/// Serialized as `"entry"` / `"recovery-N"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LevelLabel {
    Entry,
    Recovery(u32),
}

impl LevelLabel {
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            LevelLabel::Entry
        } else {
            LevelLabel::Recovery(index as u32)
        }
    }

    pub fn index(&self) -> usize {
        match self {
            LevelLabel::Entry => 0,
            LevelLabel::Recovery(n) => *n as usize,
        }
    }
}

impl fmt::Display for LevelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelLabel::Entry => write!(f, "entry"),
            LevelLabel::Recovery(n) => write!(f, "recovery-{n}"),
        }
    }
}

impl From<LevelLabel> for String {
    fn from(label: LevelLabel) -> String {
        label.to_string()
    }
}

impl TryFrom<String> for LevelLabel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "entry" {
            return Ok(LevelLabel::Entry);
        }
        value
            .strip_prefix("recovery-")
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .map(LevelLabel::Recovery)
            .ok_or_else(|| format!("invalid level label: {value}"))
    }
}

// ---------------------------------------------------------------------------
// Cycle records
// ---------------------------------------------------------------------------

/// One executed level of a betting cycle, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Groups every level of one staircase.
    pub sequence_id: String,
    pub level_label: LevelLabel,
    pub instrument: String,
    pub direction: Direction,
    pub stake: Decimal,
    pub outcome: Outcome,
    pub signed_profit: Decimal,
    /// `None` while the owning cycle is still open.
    pub scenario: Option<Scenario>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for CycleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.signed_profit >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "[{}] {} {} {} stake={:.2} {} {sign}{:.2}",
            self.sequence_id,
            self.level_label,
            self.instrument,
            self.direction,
            self.stake,
            self.outcome,
            self.signed_profit,
        )?;
        if let Some(scenario) = self.scenario {
            write!(f, " {scenario}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for GALE.
#[derive(Debug, thiserror::Error)]
pub enum GaleError {
    #[error("Invalid base stake: {0} (must be > 0)")]
    InvalidStake(Decimal),

    #[error("Invalid payout: {0} (must be in (0, 1])")]
    InvalidPayout(Decimal),

    #[error("Invalid level count: {0} (must be >= 1)")]
    InvalidLevels(usize),

    #[error("Invalid correction factor: {0} (must be >= 0)")]
    InvalidCorrection(Decimal),

    #[error("Ladder stakes overflow at level {level}")]
    LadderOverflow { level: usize },

    #[error("Cycle {sequence_id} is already closed")]
    CycleClosed { sequence_id: String },

    #[error("Reference balance already fixed at {reference:.2} for this session")]
    ReferenceAlreadyFixed { reference: Decimal },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
