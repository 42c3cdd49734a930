//! History analysis.
//!
//! Summarises persisted cycle records and turns a recent window of them
//! into a `Continue` / `Adjust` / `Pause` recommendation. Purely local:
//! hit rate, total losses, a two-half trend and a last-five momentum.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::backtest::runner::ScenarioCounts;
use crate::types::{CycleRecord, Outcome, Scenario};

fn hit_rate(wins: usize, losses: usize) -> f64 {
    if wins + losses == 0 {
        0.0
    } else {
        wins as f64 / (wins + losses) as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub bets: usize,
    pub wins: usize,
    pub losses: usize,
    pub profit: Decimal,
}

impl BucketStats {
    fn add(&mut self, record: &CycleRecord) {
        self.bets += 1;
        match record.outcome {
            Outcome::Win => self.wins += 1,
            Outcome::Loss => self.losses += 1,
            Outcome::Tie => {}
        }
        self.profit += record.signed_profit;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub bets: usize,
    pub wins: usize,
    pub losses: usize,
    pub ties: usize,
    pub hit_rate: f64,
    pub total_profit: Decimal,
    pub gross_won: Decimal,
    pub gross_lost: Decimal,
    /// Closed cycles by scenario, counted once per sequence.
    pub cycles: ScenarioCounts,
    /// Net result of every total-loss cycle.
    pub total_loss_amount: Decimal,
    pub by_instrument: BTreeMap<String, BucketStats>,
    pub by_level: BTreeMap<String, BucketStats>,
    pub longest_win_streak: usize,
    pub longest_loss_streak: usize,
}

pub fn summarize(records: &[CycleRecord]) -> HistorySummary {
    let mut s = HistorySummary::default();
    let mut seen_sequences = HashSet::new();
    let (mut win_run, mut loss_run) = (0, 0);

    for r in records {
        s.bets += 1;
        s.total_profit += r.signed_profit;
        match r.outcome {
            Outcome::Win => {
                s.wins += 1;
                s.gross_won += r.signed_profit;
                win_run += 1;
                loss_run = 0;
                s.longest_win_streak = s.longest_win_streak.max(win_run);
            }
            Outcome::Loss => {
                s.losses += 1;
                s.gross_lost += r.signed_profit;
                loss_run += 1;
                win_run = 0;
                s.longest_loss_streak = s.longest_loss_streak.max(loss_run);
            }
            Outcome::Tie => s.ties += 1,
        }

        if let Some(scenario) = r.scenario {
            if seen_sequences.insert(r.sequence_id.as_str()) {
                s.cycles.add(scenario);
            }
            if scenario == Scenario::TotalLoss {
                s.total_loss_amount += r.signed_profit;
            }
        }

        s.by_instrument.entry(r.instrument.clone()).or_default().add(r);
        s.by_level.entry(r.level_label.to_string()).or_default().add(r);
    }

    s.hit_rate = hit_rate(s.wins, s.losses);
    s
}

// ---------------------------------------------------------------------------
// Trend and momentum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Sideways,
    /// Fewer than six bets.
    Undetermined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// 0–5.
    pub strength: f64,
    pub momentum: Momentum,
    pub first_half_hit_rate: f64,
    pub second_half_hit_rate: f64,
    pub first_half_profit: Decimal,
    pub second_half_profit: Decimal,
}

fn win_share(records: &[CycleRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().filter(|r| r.outcome == Outcome::Win).count() as f64 / records.len() as f64 * 100.0
}

fn profit(records: &[CycleRecord]) -> Decimal {
    records.iter().map(|r| r.signed_profit).sum()
}

/// Wins among the last five bets: ≥3 positive, ≤1 negative.
pub fn momentum(records: &[CycleRecord]) -> Momentum {
    let tail = &records[records.len().saturating_sub(5)..];
    let wins = tail.iter().filter(|r| r.outcome == Outcome::Win).count();
    match wins {
        0 | 1 => Momentum::Negative,
        2 => Momentum::Neutral,
        _ => Momentum::Positive,
    }
}

/// Compare the two halves of the window. Thresholds shrink as the sample grows.
pub fn trend(records: &[CycleRecord]) -> Trend {
    let momentum = momentum(records);
    let n = records.len();
    if n < 6 {
        return Trend {
            direction: TrendDirection::Undetermined,
            strength: 0.0,
            momentum,
            first_half_hit_rate: 0.0,
            second_half_hit_rate: 0.0,
            first_half_profit: Decimal::ZERO,
            second_half_profit: Decimal::ZERO,
        };
    }

    let (first, second) = records.split_at(n / 2);
    let (rate_1, rate_2) = (win_share(first), win_share(second));
    let (profit_1, profit_2) = (profit(first), profit(second));
    let rate_diff = rate_2 - rate_1;
    let profit_diff = profit_2 - profit_1;

    let rate_threshold = (30.0 - n as f64).max(15.0);
    let profit_threshold = Decimal::from(10i64.saturating_sub(n as i64 / 2).max(5));
    let strength = ((rate_diff.abs() / 15.0 * 10.0).round() / 10.0).min(5.0);

    let (direction, strength) = if profit_diff > profit_threshold && rate_diff > rate_threshold {
        (TrendDirection::Rising, strength)
    } else if profit_diff < -profit_threshold && rate_diff < -rate_threshold {
        (TrendDirection::Falling, strength)
    } else {
        (TrendDirection::Sideways, 0.0)
    };

    Trend {
        direction,
        strength,
        momentum,
        first_half_hit_rate: rate_1,
        second_half_hit_rate: rate_2,
        first_half_profit: profit_1,
        second_half_profit: profit_2,
    }
}

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Continue,
    Adjust,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Number of most recent bets analysed.
    pub window: usize,
    /// Below this many bets the analyzer always says continue.
    pub min_bets: usize,
    pub pause_below_hit_rate: f64,
    pub adjust_below_hit_rate: f64,
    pub pause_total_losses: usize,
    /// Window loss that, with negative momentum, forces a pause.
    pub pause_loss_amount: Decimal,
    pub pause_falling_strength: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_bets: 5,
            pause_below_hit_rate: 40.0,
            adjust_below_hit_rate: 50.0,
            pause_total_losses: 2,
            pause_loss_amount: dec!(20),
            pause_falling_strength: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: Action,
    pub reasons: Vec<String>,
    pub adjustments: Vec<String>,
    pub window: HistorySummary,
    pub trend: Trend,
}

pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyse the tail of `records` (oldest first).
    pub fn recommend(&self, records: &[CycleRecord]) -> Recommendation {
        let window = &records[records.len().saturating_sub(self.config.window)..];
        let summary = summarize(window);
        let trend = trend(window);
        let c = &self.config;

        let mut action = Action::Continue;
        let mut reasons = Vec::new();
        let mut adjustments = Vec::new();

        if summary.bets < c.min_bets {
            reasons.push(format!("Small sample ({} bets), collecting data", summary.bets));
            return Recommendation {
                action,
                reasons,
                adjustments,
                window: summary,
                trend,
            };
        }

        let rate = summary.hit_rate;
        let total_losses = summary.cycles.total_loss;

        if rate < c.pause_below_hit_rate {
            action = Action::Pause;
            reasons.push(format!("Low hit rate: {rate:.1}%"));
        }
        if total_losses >= c.pause_total_losses {
            action = Action::Pause;
            reasons.push(format!("{total_losses} total-loss cycles in the last {} bets", summary.bets));
        }
        if trend.direction == TrendDirection::Falling && trend.strength >= c.pause_falling_strength {
            action = Action::Pause;
            reasons.push(format!("Strong falling trend (strength {:.1})", trend.strength));
        }
        if trend.momentum == Momentum::Negative && summary.total_profit < -c.pause_loss_amount {
            action = Action::Pause;
            reasons.push(format!("Negative momentum with a {} loss", summary.total_profit));
        }

        if action != Action::Pause {
            if rate < c.adjust_below_hit_rate {
                action = Action::Adjust;
                reasons.push(format!("Marginal hit rate: {rate:.1}%"));
                adjustments.push("Reduce the base stake".to_string());
            }
            if total_losses == 1 {
                action = Action::Adjust;
                reasons.push("One recent total-loss cycle".to_string());
                adjustments.push("Consider another instrument or direction".to_string());
            }
            if trend.direction == TrendDirection::Falling && trend.strength >= 1.0 {
                action = Action::Adjust;
                reasons.push("Mild falling trend".to_string());
                adjustments.push("Reduce ladder levels or base stake".to_string());
            }
            if trend.momentum == Momentum::Negative {
                action = Action::Adjust;
                reasons.push("Negative momentum over the last 5 bets".to_string());
                adjustments.push("Wait for a reversal".to_string());
            }
        }

        if action == Action::Continue {
            reasons.push(format!(
                "Hit rate {rate:.1}%, trend {:?}, momentum {:?}",
                trend.direction, trend.momentum
            ));
        }

        info!(
            action = ?action,
            bets = summary.bets,
            hit_rate = format!("{rate:.1}%"),
            profit = %summary.total_profit,
            total_losses,
            "History analysed"
        );

        Recommendation {
            action,
            reasons,
            adjustments,
            window: summary,
            trend,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
