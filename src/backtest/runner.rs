//! Walk-forward backtest simulator.
//!
//! Replays a strategy over historical bars. At bar `i` the strategy only
//! sees `bars[..=i]`; the bet settles on `close[i + 1]` vs `close[i]`.
//! With Martingale parameters the outcome drives a private
//! `StakeLadder` + `CycleAccountant`, exactly as a live session would.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::accountant::{CycleAccountant, Settlement, Step};
use crate::strategy::ladder::{round_money, LadderSpec, StakeLadder};
use crate::strategy::signal::Strategy;
use crate::types::{Bar, Direction, GaleError, Outcome, Scenario};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Recovery ladder used by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MartingaleParams {
    pub levels: usize,
    pub correction_factor: Decimal,
    /// Use `1 / payout` of the simulated instrument instead of `correction_factor`.
    #[serde(default)]
    pub full_correction: bool,
    pub max_tie_retries: u32,
}

impl Default for MartingaleParams {
    fn default() -> Self {
        Self {
            levels: 3,
            correction_factor: Decimal::ONE,
            full_correction: false,
            max_tie_retries: 1,
        }
    }
}

/// Rating cut-offs. Percentages on a 0–100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingThresholds {
    /// Martingale: total-loss share below which a profitable run is Excellent.
    pub excellent_max_total_loss_pct: f64,
    pub good_max_total_loss_pct: f64,
    pub neutral_max_total_loss_pct: f64,
    /// Flat: hit rate at or above which a run is Excellent.
    pub excellent_min_hit_rate: f64,
    pub good_min_hit_rate: f64,
    pub neutral_min_hit_rate: f64,
}

impl Default for RatingThresholds {
    fn default() -> Self {
        Self {
            excellent_max_total_loss_pct: 15.0,
            good_max_total_loss_pct: 20.0,
            neutral_max_total_loss_pct: 25.0,
            excellent_min_hit_rate: 60.0,
            good_min_hit_rate: 55.0,
            neutral_min_hit_rate: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub payout: Decimal,
    pub base_stake: Decimal,
    /// `None` = flat staking.
    pub martingale: Option<MartingaleParams>,
    pub thresholds: RatingThresholds,
    pub minor_unit_dp: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            payout: dec!(0.85),
            base_stake: dec!(10),
            martingale: Some(MartingaleParams::default()),
            thresholds: RatingThresholds::default(),
            minor_unit_dp: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Excellent,
    Good,
    Neutral,
    Weak,
}

impl Rating {
    pub fn symbol(&self) -> char {
        match self {
            Rating::Excellent => 'E',
            Rating::Good => 'B',
            Rating::Neutral => 'N',
            Rating::Weak => 'F',
        }
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Rating::Excellent => "excellent",
            Rating::Good => "good",
            Rating::Neutral => "neutral",
            Rating::Weak => "weak",
        };
        f.write_str(label)
    }
}

/// Closed cycles per scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioCounts {
    pub tie: usize,
    pub entry_win: usize,
    pub recovery_win: usize,
    pub total_loss: usize,
}

impl ScenarioCounts {
    pub fn add(&mut self, scenario: Scenario) {
        *self.slot(scenario) += 1;
    }

    pub fn get(&self, scenario: Scenario) -> usize {
        match scenario {
            Scenario::Tie => self.tie,
            Scenario::EntryWin => self.entry_win,
            Scenario::RecoveryWin => self.recovery_win,
            Scenario::TotalLoss => self.total_loss,
        }
    }

    pub fn total(&self) -> usize {
        self.tie + self.entry_win + self.recovery_win + self.total_loss
    }

    fn slot(&mut self, scenario: Scenario) -> &mut usize {
        match scenario {
            Scenario::Tie => &mut self.tie,
            Scenario::EntryWin => &mut self.entry_win,
            Scenario::RecoveryWin => &mut self.recovery_win,
            Scenario::TotalLoss => &mut self.total_loss,
        }
    }
}

/// Outcome of one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub bars: usize,
    pub signals: usize,
    pub wins: usize,
    pub losses: usize,
    pub ties: usize,
    pub strategy_errors: usize,
    /// `wins / (wins + losses) * 100`.
    pub hit_rate: f64,
    /// Flat: every bet. Martingale: closed cycles only.
    pub net_profit: Decimal,
    /// Martingale only.
    pub scenarios: Option<ScenarioCounts>,
    /// Share of closed cycles that were total losses, 0–100.
    pub total_loss_share: f64,
    /// Running profit of a cycle still open when the bars ran out.
    pub open_cycle_profit: Decimal,
    pub max_loss_streak: usize,
    /// Longest run of winning bets; ties leave it untouched.
    pub max_win_streak: usize,
    pub max_total_loss_streak: usize,
    /// `net_profit / signals`.
    pub profit_per_signal: Decimal,
    /// `net_profit / closed cycles`. Martingale only.
    pub profit_per_cycle: Option<Decimal>,
    /// Average bars between signals, `bars / signals`.
    pub bars_per_signal: f64,
    pub rating: Rating,
}

/// One simulated bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedBet {
    /// Index of the decision bar.
    pub index: usize,
    pub time: i64,
    pub direction: Direction,
    pub stake: Decimal,
    pub outcome: Outcome,
    pub profit: Decimal,
    /// Ladder level (0 for flat staking).
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub result: BacktestResult,
    pub bets: Vec<SimulatedBet>,
}

/// Rate a run.
pub fn rate(
    thresholds: &RatingThresholds,
    martingale: bool,
    hit_rate: f64,
    total_loss_share: f64,
    net_profit: Decimal,
) -> Rating {
    if martingale {
        let t = thresholds;
        if total_loss_share < t.excellent_max_total_loss_pct && net_profit > Decimal::ZERO {
            Rating::Excellent
        } else if total_loss_share < t.good_max_total_loss_pct && net_profit > Decimal::ZERO {
            Rating::Good
        } else if total_loss_share < t.neutral_max_total_loss_pct && net_profit >= Decimal::ZERO {
            Rating::Neutral
        } else {
            Rating::Weak
        }
    } else if hit_rate >= thresholds.excellent_min_hit_rate {
        Rating::Excellent
    } else if hit_rate >= thresholds.good_min_hit_rate {
        Rating::Good
    } else if hit_rate >= thresholds.neutral_min_hit_rate {
        Rating::Neutral
    } else {
        Rating::Weak
    }
}

fn bar_time(bar: &Bar) -> DateTime<Utc> {
    Utc.timestamp_opt(bar.time, 0).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct BacktestSimulator {
    config: BacktestConfig,
    ladder: Option<StakeLadder>,
}

impl BacktestSimulator {
    /// Validates stake, payout and ladder parameters up front.
    pub fn new(config: BacktestConfig) -> Result<Self, GaleError> {
        let spec = LadderSpec {
            base_stake: config.base_stake,
            payout: config.payout,
            levels: config.martingale.as_ref().map_or(1, |m| m.levels),
            correction_factor: match &config.martingale {
                Some(m) if m.full_correction => LadderSpec::full_correction(config.payout),
                Some(m) => m.correction_factor,
                None => Decimal::ONE,
            },
            minor_unit_dp: config.minor_unit_dp,
        };
        let ladder = StakeLadder::build(spec)?;
        let ladder = config.martingale.is_some().then_some(ladder);
        Ok(Self { config, ladder })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run(&self, instrument: &str, bars: &[Bar], strategy: &dyn Strategy) -> Result<BacktestResult, GaleError> {
        Ok(self.replay(instrument, bars, strategy)?.result)
    }

    /// Run and keep the per-bet log.
    pub fn replay(&self, instrument: &str, bars: &[Bar], strategy: &dyn Strategy) -> Result<Replay, GaleError> {
        let payout = self.config.payout;
        let dp = self.config.minor_unit_dp;
        let max_tie_retries = self.config.martingale.as_ref().map_or(0, |m| m.max_tie_retries);

        let mut bets = Vec::new();
        let (mut signals, mut wins, mut losses, mut ties, mut errors) = (0, 0, 0, 0, 0);
        let mut net_profit = Decimal::ZERO;
        let mut loss_streak = 0;
        let mut max_loss_streak = 0;
        let mut win_streak = 0;
        let mut max_win_streak = 0;
        let mut total_loss_streak = 0;
        let mut max_total_loss_streak = 0;
        let mut scenarios = ScenarioCounts::default();
        let mut cycle: Option<CycleAccountant> = None;

        for i in 0..bars.len().saturating_sub(1) {
            let window = &bars[..=i];
            if window.len() < strategy.min_bars() {
                continue;
            }

            let direction = match strategy.evaluate(window) {
                Ok(s) => match s.signal {
                    Some(d) => d,
                    None => continue,
                },
                Err(e) => {
                    errors += 1;
                    warn!(instrument, strategy = strategy.name(), index = i, error = %e, "Strategy error, treated as no signal");
                    continue;
                }
            };
            signals += 1;

            let outcome = direction.settle(bars[i].close, bars[i + 1].close);
            match outcome {
                Outcome::Win => {
                    wins += 1;
                    loss_streak = 0;
                    win_streak += 1;
                    max_win_streak = max_win_streak.max(win_streak);
                }
                Outcome::Loss => {
                    losses += 1;
                    win_streak = 0;
                    loss_streak += 1;
                    max_loss_streak = max_loss_streak.max(loss_streak);
                }
                Outcome::Tie => ties += 1,
            }

            let Some(ladder) = &self.ladder else {
                let stake = self.config.base_stake;
                let profit = match outcome {
                    Outcome::Win => round_money(stake * payout, dp),
                    Outcome::Loss | Outcome::Tie => -stake,
                };
                net_profit += profit;
                bets.push(SimulatedBet {
                    index: i,
                    time: bars[i].time,
                    direction,
                    stake,
                    outcome,
                    profit,
                    level: 0,
                });
                continue;
            };

            let acc = cycle.get_or_insert_with(|| {
                CycleAccountant::open(format!("bt-{instrument}-{i}"), instrument, ladder.clone(), max_tie_retries)
            });
            let Some(level) = acc.current_level().cloned() else {
                cycle = None;
                continue;
            };

            let settlement = Settlement::computed(outcome, level.stake, payout, dp);
            let report = acc.settle(direction, settlement, bar_time(&bars[i]))?;
            bets.push(SimulatedBet {
                index: i,
                time: bars[i].time,
                direction,
                stake: level.stake,
                outcome,
                profit: report.record.signed_profit,
                level: level.index,
            });

            if let Step::Closed(summary) = report.step {
                net_profit += summary.net_profit;
                scenarios.add(summary.scenario);
                if summary.scenario == Scenario::TotalLoss {
                    total_loss_streak += 1;
                    max_total_loss_streak = max_total_loss_streak.max(total_loss_streak);
                } else {
                    total_loss_streak = 0;
                }
                cycle = None;
            }
        }

        let open_cycle_profit = cycle.as_ref().map_or(Decimal::ZERO, |c| c.net_profit());
        let decided = wins + losses;
        let hit_rate = if decided > 0 {
            wins as f64 / decided as f64 * 100.0
        } else {
            0.0
        };
        let closed = scenarios.total();
        let total_loss_share = if closed > 0 {
            scenarios.total_loss as f64 / closed as f64 * 100.0
        } else {
            0.0
        };
        let martingale = self.ladder.is_some();
        let profit_per_signal = if signals > 0 {
            round_money(net_profit / Decimal::from(signals), dp)
        } else {
            Decimal::ZERO
        };
        let profit_per_cycle = martingale.then(|| {
            if closed > 0 {
                round_money(net_profit / Decimal::from(closed), dp)
            } else {
                Decimal::ZERO
            }
        });
        let bars_per_signal = if signals > 0 {
            bars.len() as f64 / signals as f64
        } else {
            0.0
        };
        let rating = rate(&self.config.thresholds, martingale, hit_rate, total_loss_share, net_profit);

        debug!(
            instrument,
            strategy = strategy.name(),
            bars = bars.len(),
            signals,
            hit_rate = format!("{hit_rate:.1}%"),
            net = %net_profit,
            rating = %rating,
            "Backtest complete"
        );

        Ok(Replay {
            result: BacktestResult {
                bars: bars.len(),
                signals,
                wins,
                losses,
                ties,
                strategy_errors: errors,
                hit_rate,
                net_profit,
                scenarios: martingale.then_some(scenarios),
                total_loss_share,
                open_cycle_profit,
                max_loss_streak,
                max_win_streak,
                max_total_loss_streak,
                profit_per_signal,
                profit_per_cycle,
                bars_per_signal,
                rating,
            },
            bets,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
