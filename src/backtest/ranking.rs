//! Instrument ranking.
//!
//! Runs the backtest simulator once per instrument (each with its own bars
//! and payout) and orders the results by simulated net profit.

use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{info, warn};

use crate::backtest::runner::{BacktestConfig, BacktestResult, BacktestSimulator};
use crate::strategy::signal::Strategy;
use crate::types::Bar;

/// One instrument to rank.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub instrument: String,
    pub payout: Decimal,
    pub bars: Vec<Bar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub instrument: String,
    pub result: BacktestResult,
    pub payout_used: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedInstrument {
    pub instrument: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingReport {
    /// Best first.
    pub entries: Vec<RankingEntry>,
    pub skipped: Vec<SkippedInstrument>,
}

impl RankingReport {
    pub fn best(&self) -> Option<&RankingEntry> {
        self.entries.first()
    }
}

/// Net profit desc, then hit rate desc, then instrument name.
pub fn compare_entries(a: &RankingEntry, b: &RankingEntry) -> Ordering {
    b.result
        .net_profit
        .cmp(&a.result.net_profit)
        .then_with(|| {
            b.result
                .hit_rate
                .partial_cmp(&a.result.hit_rate)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.instrument.cmp(&b.instrument))
}

pub struct RankingEngine {
    base: BacktestConfig,
    min_history_bars: usize,
    parallel: bool,
}

impl RankingEngine {
    pub fn new(base: BacktestConfig, min_history_bars: usize) -> Self {
        Self {
            base,
            min_history_bars,
            parallel: true,
        }
    }

    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn evaluate(&self, candidate: &Candidate, strategy: &dyn Strategy) -> Result<RankingEntry, SkippedInstrument> {
        let skip = |reason: String| SkippedInstrument {
            instrument: candidate.instrument.clone(),
            reason,
        };

        if candidate.bars.len() < self.min_history_bars {
            return Err(skip(format!(
                "insufficient history: {} bars (need {})",
                candidate.bars.len(),
                self.min_history_bars
            )));
        }

        let config = BacktestConfig {
            payout: candidate.payout,
            ..self.base.clone()
        };
        let result = BacktestSimulator::new(config)
            .and_then(|sim| sim.run(&candidate.instrument, &candidate.bars, strategy))
            .map_err(|e| skip(e.to_string()))?;

        Ok(RankingEntry {
            instrument: candidate.instrument.clone(),
            result,
            payout_used: candidate.payout,
        })
    }

    /// Rank every candidate. Instruments that cannot be simulated are
    /// reported in `skipped`, never fatal.
    pub fn rank(&self, candidates: &[Candidate], strategy: &dyn Strategy) -> RankingReport {
        let outcomes: Vec<Result<RankingEntry, SkippedInstrument>> = if self.parallel {
            candidates.par_iter().map(|c| self.evaluate(c, strategy)).collect()
        } else {
            candidates.iter().map(|c| self.evaluate(c, strategy)).collect()
        };

        let mut report = RankingReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(entry) => report.entries.push(entry),
                Err(skipped) => {
                    warn!(instrument = %skipped.instrument, reason = %skipped.reason, "Instrument skipped");
                    report.skipped.push(skipped);
                }
            }
        }
        report.entries.sort_by(compare_entries);

        info!(
            ranked = report.entries.len(),
            skipped = report.skipped.len(),
            best = report.best().map(|e| e.instrument.as_str()).unwrap_or("-"),
            "Ranking complete"
        );

        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
