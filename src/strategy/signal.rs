//! Signal strategies.
//!
//! A `Strategy` looks at a causal window of bars (oldest→newest, ending at
//! the decision bar) and optionally returns a direction to bet on. The
//! engine treats strategies as opaque; the two implementations here exist so
//! the binary and the tests have something concrete to run.

use anyhow::{bail, Result};
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;

use crate::types::{Bar, Direction};

/// Result of one strategy evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategySignal {
    /// `None` means "no bet on this bar".
    pub signal: Option<Direction>,
    pub reason: String,
    /// Indicator values for logging.
    pub indicators: BTreeMap<String, f64>,
}

impl StrategySignal {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            signal: None,
            reason: reason.into(),
            indicators: BTreeMap::new(),
        }
    }

    pub fn bet(direction: Direction, reason: impl Into<String>) -> Self {
        Self {
            signal: Some(direction),
            reason: reason.into(),
            indicators: BTreeMap::new(),
        }
    }

    pub fn with_indicator(mut self, name: &str, value: f64) -> Self {
        self.indicators.insert(name.to_string(), value);
        self
    }
}

/// Pluggable signal generator.
///
/// Implementations must only read the window they are given; callers never
/// pass bars that lie after the decision point.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Shortest window the strategy can decide on.
    fn min_bars(&self) -> usize;

    fn evaluate(&self, window: &[Bar]) -> Result<StrategySignal>;
}

// ---------------------------------------------------------------------------
// Idle
// ---------------------------------------------------------------------------

/// Never signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

impl Strategy for Idle {
    fn name(&self) -> &str {
        "idle"
    }

    fn min_bars(&self) -> usize {
        1
    }

    fn evaluate(&self, _window: &[Bar]) -> Result<StrategySignal> {
        Ok(StrategySignal::none("idle"))
    }
}

// ---------------------------------------------------------------------------
// EMA crossover
// ---------------------------------------------------------------------------

/// Bets with the trend when the fast EMA crosses the slow EMA on the last bar.
#[derive(Debug, Clone)]
pub struct EmaCross {
    pub fast: usize,
    pub slow: usize,
}

impl Default for EmaCross {
    fn default() -> Self {
        Self { fast: 5, slow: 20 }
    }
}

impl EmaCross {
    pub fn new(fast: usize, slow: usize) -> Result<Self> {
        if fast == 0 || fast >= slow {
            bail!("EMA periods must satisfy 0 < fast < slow (got fast={fast}, slow={slow})");
        }
        Ok(Self { fast, slow })
    }
}

/// Exponential moving average series, seeded with the first value.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            Some(p) => alpha * v + (1.0 - alpha) * p,
            None => v,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

impl Strategy for EmaCross {
    fn name(&self) -> &str {
        "ema-cross"
    }

    fn min_bars(&self) -> usize {
        self.slow + 1
    }

    fn evaluate(&self, window: &[Bar]) -> Result<StrategySignal> {
        if window.len() < self.min_bars() {
            return Ok(StrategySignal::none("insufficient data"));
        }

        let closes: Vec<f64> = window
            .iter()
            .map(|b| b.close.to_f64().unwrap_or(0.0))
            .collect();
        let fast = ema(&closes, self.fast);
        let slow = ema(&closes, self.slow);

        let n = closes.len();
        let prev_diff = fast[n - 2] - slow[n - 2];
        let diff = fast[n - 1] - slow[n - 1];

        let signal = if prev_diff <= 0.0 && diff > 0.0 {
            StrategySignal::bet(Direction::Call, "fast EMA crossed above slow")
        } else if prev_diff >= 0.0 && diff < 0.0 {
            StrategySignal::bet(Direction::Put, "fast EMA crossed below slow")
        } else {
            StrategySignal::none("no crossover")
        };

        Ok(signal
            .with_indicator("ema_fast", fast[n - 1])
            .with_indicator("ema_slow", slow[n - 1]))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
