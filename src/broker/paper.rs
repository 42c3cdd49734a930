//! Paper broker.
//!
//! Settles every bet on the next bar of a replayed series: the entry price
//! is the close of the current bar, the exit price the close of the bar
//! after it. Balance moves by the signed profit of each bet.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{Brokerage, SettledTrade};
use crate::types::{Bar, Direction};

struct PaperState {
    cursor: usize,
    balance: Decimal,
    bets: u64,
}

pub struct PaperBroker {
    name: String,
    bars: Vec<Bar>,
    payout: Decimal,
    minor_unit_dp: u32,
    /// Simulated time from placement to settlement.
    settle_delay: Duration,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    /// Start at `start_index` (the bar the first bet is placed on).
    pub fn new(bars: Vec<Bar>, payout: Decimal, initial_balance: Decimal, start_index: usize) -> Self {
        info!(
            bars = bars.len(),
            payout = %payout,
            balance = %initial_balance,
            "Paper broker initialised"
        );
        Self {
            name: "paper".to_string(),
            bars,
            payout,
            minor_unit_dp: 2,
            settle_delay: Duration::ZERO,
            state: Mutex::new(PaperState {
                cursor: start_index,
                balance: initial_balance,
                bets: 0,
            }),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_minor_unit_dp(mut self, dp: u32) -> Self {
        self.minor_unit_dp = dp;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperState>> {
        self.state.lock().map_err(|_| anyhow!("paper broker state poisoned"))
    }

    /// Bars up to and including the current one.
    pub fn window(&self) -> Result<&[Bar]> {
        let cursor = self.lock()?.cursor;
        Ok(&self.bars[..(cursor + 1).min(self.bars.len())])
    }

    /// Move to the next bar without betting. Returns false at the end of the series.
    pub fn advance(&self) -> Result<bool> {
        let mut state = self.lock()?;
        if state.cursor + 1 >= self.bars.len() {
            return Ok(false);
        }
        state.cursor += 1;
        Ok(true)
    }

    /// Whether another bet can still be settled.
    pub fn has_next(&self) -> Result<bool> {
        Ok(self.lock()?.cursor + 1 < self.bars.len())
    }

    pub fn bets_placed(&self) -> Result<u64> {
        Ok(self.lock()?.bets)
    }
}

#[async_trait]
impl Brokerage for PaperBroker {
    async fn place_and_await(
        &self,
        instrument: &str,
        direction: Direction,
        stake: Decimal,
        duration_secs: u64,
    ) -> Result<SettledTrade> {
        if stake <= Decimal::ZERO {
            bail!("stake must be positive, got {stake}");
        }

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let mut state = self.lock()?;
        let (entry, exit) = match (self.bars.get(state.cursor), self.bars.get(state.cursor + 1)) {
            (Some(entry), Some(exit)) => (entry.close, exit.close),
            _ => bail!("bar series exhausted at index {}", state.cursor),
        };

        let outcome = direction.settle(entry, exit);
        let profit = outcome.signed_profit(stake, self.payout, self.minor_unit_dp);
        state.balance += profit;
        state.cursor += 1;
        state.bets += 1;

        debug!(
            instrument,
            direction = %direction,
            stake = %stake,
            duration_secs,
            entry = %entry,
            exit = %exit,
            outcome = %outcome,
            profit = %profit,
            balance = %state.balance,
            "Paper bet settled"
        );

        Ok(SettledTrade { outcome, profit })
    }

    async fn get_balance(&self) -> Result<Decimal> {
        Ok(self.lock()?.balance)
    }

    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;
    use rust_decimal_macros::dec;

    fn series(closes: &[Decimal]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar::flat(i as i64 * 300, *c))
            .collect()
    }

    #[tokio::test]
    async fn test_settles_against_next_close() {
        let broker = PaperBroker::new(
            series(&[dec!(1.0), dec!(1.1), dec!(1.0), dec!(1.0)]),
            dec!(0.85),
            dec!(1000),
            0,
        );

        let t = broker.place_and_await("EURUSD", Direction::Call, dec!(10), 300).await.unwrap();
        assert_eq!(t.outcome, Outcome::Win);
        assert_eq!(t.profit, dec!(8.50));

        let t = broker.place_and_await("EURUSD", Direction::Call, dec!(21.76), 300).await.unwrap();
        assert_eq!(t.outcome, Outcome::Loss);
        assert_eq!(t.profit, dec!(-21.76));

        let t = broker.place_and_await("EURUSD", Direction::Put, dec!(10), 300).await.unwrap();
        assert_eq!(t.outcome, Outcome::Tie);

        assert_eq!(broker.get_balance().await.unwrap(), dec!(986.74));
        assert_eq!(broker.bets_placed().unwrap(), 3);
        assert!(!broker.has_next().unwrap());
    }

    #[test]
    fn test_exhausted_series_errors() {
        let broker = PaperBroker::new(series(&[dec!(1.0)]), dec!(0.85), dec!(100), 0);
        let result = tokio_test::block_on(broker.place_and_await("EURUSD", Direction::Call, dec!(10), 60));
        tokio_test::assert_err!(result);
        assert_eq!(tokio_test::block_on(broker.get_balance()).unwrap(), dec!(100));
    }

    #[test]
    fn test_window_and_advance() {
        let broker = PaperBroker::new(series(&[dec!(1), dec!(2), dec!(3)]), dec!(0.8), dec!(100), 0);
        assert_eq!(broker.window().unwrap().len(), 1);
        assert!(broker.advance().unwrap());
        assert!(broker.advance().unwrap());
        assert!(!broker.advance().unwrap());
        assert_eq!(broker.window().unwrap().len(), 3);
        assert_eq!(broker.name(), "paper");
    }
}
