//! Scripted broker for integration testing.
//!
//! Provides a deterministic `Brokerage` implementation that settles bets
//! from a queue of pre-programmed results and tracks the balance, every
//! placed stake, and reconnect attempts in memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Mutex;

use gale::broker::{Brokerage, SettledTrade};
use gale::types::{Direction, Outcome};

/// One scripted settlement: an outcome, or a transport error message.
pub type Scripted = Result<Outcome, String>;

pub struct ScriptedBroker {
    payout: Decimal,
    script: Mutex<VecDeque<Scripted>>,
    balance: Mutex<Decimal>,
    placed: Mutex<Vec<(Direction, Decimal)>>,
    reconnects: Mutex<u32>,
}

impl ScriptedBroker {
    pub fn new(payout: Decimal, balance: Decimal, script: Vec<Scripted>) -> Self {
        Self {
            payout,
            script: Mutex::new(script.into()),
            balance: Mutex::new(balance),
            placed: Mutex::new(Vec::new()),
            reconnects: Mutex::new(0),
        }
    }

    /// Every stake placed so far, in order.
    pub fn stakes(&self) -> Vec<Decimal> {
        self.placed.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    pub fn directions(&self) -> Vec<Direction> {
        self.placed.lock().unwrap().iter().map(|(d, _)| *d).collect()
    }

    pub fn reconnects(&self) -> u32 {
        *self.reconnects.lock().unwrap()
    }

    pub fn balance(&self) -> Decimal {
        *self.balance.lock().unwrap()
    }
}

#[async_trait]
impl Brokerage for ScriptedBroker {
    async fn place_and_await(
        &self,
        _instrument: &str,
        direction: Direction,
        stake: Decimal,
        _duration_secs: u64,
    ) -> Result<SettledTrade> {
        self.placed.lock().unwrap().push((direction, stake));
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted"))?;
        let outcome = next.map_err(|msg| anyhow!(msg))?;
        let profit = outcome.signed_profit(stake, self.payout, 2);
        *self.balance.lock().unwrap() += profit;
        Ok(SettledTrade { outcome, profit })
    }

    async fn get_balance(&self) -> Result<Decimal> {
        Ok(self.balance())
    }

    async fn reconnect(&self) -> Result<()> {
        *self.reconnects.lock().unwrap() += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
