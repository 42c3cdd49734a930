//! Brokerage integrations.
//!
//! Defines the `Brokerage` trait the live session bets through. The only
//! implementation shipped here is the paper broker, which settles bets
//! against a replayed bar series.

pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Direction, Outcome};

/// Settlement of a single bet as reported by the brokerage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettledTrade {
    pub outcome: Outcome,
    /// Signed profit credited to the account.
    pub profit: Decimal,
}

/// Abstraction over binary-option brokerages.
///
/// `place_and_await` covers the whole request/response of one bet: it
/// returns once the option has expired and settled. Timeouts are imposed by
/// the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Place a bet and wait for its settlement.
    async fn place_and_await(
        &self,
        instrument: &str,
        direction: Direction,
        stake: Decimal,
        duration_secs: u64,
    ) -> Result<SettledTrade>;

    /// Authoritative account balance.
    async fn get_balance(&self) -> Result<Decimal>;

    /// Re-establish the connection after a transport failure.
    async fn reconnect(&self) -> Result<()>;

    /// Broker name for logging and identification.
    fn name(&self) -> &str;
}
