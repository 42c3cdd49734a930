//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed sections. Every
//! field has a default, so an empty file is a valid configuration. Each
//! section converts into the runtime config of the component it drives.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::backtest::runner::{BacktestConfig, MartingaleParams, RatingThresholds};
use crate::engine::analyzer::AnalyzerConfig;
use crate::engine::session::SessionConfig;
use crate::strategy::guard::GuardConfig;
use crate::strategy::ladder::{LadderSpec, StakeLadder};
use crate::strategy::signal::{EmaCross, Idle, Strategy};
use crate::types::GaleError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub stake: StakeConfig,
    pub protection: ProtectionConfig,
    pub session: SessionSection,
    pub strategy: StrategyConfig,
    pub backtest: BacktestSection,
    pub analyzer: AnalyzerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Rank instruments over historical bars.
    Backtest,
    /// Run a live session against the paper broker.
    Paper,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub mode: Mode,
    /// Provisional reference balance until the broker reports one.
    pub initial_balance: Decimal,
    pub currency: String,
    /// Decimal places of the currency minor unit.
    pub minor_unit_dp: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "GALE-001".to_string(),
            mode: Mode::Backtest,
            initial_balance: dec!(1000),
            currency: "USD".to_string(),
            minor_unit_dp: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StakeConfig {
    pub base_stake: Decimal,
    pub payout: Decimal,
    pub levels: usize,
    pub correction_factor: Decimal,
    /// Use `1 / payout` as the correction factor.
    pub full_correction: bool,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            base_stake: dec!(10),
            payout: dec!(0.85),
            levels: 3,
            correction_factor: Decimal::ONE,
            full_correction: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProtectionConfig {
    pub stop_loss_pct: Decimal,
    pub stop_loss_abs: Option<Decimal>,
    pub take_profit_abs: Option<Decimal>,
    pub max_loss_streak: usize,
    pub cluster_min_total_losses: usize,
    pub cluster_min_loss_pct: Decimal,
    pub max_ops_per_session: Option<u64>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        let g = GuardConfig::default();
        Self {
            stop_loss_pct: g.stop_loss_pct,
            stop_loss_abs: g.stop_loss_abs,
            take_profit_abs: g.take_profit_abs,
            max_loss_streak: g.max_loss_streak,
            cluster_min_total_losses: g.cluster_min_total_losses,
            cluster_min_loss_pct: g.cluster_min_loss_pct,
            max_ops_per_session: g.max_ops_per_session,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionSection {
    pub instrument: String,
    /// JSON bar file replayed by the paper broker.
    pub bars_file: String,
    pub bet_duration_secs: u64,
    pub settle_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub max_tie_retries: u32,
    pub align_to_bar: bool,
    /// Simulated settlement latency of the paper broker.
    pub paper_settle_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            instrument: "EURUSD".to_string(),
            bars_file: "data/EURUSD.json".to_string(),
            bet_duration_secs: 300,
            settle_timeout_secs: 900,
            reconnect_attempts: 3,
            max_tie_retries: 1,
            align_to_bar: false,
            paper_settle_delay_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategyConfig {
    /// `"ema-cross"` or `"idle"`.
    pub name: String,
    pub ema_fast: usize,
    pub ema_slow: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "ema-cross".to_string(),
            ema_fast: 5,
            ema_slow: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstrumentConfig {
    pub name: String,
    pub payout: Decimal,
    pub bars_file: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BacktestSection {
    /// Simulate the recovery ladder; flat staking otherwise.
    pub martingale: bool,
    pub min_history_bars: usize,
    pub parallel: bool,
    pub thresholds: RatingThresholds,
    pub instruments: Vec<InstrumentConfig>,
}

impl Default for BacktestSection {
    fn default() -> Self {
        Self {
            martingale: true,
            min_history_bars: 10,
            parallel: true,
            thresholds: RatingThresholds::default(),
            instruments: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub records_file: String,
    pub alerts_file: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            records_file: crate::storage::DEFAULT_RECORD_FILE.to_string(),
            alerts_file: Some("gale_alerts.jsonl".to_string()),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GaleError> {
        StakeLadder::build(self.session_config().effective_ladder())?;
        if self.protection.stop_loss_pct <= Decimal::ZERO {
            return Err(GaleError::Config("protection.stop_loss_pct must be > 0".into()));
        }
        if self.protection.max_loss_streak == 0 {
            return Err(GaleError::Config("protection.max_loss_streak must be >= 1".into()));
        }
        if self.session.settle_timeout_secs == 0 {
            return Err(GaleError::Config("session.settle_timeout_secs must be > 0".into()));
        }
        if !matches!(self.strategy.name.as_str(), "ema-cross" | "idle") {
            return Err(GaleError::Config(format!("unknown strategy: {}", self.strategy.name)));
        }
        Ok(())
    }

    pub fn ladder_spec(&self) -> LadderSpec {
        LadderSpec {
            base_stake: self.stake.base_stake,
            payout: self.stake.payout,
            levels: self.stake.levels,
            correction_factor: self.stake.correction_factor,
            minor_unit_dp: self.agent.minor_unit_dp,
        }
    }

    pub fn guard_config(&self) -> GuardConfig {
        let p = &self.protection;
        GuardConfig {
            stop_loss_pct: p.stop_loss_pct,
            stop_loss_abs: p.stop_loss_abs,
            take_profit_abs: p.take_profit_abs,
            max_loss_streak: p.max_loss_streak,
            cluster_min_total_losses: p.cluster_min_total_losses,
            cluster_min_loss_pct: p.cluster_min_loss_pct,
            max_ops_per_session: p.max_ops_per_session,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            ladder: self.ladder_spec(),
            full_correction: self.stake.full_correction,
            max_tie_retries: s.max_tie_retries,
            bet_duration_secs: s.bet_duration_secs,
            settle_timeout: Duration::from_secs(s.settle_timeout_secs),
            reconnect_attempts: s.reconnect_attempts,
            align_to_bar: s.align_to_bar,
        }
    }

    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            payout: self.stake.payout,
            base_stake: self.stake.base_stake,
            martingale: self.backtest.martingale.then(|| MartingaleParams {
                levels: self.stake.levels,
                correction_factor: self.stake.correction_factor,
                full_correction: self.stake.full_correction,
                max_tie_retries: self.session.max_tie_retries,
            }),
            thresholds: self.backtest.thresholds.clone(),
            minor_unit_dp: self.agent.minor_unit_dp,
        }
    }

    /// Build the configured signal strategy.
    pub fn build_strategy(&self) -> Result<Box<dyn Strategy>> {
        match self.strategy.name.as_str() {
            "idle" => Ok(Box::new(Idle)),
            _ => Ok(Box::new(EmaCross::new(self.strategy.ema_fast, self.strategy.ema_slow)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.agent.mode, Mode::Backtest);
        assert_eq!(cfg.stake.base_stake, dec!(10));
        assert_eq!(cfg.stake.levels, 3);
        assert_eq!(cfg.protection.stop_loss_pct, dec!(20));
        assert_eq!(cfg.protection.max_loss_streak, 5);
        assert_eq!(cfg.protection.max_ops_per_session, Some(50));
        assert_eq!(cfg.session.settle_timeout_secs, 900);
        assert_eq!(cfg.analyzer.window, 20);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
            [agent]
            mode = "paper"
            initial_balance = 500

            [stake]
            base_stake = 2.5
            payout = 0.9
            levels = 4
            full_correction = true

            [protection]
            stop_loss_pct = 15
            take_profit_abs = 100

            [session]
            instrument = "GBPUSD"
            settle_timeout_secs = 60

            [[backtest.instruments]]
            name = "EURUSD"
            payout = 0.87
            bars_file = "data/EURUSD.json"
        "#;
        let cfg = AppConfig::parse(toml).unwrap();
        assert_eq!(cfg.agent.mode, Mode::Paper);
        assert_eq!(cfg.agent.initial_balance, dec!(500));
        assert_eq!(cfg.stake.payout, dec!(0.9));
        assert_eq!(cfg.backtest.instruments[0].payout, dec!(0.87));

        let guard = cfg.guard_config();
        assert_eq!(guard.stop_loss_pct, dec!(15));
        assert_eq!(guard.take_profit_abs, Some(dec!(100)));

        let session = cfg.session_config();
        assert!(session.full_correction);
        assert_eq!(session.settle_timeout, Duration::from_secs(60));
        assert_eq!(session.ladder.levels, 4);

        let bt = cfg.backtest_config();
        let mg = bt.martingale.unwrap();
        assert!(mg.full_correction);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::parse("[stake]\npayout = 1.5").is_err());
        assert!(AppConfig::parse("[stake]\nlevels = 0").is_err());
        assert!(AppConfig::parse("[stake]\npayout = 0.5\nlevels = 120").is_err());
        assert!(AppConfig::parse("[strategy]\nname = \"magic\"").is_err());
        assert!(AppConfig::parse("[agent]\nmode = \"live\"").is_err());
    }

    #[test]
    fn test_build_strategy() {
        let cfg = AppConfig::parse("[strategy]\nname = \"idle\"").unwrap();
        assert_eq!(cfg.build_strategy().unwrap().name(), "idle");
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.build_strategy().unwrap().name(), "ema-cross");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load("/nonexistent/gale.toml").is_err());
    }
}
