//! Offline flows: bar files on disk → config → simulator → ranking.

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;

use gale::backtest::{BacktestSimulator, Candidate, Rating, RankingEngine};
use gale::config::AppConfig;
use gale::storage::load_bars;
use gale::strategy::signal::{EmaCross, Strategy, StrategySignal};
use gale::types::{Bar, Direction, Scenario};

struct AlwaysCall;

impl Strategy for AlwaysCall {
    fn name(&self) -> &str {
        "always-call"
    }

    fn min_bars(&self) -> usize {
        1
    }

    fn evaluate(&self, _window: &[Bar]) -> Result<StrategySignal> {
        Ok(StrategySignal::bet(Direction::Call, "always"))
    }
}

fn series(closes: &[i64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| Bar::flat(i as i64 * 300, Decimal::from(*c)))
        .collect()
}

fn write_bars(name: &str, bars: &[Bar]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gale-it-{}-{name}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, serde_json::to_string(bars).unwrap()).unwrap();
    path
}

#[test]
fn test_load_bars_sorts_by_time() {
    let mut bars = series(&[100, 101, 102]);
    bars.reverse();
    let path = write_bars("unsorted", &bars);

    let loaded = load_bars(&path).unwrap();
    let times: Vec<i64> = loaded.iter().map(|b| b.time).collect();
    assert_eq!(times, vec![0, 300, 600]);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_config_driven_martingale_backtest() {
    let cfg = AppConfig::parse(
        r#"
        [stake]
        base_stake = 10
        payout = 0.85
        levels = 3
        "#,
    )
    .unwrap();
    let sim = BacktestSimulator::new(cfg.backtest_config()).unwrap();

    // Up, down, up: entry win, then loss recovered at level 1.
    let bars = series(&[100, 101, 100, 101]);
    let replay = sim.replay("EURUSD", &bars, &AlwaysCall).unwrap();
    let result = &replay.result;

    assert_eq!(result.signals, 3);
    assert_eq!(result.wins, 2);
    assert_eq!(result.losses, 1);
    let scenarios = result.scenarios.as_ref().unwrap();
    assert_eq!(scenarios.get(Scenario::EntryWin), 1);
    assert_eq!(scenarios.get(Scenario::RecoveryWin), 1);
    assert_eq!(result.net_profit, dec!(17.00));
    assert_eq!(result.open_cycle_profit, Decimal::ZERO);

    let stakes: Vec<Decimal> = replay.bets.iter().map(|b| b.stake).collect();
    assert_eq!(stakes, vec![dec!(10.00), dec!(10.00), dec!(21.76)]);
    // Every decision bar has a later bar to settle on.
    assert!(replay.bets.iter().all(|b| b.index + 1 < bars.len()));
}

#[test]
fn test_rank_instruments_from_disk() {
    let cfg = AppConfig::parse("[backtest]\nmin_history_bars = 10\nmartingale = false").unwrap();

    let rising: Vec<i64> = (0..15).map(|i| 100 + i).collect();
    let falling: Vec<i64> = (0..15).map(|i| 200 - i).collect();
    let files = [
        ("UP", dec!(0.80), write_bars("up", &series(&rising))),
        ("DOWN", dec!(0.90), write_bars("down", &series(&falling))),
        ("TINY", dec!(0.90), write_bars("tiny", &series(&[1, 2, 3]))),
    ];

    let candidates: Vec<Candidate> = files
        .iter()
        .map(|(name, payout, path)| Candidate {
            instrument: name.to_string(),
            payout: *payout,
            bars: load_bars(path).unwrap(),
        })
        .collect();

    let report = RankingEngine::new(cfg.backtest_config(), cfg.backtest.min_history_bars)
        .rank(&candidates, &AlwaysCall);

    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.best().unwrap().instrument, "UP");
    assert_eq!(report.best().unwrap().result.net_profit, dec!(112.00));
    assert_eq!(report.best().unwrap().result.rating, Rating::Excellent);
    assert_eq!(report.entries[1].instrument, "DOWN");
    assert_eq!(report.entries[1].result.net_profit, dec!(-140));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].instrument, "TINY");

    for (_, _, path) in &files {
        let _ = std::fs::remove_file(path);
    }
}

#[test]
fn test_full_correction_uses_instrument_payout() {
    let cfg = AppConfig::parse(
        r#"
        [stake]
        payout = 0.85
        full_correction = true

        [backtest]
        min_history_bars = 3
        "#,
    )
    .unwrap();

    // Loss then recovery on an instrument paying 60%.
    let candidates = vec![Candidate {
        instrument: "GBPJPY".to_string(),
        payout: dec!(0.60),
        bars: series(&[100, 99, 100]),
    }];
    let report = RankingEngine::new(cfg.backtest_config(), cfg.backtest.min_history_bars)
        .rank(&candidates, &AlwaysCall);

    let best = report.best().unwrap();
    assert_eq!(best.payout_used, dec!(0.60));
    assert_eq!(best.result.scenarios.as_ref().unwrap().get(Scenario::RecoveryWin), 1);
    assert_eq!(best.result.net_profit, dec!(10.00));
}

#[test]
fn test_ema_cross_backtest_runs_clean() {
    let closes: Vec<i64> = (0..120)
        .map(|i| 1000 + ((i as f64 / 8.0).sin() * 50.0) as i64)
        .collect();
    let bars = series(&closes);
    let strategy = EmaCross::new(5, 20).unwrap();

    let cfg = AppConfig::parse("").unwrap();
    let result = BacktestSimulator::new(cfg.backtest_config())
        .unwrap()
        .run("SINE", &bars, &strategy)
        .unwrap();

    assert_eq!(result.bars, 120);
    assert_eq!(result.strategy_errors, 0);
    assert!(result.signals > 0);
    assert!(result.signals < 120 - strategy.min_bars() + 1);
}
