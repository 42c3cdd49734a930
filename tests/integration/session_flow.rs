//! Session flows against the scripted broker and the paper broker:
//! ladder progression, persistence, protection, and unknown settlements.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gale::broker::paper::PaperBroker;
use gale::engine::analyzer::{summarize, Action, Analyzer, AnalyzerConfig};
use gale::engine::session::{CycleOutcome, Session, SessionConfig};
use gale::storage::{AlertKind, JsonlRecordStore, MemoryAlertSink, MemoryRecordStore, RecordStore};
use gale::strategy::guard::{BlockReason, GuardConfig};
use gale::types::{Bar, Direction, LevelLabel, Outcome, Scenario};

use crate::mock_broker::ScriptedBroker;

fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gale-it-{}-{name}", uuid::Uuid::new_v4()))
}

fn session_config() -> SessionConfig {
    SessionConfig {
        align_to_bar: false,
        settle_timeout: Duration::from_secs(5),
        reconnect_attempts: 2,
        ..Default::default()
    }
}

fn scripted_session(
    script: Vec<Result<Outcome, String>>,
    guard: GuardConfig,
    alerts: Arc<MemoryAlertSink>,
) -> (Arc<ScriptedBroker>, Session<ScriptedBroker, MemoryRecordStore>) {
    let broker = Arc::new(ScriptedBroker::new(dec!(0.85), dec!(1000), script));
    let session = Session::new(
        Arc::clone(&broker),
        MemoryRecordStore::new(),
        alerts,
        guard,
        session_config(),
        dec!(1000),
    )
    .unwrap();
    (broker, session)
}

fn completed(outcome: CycleOutcome) -> gale::engine::accountant::CycleSummary {
    match outcome {
        CycleOutcome::Completed(summary) => summary,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_recovery_win_persists_tagged_records() {
    let path = temp_file("records.jsonl");
    let broker = Arc::new(ScriptedBroker::new(
        dec!(0.85),
        dec!(1000),
        vec![Ok(Outcome::Loss), Ok(Outcome::Win)],
    ));
    let alerts = Arc::new(MemoryAlertSink::default());
    let mut session = Session::new(
        Arc::clone(&broker),
        JsonlRecordStore::open(&path).unwrap(),
        alerts,
        GuardConfig::default(),
        session_config(),
        dec!(1000),
    )
    .unwrap();
    session.start().await.unwrap();

    let summary = completed(session.run_cycle("EURUSD", Direction::Put).await.unwrap());
    assert_eq!(summary.scenario, Scenario::RecoveryWin);
    assert_eq!(summary.levels_executed, 2);
    assert_eq!(summary.net_profit, dec!(8.50));
    assert_eq!(broker.stakes(), vec![dec!(10.00), dec!(21.76)]);
    assert_eq!(broker.directions(), vec![Direction::Put, Direction::Put]);
    assert_eq!(broker.balance(), dec!(1008.50));

    // Reopen from disk: both levels carry the closing scenario.
    let reopened = JsonlRecordStore::open(&path).unwrap();
    let records = reopened.all();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.scenario == Some(Scenario::RecoveryWin)));
    assert!(records.iter().all(|r| r.sequence_id == summary.sequence_id));
    assert_eq!(records[0].level_label, LevelLabel::Entry);
    assert_eq!(records[1].level_label, LevelLabel::Recovery(1));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_total_loss_then_stop_loss_blocks() {
    let alerts = Arc::new(MemoryAlertSink::default());
    let guard = GuardConfig {
        stop_loss_pct: dec!(5),
        ..Default::default()
    };
    let (broker, mut session) = scripted_session(
        vec![Ok(Outcome::Loss), Ok(Outcome::Loss), Ok(Outcome::Loss)],
        guard,
        Arc::clone(&alerts),
    );
    session.start().await.unwrap();

    let summary = completed(session.run_cycle("EURUSD", Direction::Call).await.unwrap());
    assert_eq!(summary.scenario, Scenario::TotalLoss);
    assert_eq!(summary.net_profit, dec!(-79.12));
    assert_eq!(broker.stakes(), vec![dec!(10.00), dec!(21.76), dec!(47.36)]);
    assert_eq!(alerts.count(AlertKind::TotalLoss), 1);

    // 7.9% drawdown on a 1000 reference trips the 5% stop-loss.
    match session.run_cycle("EURUSD", Direction::Call).await.unwrap() {
        CycleOutcome::Blocked(verdict) => {
            assert_eq!(verdict.reason, Some(BlockReason::StopLossPercent));
            assert_eq!(verdict.metrics.balance, dec!(920.88));
        }
        other => panic!("expected block, got {other:?}"),
    }
    assert!(session.guard().is_blocked());
    assert_eq!(alerts.count(AlertKind::StopLoss), 1);
    assert_eq!(broker.stakes().len(), 3);

    // Still blocked: the drawdown has not gone away.
    session.unblock();
    assert!(matches!(
        session.run_cycle("EURUSD", Direction::Call).await.unwrap(),
        CycleOutcome::Blocked(_)
    ));
}

#[tokio::test]
async fn test_tie_retries_entry_level() {
    let alerts = Arc::new(MemoryAlertSink::default());
    let (broker, mut session) = scripted_session(
        vec![Ok(Outcome::Tie), Ok(Outcome::Win)],
        GuardConfig::default(),
        alerts,
    );
    session.start().await.unwrap();

    let summary = completed(session.run_cycle("GBPUSD", Direction::Call).await.unwrap());
    assert_eq!(summary.scenario, Scenario::EntryWin);
    assert_eq!(summary.net_profit, dec!(8.50));
    assert_eq!(broker.stakes(), vec![dec!(10.00), dec!(10.00)]);
    assert_eq!(session.history().len(), 2);
    assert_eq!(session.history()[0].outcome, Outcome::Tie);
}

#[tokio::test]
async fn test_transport_failure_abandons_cycle_without_rebet() {
    let alerts = Arc::new(MemoryAlertSink::default());
    let (broker, mut session) = scripted_session(
        vec![Ok(Outcome::Loss), Err("socket closed".to_string())],
        GuardConfig::default(),
        Arc::clone(&alerts),
    );
    session.start().await.unwrap();

    let summary = completed(session.run_cycle("EURUSD", Direction::Call).await.unwrap());
    assert!(summary.abandoned);
    assert_eq!(summary.scenario, Scenario::TotalLoss);
    assert_eq!(summary.levels_executed, 2);
    assert_eq!(summary.net_profit, dec!(-31.76));
    // One attempt per level; the failed bet is not re-placed.
    assert_eq!(broker.stakes(), vec![dec!(10.00), dec!(21.76)]);
    assert_eq!(broker.reconnects(), 1);
    assert_eq!(alerts.count(AlertKind::TotalLoss), 1);
}

#[tokio::test]
async fn test_paper_session_end_to_end() {
    let bars: Vec<Bar> = (0..8)
        .map(|i| Bar::flat(i * 300, Decimal::from(100 + i)))
        .collect();
    let broker = Arc::new(PaperBroker::new(bars, dec!(0.85), dec!(500), 0));
    let alerts = Arc::new(MemoryAlertSink::default());
    let mut session = Session::new(
        Arc::clone(&broker),
        MemoryRecordStore::new(),
        alerts,
        GuardConfig::default(),
        session_config(),
        dec!(500),
    )
    .unwrap();
    assert_eq!(session.start().await.unwrap(), dec!(500));

    for _ in 0..3 {
        let summary = completed(session.run_cycle("EURUSD", Direction::Call).await.unwrap());
        assert_eq!(summary.scenario, Scenario::EntryWin);
    }

    assert_eq!(broker.bets_placed().unwrap(), 3);
    let records = session.store().all();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.scenario == Some(Scenario::EntryWin)));

    let summary = summarize(&records);
    assert_eq!(summary.total_profit, dec!(25.50));
    assert_eq!(summary.cycles.entry_win, 3);
    assert_eq!(session.guard().state().current_balance, Some(dec!(525.50)));

    // Too few bets for a verdict.
    let rec = Analyzer::new(AnalyzerConfig::default()).recommend(&records);
    assert_eq!(rec.action, Action::Continue);
}

#[tokio::test]
async fn test_cancel_before_cycle_places_nothing() {
    let alerts = Arc::new(MemoryAlertSink::default());
    let (broker, mut session) = scripted_session(vec![Ok(Outcome::Win)], GuardConfig::default(), alerts);
    session.start().await.unwrap();
    session
        .cancel_handle()
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = session.run_cycle("EURUSD", Direction::Call).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Cancelled { sequence_id: None, .. }));
    assert!(broker.stakes().is_empty());
}
