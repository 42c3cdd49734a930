//! GALE: risk-managed binary-option betting-sequence engine.
//!
//! Entry point. Loads configuration, initialises structured logging, then
//! either ranks instruments over historical bars (`backtest` mode) or runs a
//! protected betting session against the paper broker (`paper` mode).

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use gale::backtest::{Candidate, RankingEngine, RankingReport};
use gale::broker::paper::PaperBroker;
use gale::config::{AppConfig, Mode};
use gale::engine::analyzer::{summarize, Analyzer};
use gale::engine::session::{CycleOutcome, Session};
use gale::storage::{self, AlertSink, JsonAlertLog, JsonlRecordStore, RecordStore, TracingAlertSink};
use gale::strategy::ladder::StakeLadder;

const BANNER: &str = r#"
   ____    _    _     _____
  / ___|  / \  | |   | ____|
 | |  _  / _ \ | |   |  _|
 | |_| |/ ___ \| |___| |___
  \____/_/   \_\_____|_____|

  Risk-managed betting-sequence engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("GALE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        mode = ?cfg.agent.mode,
        base_stake = %cfg.stake.base_stake,
        payout = %cfg.stake.payout,
        levels = cfg.stake.levels,
        currency = %cfg.agent.currency,
        "GALE starting up"
    );

    match cfg.agent.mode {
        Mode::Backtest => run_backtest(&cfg),
        Mode::Paper => run_paper(&cfg).await,
    }
}

// ---------------------------------------------------------------------------
// Backtest mode
// ---------------------------------------------------------------------------

fn run_backtest(cfg: &AppConfig) -> Result<()> {
    let strategy = cfg.build_strategy()?;

    let mut candidates = Vec::new();
    for instrument in &cfg.backtest.instruments {
        match storage::load_bars(&instrument.bars_file) {
            Ok(bars) => candidates.push(Candidate {
                instrument: instrument.name.clone(),
                payout: instrument.payout,
                bars,
            }),
            Err(e) => warn!(instrument = %instrument.name, error = %e, "Skipping instrument"),
        }
    }

    if candidates.is_empty() {
        warn!("No instruments with bar data configured; nothing to rank");
        return Ok(());
    }

    let report = RankingEngine::new(cfg.backtest_config(), cfg.backtest.min_history_bars)
        .with_parallelism(cfg.backtest.parallel)
        .rank(&candidates, strategy.as_ref());

    log_ranking(&report);
    Ok(())
}

fn log_ranking(report: &RankingReport) {
    for (rank, entry) in report.entries.iter().enumerate() {
        let r = &entry.result;
        info!(
            rank = rank + 1,
            instrument = %entry.instrument,
            payout = %entry.payout_used,
            signals = r.signals,
            hit_rate = format!("{:.1}%", r.hit_rate),
            net_profit = %r.net_profit,
            profit_per_signal = %r.profit_per_signal,
            max_win_streak = r.max_win_streak,
            total_loss_share = format!("{:.1}%", r.total_loss_share),
            rating = %r.rating,
            "Ranked"
        );
    }
    for skipped in &report.skipped {
        warn!(instrument = %skipped.instrument, reason = %skipped.reason, "Not ranked");
    }
}

// ---------------------------------------------------------------------------
// Paper mode
// ---------------------------------------------------------------------------

async fn run_paper(cfg: &AppConfig) -> Result<()> {
    let strategy = cfg.build_strategy()?;
    let bars = storage::load_bars(&cfg.session.bars_file)?;
    let instrument = cfg.session.instrument.clone();

    let broker = Arc::new(
        PaperBroker::new(
            bars,
            cfg.stake.payout,
            cfg.agent.initial_balance,
            strategy.min_bars().saturating_sub(1),
        )
        .with_settle_delay(Duration::from_millis(cfg.session.paper_settle_delay_ms))
        .with_minor_unit_dp(cfg.agent.minor_unit_dp),
    );

    let store = JsonlRecordStore::open(&cfg.storage.records_file)?;
    let alerts: Arc<dyn AlertSink> = match &cfg.storage.alerts_file {
        Some(path) => Arc::new(JsonAlertLog::new(path)),
        None => Arc::new(TracingAlertSink),
    };

    let session_config = cfg.session_config();
    let ladder = StakeLadder::build(session_config.effective_ladder())?;
    info!(
        stakes = ?ladder.stakes(),
        total_loss_if_all_lost = %ladder.total_loss_if_all_lost(),
        "Stake ladder"
    );

    let mut session = Session::new(
        Arc::clone(&broker),
        store,
        alerts,
        cfg.guard_config(),
        session_config,
        cfg.agent.initial_balance,
    )?;
    session.start().await?;

    // Ctrl+C stops the session at the next level boundary.
    let cancel = session.cancel_handle();
    tokio::spawn(watch_shutdown(Arc::clone(&cancel)));

    info!(instrument = %instrument, strategy = strategy.name(), "Entering session loop. Press Ctrl+C to stop.");

    while broker.has_next()? {
        if cancel.load(Ordering::SeqCst) {
            info!("Shutdown signal received.");
            break;
        }

        let signal = match strategy.evaluate(broker.window()?) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Strategy failed on bar, skipping");
                broker.advance()?;
                continue;
            }
        };

        let Some(direction) = signal.signal else {
            broker.advance()?;
            continue;
        };

        info!(direction = %direction, reason = %signal.reason, indicators = ?signal.indicators, "Entry signal");

        match session.run_cycle(&instrument, direction).await? {
            CycleOutcome::Completed(summary) => info!(
                sequence_id = %summary.sequence_id,
                scenario = summary.scenario.code(),
                net_profit = %summary.net_profit,
                levels = summary.levels_executed,
                "Cycle complete"
            ),
            CycleOutcome::Blocked(verdict) => {
                warn!(
                    reason = verdict.reason.map(|r| r.label()).unwrap_or("blocked"),
                    balance = %verdict.metrics.balance,
                    "Session blocked by protection guard"
                );
                break;
            }
            CycleOutcome::Cancelled { sequence_id, levels_executed, net_profit } => {
                warn!(sequence_id = ?sequence_id, levels_executed, net_profit = %net_profit, "Cycle cancelled");
                break;
            }
        }
    }

    let records = session.store().all();
    let recommendation = Analyzer::new(cfg.analyzer.clone()).recommend(&records);
    info!(
        action = ?recommendation.action,
        reasons = ?recommendation.reasons,
        adjustments = ?recommendation.adjustments,
        hit_rate = format!("{:.1}%", recommendation.window.hit_rate),
        trend = ?recommendation.trend.direction,
        "Analyzer recommendation"
    );

    let state = session.guard().state();
    let session_summary = summarize(session.history());
    info!(
        bets = broker.bets_placed()?,
        ops = state.ops_this_session,
        reference = %state.reference_balance,
        session_profit = %session_summary.total_profit,
        total_losses = session_summary.cycles.total_loss,
        "GALE shut down cleanly."
    );

    Ok(())
}

async fn watch_shutdown(cancel: Arc<AtomicBool>) {
    match tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C") {
        Ok(()) => cancel.store(true, Ordering::SeqCst),
        Err(e) => error!(error = %e, "Shutdown listener failed"),
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gale=info"));

    let json_logging = std::env::var("GALE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
