//! Offline replay: walk-forward simulation and instrument ranking.

pub mod ranking;
pub mod runner;

pub use ranking::{Candidate, RankingEngine, RankingEntry, RankingReport};
pub use runner::{BacktestConfig, BacktestResult, BacktestSimulator, MartingaleParams, Rating, RatingThresholds};
