//! GALE: risk-managed binary-option betting-sequence engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod backtest;
pub mod broker;
pub mod config;
pub mod engine;
pub mod storage;
pub mod strategy;
pub mod types;
