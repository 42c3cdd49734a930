//! Integration tests. Exercise the public API end to end: configuration,
//! sessions against scripted and paper brokers, persistence, and ranking.

mod backtest_flow;
mod mock_broker;
mod session_flow;
