//! Cycle execution: per-cycle accounting, the live session runner, and
//! post-session history analysis.

pub mod accountant;
pub mod analyzer;
pub mod session;
