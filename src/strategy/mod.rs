//! Staking and signal logic: the recovery ladder, the protection guard,
//! and the entry-signal strategies that decide when a cycle starts.

pub mod guard;
pub mod ladder;
pub mod signal;
