//! Martingale stake ladder.
//!
//! Computes the staircase of stakes for one betting cycle so that a win at
//! any level recovers every earlier loss plus the originally desired profit.
//!
//! Recovery formula: `stake[k] = (accumulated_loss + desired_profit) / payout`
//! where `desired_profit = base_stake * payout * correction_factor`.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{GaleError, LevelLabel};

/// Round a money amount to `dp` decimal places (midpoint away from zero).
pub fn round_money(amount: Decimal, dp: u32) -> Decimal {
    amount.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Ladder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderSpec {
    /// Stake of the entry bet.
    pub base_stake: Decimal,
    /// Fraction of stake paid as profit on a win, in (0, 1].
    pub payout: Decimal,
    /// Total number of bets in the cycle (1 = no recovery).
    pub levels: usize,
    /// 1.0 = standard; `1 / payout` makes recovered profit equal `base_stake`.
    pub correction_factor: Decimal,
    /// Decimal places of the currency minor unit.
    pub minor_unit_dp: u32,
}

impl Default for LadderSpec {
    fn default() -> Self {
        Self {
            base_stake: Decimal::TEN,
            payout: Decimal::new(85, 2),
            levels: 3,
            correction_factor: Decimal::ONE,
            minor_unit_dp: 2,
        }
    }
}

impl LadderSpec {
    /// Correction factor that forces recovered profit to equal `base_stake`.
    pub fn full_correction(payout: Decimal) -> Decimal {
        if payout > Decimal::ZERO {
            Decimal::ONE / payout
        } else {
            Decimal::ONE
        }
    }

    /// Reject invalid inputs before any computation.
    pub fn validate(&self) -> Result<(), GaleError> {
        if self.base_stake <= Decimal::ZERO {
            return Err(GaleError::InvalidStake(self.base_stake));
        }
        if self.payout <= Decimal::ZERO || self.payout > Decimal::ONE {
            return Err(GaleError::InvalidPayout(self.payout));
        }
        if self.levels < 1 {
            return Err(GaleError::InvalidLevels(self.levels));
        }
        if self.correction_factor < Decimal::ZERO {
            return Err(GaleError::InvalidCorrection(self.correction_factor));
        }
        Ok(())
    }

    /// Profit a winning cycle is meant to yield at every level.
    pub fn desired_profit(&self) -> Decimal {
        self.base_stake * self.payout * self.correction_factor
    }
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

/// One rung of the staircase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeLevel {
    pub index: usize,
    pub label: LevelLabel,
    pub stake: Decimal,
    /// Sum of every earlier stake in the cycle.
    pub cumulative_loss_before: Decimal,
    /// Net cycle profit if this level wins.
    pub required_profit_if_won: Decimal,
}

/// A computed ladder. Immutable once built for a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeLadder {
    spec: LadderSpec,
    levels: Vec<StakeLevel>,
    total_loss_if_all_lost: Decimal,
}

impl StakeLadder {
    /// Build the ladder for the given parameters.
    pub fn build(spec: LadderSpec) -> Result<Self, GaleError> {
        spec.validate()?;

        let dp = spec.minor_unit_dp;
        let overflow = |level: usize| GaleError::LadderOverflow { level };
        let desired_profit = spec
            .base_stake
            .checked_mul(spec.payout)
            .and_then(|p| p.checked_mul(spec.correction_factor))
            .ok_or_else(|| overflow(0))?;
        let mut levels = Vec::new();
        let mut accumulated_loss = Decimal::ZERO;

        for index in 0..spec.levels {
            let raw = if index == 0 {
                spec.base_stake
            } else {
                accumulated_loss
                    .checked_add(desired_profit)
                    .and_then(|v| v.checked_div(spec.payout))
                    .ok_or_else(|| overflow(index))?
            };
            let stake = round_money(raw, dp);
            let won = stake
                .checked_mul(spec.payout)
                .and_then(|v| v.checked_sub(accumulated_loss))
                .ok_or_else(|| overflow(index))?;

            levels.push(StakeLevel {
                index,
                label: LevelLabel::from_index(index),
                stake,
                cumulative_loss_before: accumulated_loss,
                required_profit_if_won: round_money(won, dp),
            });

            accumulated_loss = accumulated_loss
                .checked_add(stake)
                .ok_or_else(|| overflow(index))?;
        }

        debug!(
            base_stake = %spec.base_stake,
            payout = %spec.payout,
            levels = spec.levels,
            correction = %spec.correction_factor,
            total_at_risk = %accumulated_loss,
            "Ladder computed"
        );

        Ok(Self {
            spec,
            levels,
            total_loss_if_all_lost: accumulated_loss,
        })
    }

    pub fn spec(&self) -> &LadderSpec {
        &self.spec
    }

    pub fn levels(&self) -> &[StakeLevel] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&StakeLevel> {
        self.levels.get(index)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Always false for a validated ladder; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn is_final(&self, index: usize) -> bool {
        index + 1 >= self.levels.len()
    }

    /// Σ stakes: the loss if every level loses.
    pub fn total_loss_if_all_lost(&self) -> Decimal {
        self.total_loss_if_all_lost
    }

    /// Ordered stakes, for logging and display.
    pub fn stakes(&self) -> Vec<Decimal> {
        self.levels.iter().map(|l| l.stake).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec(base: Decimal, payout: Decimal, levels: usize, correction: Decimal) -> LadderSpec {
        LadderSpec {
            base_stake: base,
            payout,
            levels,
            correction_factor: correction,
            minor_unit_dp: 2,
        }
    }

    /// Net cycle profit when losing every level before `k` and winning at `k`.
    fn profit_if_won_at(ladder: &StakeLadder, k: usize) -> Decimal {
        let lost: Decimal = ladder.levels()[..k].iter().map(|l| l.stake).sum();
        round_money(ladder.levels()[k].stake * ladder.spec().payout, 2) - lost
    }

    #[test]
    fn test_reference_ladder() {
        let ladder = StakeLadder::build(spec(dec!(10), dec!(0.85), 3, Decimal::ONE)).unwrap();
        assert_eq!(ladder.stakes(), vec![dec!(10.00), dec!(21.76), dec!(47.36)]);
        assert_eq!(ladder.total_loss_if_all_lost(), dec!(79.12));

        // Win at level 1: 21.76 * 0.85 - 10 = 8.496 → within a cent of 8.50
        let profit = profit_if_won_at(&ladder, 1);
        assert!((profit - dec!(8.50)).abs() <= dec!(0.01), "profit {profit}");
    }

    #[test]
    fn test_level_metadata() {
        let ladder = StakeLadder::build(spec(dec!(10), dec!(0.85), 3, Decimal::ONE)).unwrap();
        let levels = ladder.levels();
        assert_eq!(levels[0].label, LevelLabel::Entry);
        assert_eq!(levels[2].label, LevelLabel::Recovery(2));
        assert_eq!(levels[0].cumulative_loss_before, Decimal::ZERO);
        assert_eq!(levels[2].cumulative_loss_before, dec!(31.76));
        assert_eq!(levels[0].required_profit_if_won, dec!(8.50));
        assert!(ladder.is_final(2));
        assert!(!ladder.is_final(1));
    }

    #[test]
    fn test_profit_invariant_across_inputs() {
        let payouts = [dec!(0.60), dec!(0.75), dec!(0.80), dec!(0.87), dec!(0.92), dec!(1)];
        let bases = [dec!(1), dec!(2.5), dec!(10), dec!(37.13)];
        for payout in payouts {
            for base in bases {
                for correction in [Decimal::ONE, LadderSpec::full_correction(payout), dec!(0.5)] {
                    let s = spec(base, payout, 6, correction);
                    let desired = s.desired_profit();
                    let ladder = StakeLadder::build(s).unwrap();
                    for k in 0..ladder.len() {
                        let profit = profit_if_won_at(&ladder, k);
                        if k == 0 {
                            // Entry level pays base * payout regardless of correction
                            assert_eq!(profit, round_money(base * payout, 2));
                        } else {
                            assert!(
                                (profit - desired).abs() <= dec!(0.01),
                                "payout={payout} base={base} k={k} profit={profit} desired={desired}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_correction_recovers_base_stake() {
        let payout = dec!(0.80);
        let ladder = StakeLadder::build(spec(dec!(10), payout, 4, LadderSpec::full_correction(payout))).unwrap();
        for k in 1..ladder.len() {
            let profit = profit_if_won_at(&ladder, k);
            assert!((profit - dec!(10)).abs() <= dec!(0.01), "k={k} profit={profit}");
        }
    }

    #[test]
    fn test_total_loss_is_sum_of_stakes() {
        let ladder = StakeLadder::build(spec(dec!(5), dec!(0.9), 5, Decimal::ONE)).unwrap();
        let sum: Decimal = ladder.stakes().iter().sum();
        assert_eq!(ladder.total_loss_if_all_lost(), sum);
    }

    #[test]
    fn test_single_level_has_no_recovery() {
        let ladder = StakeLadder::build(spec(dec!(10), dec!(0.85), 1, Decimal::ONE)).unwrap();
        assert_eq!(ladder.len(), 1);
        assert_eq!(ladder.total_loss_if_all_lost(), dec!(10));
        assert!(ladder.is_final(0));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(matches!(
            StakeLadder::build(spec(dec!(10), Decimal::ZERO, 3, Decimal::ONE)),
            Err(GaleError::InvalidPayout(_))
        ));
        assert!(matches!(
            StakeLadder::build(spec(dec!(10), dec!(1.2), 3, Decimal::ONE)),
            Err(GaleError::InvalidPayout(_))
        ));
        assert!(matches!(
            StakeLadder::build(spec(dec!(10), dec!(0.85), 0, Decimal::ONE)),
            Err(GaleError::InvalidLevels(0))
        ));
        assert!(matches!(
            StakeLadder::build(spec(dec!(-1), dec!(0.85), 2, Decimal::ONE)),
            Err(GaleError::InvalidStake(_))
        ));
        assert!(matches!(
            StakeLadder::build(spec(dec!(10), dec!(0.85), 2, dec!(-0.1))),
            Err(GaleError::InvalidCorrection(_))
        ));
    }

    #[test]
    fn test_deep_ladder_overflow_is_an_error() {
        let result = StakeLadder::build(spec(dec!(10), dec!(0.5), 120, Decimal::ONE));
        match result {
            Err(GaleError::LadderOverflow { level }) => assert!(level > 40 && level < 120, "level {level}"),
            other => panic!("expected overflow error, got {other:?}"),
        }

        let huge = spec(dec!(10), dec!(0.85), 3, Decimal::MAX);
        assert!(matches!(StakeLadder::build(huge), Err(GaleError::LadderOverflow { level: 0 })));
    }

    #[test]
    fn test_huge_level_count_fails_without_allocating() {
        let result = StakeLadder::build(spec(dec!(10), dec!(0.85), usize::MAX, Decimal::ONE));
        assert!(matches!(result, Err(GaleError::LadderOverflow { .. })));
    }

    #[test]
    fn test_ladder_spec_default() {
        let s = LadderSpec::default();
        assert_eq!(s.base_stake, dec!(10));
        assert_eq!(s.payout, dec!(0.85));
        assert_eq!(s.levels, 3);
        assert!(s.validate().is_ok());
    }
}
