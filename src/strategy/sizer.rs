//! Score-driven position sizing.
//!
//! Active only when enabled alongside the composite strategy: the signal
//! score interpolates an allocation fraction, and the portfolio exposure cap
//! is enforced before the exchange-constraint sizing ever runs. Exchange
//! minimums, steps and notionals stay in the position sizer - nothing is
//! validated twice.

use rust_decimal::Decimal;
use tracing::debug;

use crate::config::SizingSettings;

pub struct DynamicSizer {
    config: SizingSettings,
}

impl DynamicSizer {
    pub fn new(config: SizingSettings) -> Self {
        Self { config }
    }

    /// Map a composite score to a USD budget for one new position.
    /// `None` means the portfolio exposure cap leaves no room at all; the
    /// caller stops trying candidates for this cycle.
    pub fn compute_signal_budget(
        &self,
        score: Decimal,
        max_position_size_usd: Decimal,
        current_exposure: Decimal,
    ) -> Option<Decimal> {
        let remaining = self.config.max_portfolio_exposure - current_exposure;
        if remaining <= Decimal::ZERO {
            debug!(%current_exposure, "portfolio exposure cap reached");
            return None;
        }

        let score = score.clamp(Decimal::ZERO, Decimal::ONE);
        let fraction = self.config.min_allocation_fraction
            + (self.config.max_allocation_fraction - self.config.min_allocation_fraction) * score;
        let raw_budget = max_position_size_usd * fraction;

        Some(raw_budget.min(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sizer(max_exposure: Decimal) -> DynamicSizer {
        DynamicSizer::new(SizingSettings {
            enabled: true,
            min_allocation_fraction: dec!(0.3),
            max_allocation_fraction: dec!(1.0),
            max_portfolio_exposure: max_exposure,
        })
    }

    #[test]
    fn score_interpolates_the_fraction() {
        let sizer = sizer(dec!(100000));
        // Score 0 -> min fraction.
        assert_eq!(
            sizer.compute_signal_budget(dec!(0), dec!(1000), dec!(0)),
            Some(dec!(300))
        );
        // Score 1 -> max fraction.
        assert_eq!(
            sizer.compute_signal_budget(dec!(1), dec!(1000), dec!(0)),
            Some(dec!(1000))
        );
        // Score 0.5 -> halfway: 0.3 + 0.7*0.5 = 0.65.
        assert_eq!(
            sizer.compute_signal_budget(dec!(0.5), dec!(1000), dec!(0)),
            Some(dec!(650))
        );
    }

    #[test]
    fn remaining_exposure_caps_the_budget() {
        let sizer = sizer(dec!(2000));
        // 1_600 already deployed leaves 400.
        assert_eq!(
            sizer.compute_signal_budget(dec!(1), dec!(1000), dec!(1600)),
            Some(dec!(400))
        );
    }

    #[test]
    fn exhausted_exposure_returns_none() {
        let sizer = sizer(dec!(2000));
        assert_eq!(
            sizer.compute_signal_budget(dec!(1), dec!(1000), dec!(2000)),
            None
        );
        assert_eq!(
            sizer.compute_signal_budget(dec!(1), dec!(1000), dec!(2500)),
            None
        );
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let sizer = sizer(dec!(100000));
        assert_eq!(
            sizer.compute_signal_budget(dec!(1.5), dec!(1000), dec!(0)),
            Some(dec!(1000))
        );
        assert_eq!(
            sizer.compute_signal_budget(dec!(-0.2), dec!(1000), dec!(0)),
            Some(dec!(300))
        );
    }
}
