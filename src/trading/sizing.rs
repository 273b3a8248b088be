//! Quantity sizing against exchange constraints, and the delta check that
//! guards the two-leg fill.
//!
//! Rounding is always down: a quantity is truncated to the instrument step,
//! never bumped over it. Matched legs share one quantity quantized to the
//! coarser of the two steps.

use rust_decimal::Decimal;

use crate::models::InstrumentInfo;

/// Truncate `quantity` down to a whole number of `step`s.
pub fn round_down_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    let steps = (quantity / step).floor();
    steps * step
}

/// Size a single-leg order: spend at most `min(balance, max_position_usd)`,
/// quantize down, reject anything under the instrument minimums.
pub fn calculate_quantity(
    balance: Decimal,
    price: Decimal,
    instrument: &InstrumentInfo,
    max_position_usd: Decimal,
) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let budget = balance.min(max_position_usd);
    if budget <= Decimal::ZERO {
        return None;
    }

    let quantity = round_down_to_step(budget / price, instrument.qty_step);
    if quantity < instrument.min_qty || quantity <= Decimal::ZERO {
        return None;
    }
    if quantity * price < instrument.min_notional {
        return None;
    }
    Some(quantity)
}

/// Size the matched pair: both legs get the identical quantity, quantized to
/// the coarser step and validated against the stricter minimums.
pub fn calculate_matching_quantity(
    spot: &InstrumentInfo,
    perp: &InstrumentInfo,
    price: Decimal,
    budget: Decimal,
) -> Option<Decimal> {
    let combined = InstrumentInfo {
        min_qty: spot.min_qty.max(perp.min_qty),
        qty_step: spot.qty_step.max(perp.qty_step),
        min_notional: spot.min_notional.max(perp.min_notional),
        tick_size: spot.tick_size.max(perp.tick_size),
    };
    calculate_quantity(budget, price, &combined, budget)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaCheck {
    pub drift_pct: Decimal,
    pub within_tolerance: bool,
}

/// Relative mismatch between the two filled legs.
pub fn validate_delta(spot_filled: Decimal, perp_filled: Decimal, tolerance: Decimal) -> DeltaCheck {
    let larger = spot_filled.max(perp_filled);
    if larger <= Decimal::ZERO {
        return DeltaCheck {
            drift_pct: Decimal::ONE,
            within_tolerance: false,
        };
    }
    let drift_pct = (spot_filled - perp_filled).abs() / larger;
    DeltaCheck {
        drift_pct,
        within_tolerance: drift_pct <= tolerance,
    }
}
