//! Fee math for the two-leg carry trade.
//!
//! A profitable rate on paper must survive the round trip in reality: entry
//! crosses the spread on both legs, exit crosses it again, and the funding
//! collected over the minimum holding horizon has to pay for all four.

use rust_decimal::Decimal;

use crate::config::FeeSettings;
use crate::models::OrderCategory;

#[derive(Debug, Clone)]
pub struct FeeCalculator {
    fees: FeeSettings,
}

impl FeeCalculator {
    pub fn new(fees: FeeSettings) -> Self {
        Self { fees }
    }

    pub fn taker_rate(&self, category: OrderCategory) -> Decimal {
        match category {
            OrderCategory::Spot => self.fees.spot_taker,
            OrderCategory::Linear => self.fees.perp_taker,
        }
    }

    /// Taker fee in quote units for one fill.
    pub fn order_fee(&self, quantity: Decimal, price: Decimal, category: OrderCategory) -> Decimal {
        quantity * price * self.taker_rate(category)
    }

    /// Opening both legs at `price`: spot taker + perp taker.
    pub fn entry_fee(&self, quantity: Decimal, price: Decimal) -> Decimal {
        quantity * price * (self.fees.spot_taker + self.fees.perp_taker)
    }

    /// Full round trip as a fraction of notional: entry and exit on both legs.
    pub fn round_trip_fee_pct(&self) -> Decimal {
        Decimal::TWO * (self.fees.spot_taker + self.fees.perp_taker)
    }

    /// Funding rate per period at which collected funding equals the round
    /// trip fee over the minimum holding horizon.
    pub fn break_even_rate(&self, min_holding_periods: u32) -> Decimal {
        self.round_trip_fee_pct() / Decimal::from(min_holding_periods.max(1))
    }

    /// Signed funding transfer: a short perp earns a positive rate.
    pub fn funding_payment(
        &self,
        quantity: Decimal,
        mark_price: Decimal,
        rate: Decimal,
        is_short: bool,
    ) -> Decimal {
        let gross = quantity * mark_price * rate;
        if is_short { gross } else { -gross }
    }
}
