//! Simple strategy: rank pairs by fee-adjusted annualized funding yield.
//!
//! Pure filtering and arithmetic over the live snapshot; no I/O. A pair
//! survives only if its rate and volume clear the floors and its spot leg is
//! actively tradeable.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exchange::InstrumentCatalog;
use crate::models::{spot_symbol_of, FundingRateData};
use crate::trading::FeeCalculator;

const HOURS_PER_YEAR: u32 = 8760;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedOpportunity {
    pub perp_symbol: String,
    pub spot_symbol: String,
    pub rate: Decimal,
    pub interval_hours: u32,
    pub volume_24h: Decimal,
    /// Rate minus the amortized round-trip fee.
    pub net_yield: Decimal,
    pub annualized_yield: Decimal,
    pub passes_filters: bool,
}

pub struct RankerConfig {
    pub min_funding_rate: Decimal,
    pub min_volume_24h: Decimal,
    pub min_holding_periods: u32,
}

/// Filter and score a funding snapshot, best first.
pub fn rank_opportunities(
    rates: &[FundingRateData],
    catalog: &InstrumentCatalog,
    fees: &FeeCalculator,
    config: &RankerConfig,
) -> Vec<RankedOpportunity> {
    let amortized_fee = fees.break_even_rate(config.min_holding_periods);

    let mut ranked: Vec<RankedOpportunity> = rates
        .iter()
        .filter_map(|data| {
            if data.rate < config.min_funding_rate {
                debug!(symbol = %data.symbol, rate = %data.rate, "below rate floor");
                return None;
            }
            if data.volume_24h < config.min_volume_24h {
                debug!(symbol = %data.symbol, volume = %data.volume_24h, "below volume floor");
                return None;
            }
            let spot_symbol = spot_symbol_of(&data.symbol)?;
            if !catalog.has_active_spot(spot_symbol) {
                debug!(symbol = %data.symbol, "no active spot leg");
                return None;
            }

            let net_yield = data.rate - amortized_fee;
            let interval = data.interval_hours.max(1);
            let periods_per_year = Decimal::from(HOURS_PER_YEAR / interval);
            Some(RankedOpportunity {
                perp_symbol: data.symbol.clone(),
                spot_symbol: spot_symbol.to_string(),
                rate: data.rate,
                interval_hours: data.interval_hours,
                volume_24h: data.volume_24h,
                net_yield,
                annualized_yield: net_yield * periods_per_year,
                passes_filters: net_yield > Decimal::ZERO,
            })
        })
        .collect();

    ranked.sort_by(|a, b| b.annualized_yield.cmp(&a.annualized_yield));
    ranked
}
