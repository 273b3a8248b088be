//! Shared domain types for the funding-rate arbitrage engine.
//!
//! Every price, quantity, rate, fee and balance in the system is a
//! `rust_decimal::Decimal`. Floats exist only at the exchange wire boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Delimiter between the spot pair and the settle currency in a canonical
/// perpetual symbol, e.g. `BTC/USDT:USDT`.
pub const PERP_DELIMITER: char = ':';

/// Derive the spot symbol (`BTC/USDT`) from a canonical perpetual symbol
/// (`BTC/USDT:USDT`) by splitting on the delimiter. Returns `None` for a
/// symbol that is not in perpetual form.
pub fn spot_symbol_of(perp_symbol: &str) -> Option<&str> {
    let (spot, settle) = perp_symbol.split_once(PERP_DELIMITER)?;
    if spot.is_empty() || settle.is_empty() {
        return None;
    }
    Some(spot)
}

/// True if the symbol is in canonical perpetual form.
pub fn is_perp_symbol(symbol: &str) -> bool {
    spot_symbol_of(symbol).is_some()
}

/// Base asset of a spot or perpetual symbol (`BTC` from `BTC/USDT:USDT`).
pub fn base_asset_of(symbol: &str) -> Option<&str> {
    let pair = spot_symbol_of(symbol).unwrap_or(symbol);
    let (base, _quote) = pair.split_once('/')?;
    Some(base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Venue product category a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderCategory {
    Spot,
    Linear,
}

impl OrderCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Linear => "linear",
        }
    }
}

/// Exchange-imposed order constraints for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub min_qty: Decimal,
    pub qty_step: Decimal,
    pub min_notional: Decimal,
    pub tick_size: Decimal,
}

/// Latest funding snapshot for one perpetual, as polled from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateData {
    pub symbol: String,
    pub rate: Decimal,
    pub next_funding_time_ms: i64,
    /// Funding interval in hours; per-record because the venue changes it
    /// over time for the same pair (1, 2, 4 or 8).
    pub interval_hours: u32,
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
    pub volume_24h: Decimal,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One delta-neutral position: long spot + short perp of equal base quantity.
/// Once `status` is `Closed` the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub spot_symbol: String,
    pub perp_symbol: String,
    /// Base quantity, applies to both legs.
    pub quantity: Decimal,
    pub spot_entry_price: Decimal,
    pub perp_entry_price: Decimal,
    pub opened_at_ms: i64,
    pub status: PositionStatus,
}

impl Position {
    /// Notional exposure proxy used by the portfolio cap: entry-priced perp leg.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.perp_entry_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub category: OrderCategory,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal, category: OrderCategory) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            category,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub filled_qty: Decimal,
    pub filled_price: Decimal,
    pub fee: Decimal,
    pub timestamp_ms: i64,
    pub is_simulated: bool,
}

/// One funding transfer applied to an open position. `amount` is signed:
/// positive is income for the short-perp side when the rate is positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub timestamp_ms: i64,
    pub rate: Decimal,
    pub mark_price: Decimal,
    pub amount: Decimal,
}

/// Accounting record the PnL tracker keeps per position id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionPnl {
    pub position_id: String,
    pub entry_fee: Decimal,
    pub exit_fee: Option<Decimal>,
    pub funding_payments: Vec<FundingPayment>,
    pub spot_exit_price: Option<Decimal>,
    pub perp_exit_price: Option<Decimal>,
    pub closed_at_ms: Option<i64>,
}

impl PositionPnl {
    pub fn funding_total(&self) -> Decimal {
        self.funding_payments.iter().map(|p| p.amount).sum()
    }
}

/// Persisted funding sample. `(symbol, timestamp_ms)` is the natural dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalFundingRate {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub rate: Decimal,
    pub interval_hours: u32,
}

/// Persisted candle. `(symbol, timestamp_ms)` is the natural dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OhlcvCandle {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Which historical series a fetch cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Funding,
    Ohlcv,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Funding => "funding",
            Self::Ohlcv => "ohlcv",
        }
    }
}

/// Per `(symbol, kind)` fetch cursor enabling backward resume and forward
/// incremental updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchState {
    pub symbol: String,
    pub kind: HistoryKind,
    pub earliest_ms: i64,
    pub latest_ms: i64,
    pub last_fetched_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPair {
    pub symbol: String,
    pub added_at_ms: i64,
    pub last_volume_24h: Decimal,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Simple,
    Composite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_derivation_splits_on_delimiter() {
        assert_eq!(spot_symbol_of("BTC/USDT:USDT"), Some("BTC/USDT"));
        assert_eq!(spot_symbol_of("BTC/USDT"), None);
        assert_eq!(spot_symbol_of(":USDT"), None);
        assert!(is_perp_symbol("ETH/USDT:USDT"));
        assert!(!is_perp_symbol("ETH/USDT"));
    }

    #[test]
    fn base_asset_extraction() {
        assert_eq!(base_asset_of("BTC/USDT:USDT"), Some("BTC"));
        assert_eq!(base_asset_of("SOL/USDT"), Some("SOL"));
        assert_eq!(base_asset_of("BTCUSDT"), None);
    }
}
