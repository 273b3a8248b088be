//! Exchange client capability.
//!
//! The engine talks to the venue exclusively through [`ExchangeClient`];
//! everything above this boundary works with normalized shapes and exact
//! decimals. The concrete REST adapter lives in [`bybit`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::models::{
    HistoricalFundingRate, InstrumentInfo, OhlcvCandle, OrderCategory, OrderRequest, OrderResult,
};

pub mod bybit;

pub use bybit::BybitClient;

/// Normalized ticker row as returned by `fetch_tickers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerData {
    /// Canonical symbol (`BTC/USDT` spot, `BTC/USDT:USDT` perp).
    pub symbol: String,
    pub last: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub next_funding_time_ms: Option<i64>,
    pub funding_interval_hours: Option<u32>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
}

/// Normalized market catalog entry as returned by `fetch_markets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEntry {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub spot: bool,
    pub linear: bool,
    pub active: bool,
    pub info: InstrumentInfo,
}

/// Normalized account snapshot from the balance endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_equity: Decimal,
    pub total_available: Decimal,
    /// Account maintenance-margin rate; the margin monitor reads this fresh
    /// every cycle rather than caching it.
    pub account_mm_rate: Decimal,
}

/// Async capability over the venue. Auth and request-level rate limiting are
/// the adapter's concern; callers only see normalized shapes and the
/// [`ExchangeError`] taxonomy.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_tickers(&self, category: OrderCategory)
        -> Result<Vec<TickerData>, ExchangeError>;

    async fn fetch_markets(&self) -> Result<Vec<MarketEntry>, ExchangeError>;

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        category: OrderCategory,
    ) -> Result<bool, ExchangeError>;

    /// Newest-first page of funding history ending at `end_ms` (now if
    /// absent). The venue rejects start-only queries; callers must never
    /// need one.
    async fn fetch_funding_rate_history(
        &self,
        symbol: &str,
        limit: u32,
        end_ms: Option<i64>,
    ) -> Result<Vec<HistoricalFundingRate>, ExchangeError>;

    /// Newest-first page of candles ending at `end_ms` (now if absent).
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        end_ms: Option<i64>,
    ) -> Result<Vec<OhlcvCandle>, ExchangeError>;
}

/// In-memory snapshot of the market catalog, refreshed from
/// `fetch_markets()`. The position manager resolves instrument limits here
/// and the rankers check spot-leg eligibility.
#[derive(Debug, Default)]
pub struct InstrumentCatalog {
    inner: RwLock<HashMap<String, MarketEntry>>,
}

impl InstrumentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&self, entries: Vec<MarketEntry>) {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            map.insert(entry.symbol.clone(), entry);
        }
        *self.inner.write() = map;
    }

    pub fn instrument(&self, symbol: &str) -> Option<InstrumentInfo> {
        self.inner.read().get(symbol).map(|e| e.info.clone())
    }

    /// True when the symbol exists, is a spot market, and is tradeable.
    pub fn has_active_spot(&self, spot_symbol: &str) -> bool {
        self.inner
            .read()
            .get(spot_symbol)
            .map(|e| e.spot && e.active)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(symbol: &str, spot: bool, active: bool) -> MarketEntry {
        MarketEntry {
            symbol: symbol.to_string(),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            spot,
            linear: !spot,
            active,
            info: InstrumentInfo {
                min_qty: dec!(0.001),
                qty_step: dec!(0.001),
                min_notional: dec!(5),
                tick_size: dec!(0.1),
            },
        }
    }

    #[test]
    fn catalog_spot_eligibility() {
        let catalog = InstrumentCatalog::new();
        catalog.refresh(vec![
            entry("BTC/USDT", true, true),
            entry("ETH/USDT", true, false),
            entry("BTC/USDT:USDT", false, true),
        ]);

        assert!(catalog.has_active_spot("BTC/USDT"));
        assert!(!catalog.has_active_spot("ETH/USDT"), "inactive spot is ineligible");
        assert!(!catalog.has_active_spot("BTC/USDT:USDT"), "perp is not a spot");
        assert!(!catalog.has_active_spot("SOL/USDT"), "unknown symbol");
    }

    #[test]
    fn catalog_refresh_replaces_snapshot() {
        let catalog = InstrumentCatalog::new();
        catalog.refresh(vec![entry("BTC/USDT", true, true)]);
        assert_eq!(catalog.len(), 1);

        catalog.refresh(vec![entry("ETH/USDT", true, true)]);
        assert!(catalog.instrument("BTC/USDT").is_none());
        assert!(catalog.instrument("ETH/USDT").is_some());
    }
}
