//! Latest-price service.
//!
//! One entry per symbol, each behind its own lock so a publish of one symbol
//! never contends with reads of another. Mark prices are published under the
//! perp symbol and index prices under the derived spot symbol.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricePoint {
    pub price: Decimal,
    pub updated_at_ms: i64,
}

#[derive(Debug, Default)]
pub struct TickerService {
    entries: RwLock<HashMap<String, Arc<Mutex<PricePoint>>>>,
}

impl TickerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, symbol: &str, price: Decimal, updated_at_ms: i64) {
        if let Some(entry) = self.entries.read().get(symbol) {
            let mut point = entry.lock();
            point.price = price;
            point.updated_at_ms = updated_at_ms;
            return;
        }

        let mut map = self.entries.write();
        map.entry(symbol.to_string())
            .and_modify(|e| {
                let mut point = e.lock();
                point.price = price;
                point.updated_at_ms = updated_at_ms;
            })
            .or_insert_with(|| {
                Arc::new(Mutex::new(PricePoint {
                    price,
                    updated_at_ms,
                }))
            });
    }

    pub fn price(&self, symbol: &str) -> Option<PricePoint> {
        self.entries.read().get(symbol).map(|e| *e.lock())
    }

    /// True when the symbol has no entry or the entry is older than
    /// `max_age_ms` relative to `now_ms`.
    pub fn is_stale(&self, symbol: &str, max_age_ms: i64, now_ms: i64) -> bool {
        match self.price(symbol) {
            Some(point) => now_ms - point.updated_at_ms > max_age_ms,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn publish_then_read() {
        let service = TickerService::new();
        service.publish("BTC/USDT:USDT", dec!(50000), 1_000);
        service.publish("BTC/USDT", dec!(49990), 1_000);

        assert_eq!(service.price("BTC/USDT:USDT").unwrap().price, dec!(50000));
        assert_eq!(service.price("BTC/USDT").unwrap().price, dec!(49990));
        assert!(service.price("ETH/USDT").is_none());
    }

    #[test]
    fn republish_overwrites_in_place() {
        let service = TickerService::new();
        service.publish("BTC/USDT", dec!(100), 1_000);
        service.publish("BTC/USDT", dec!(101), 2_000);

        let point = service.price("BTC/USDT").unwrap();
        assert_eq!(point.price, dec!(101));
        assert_eq!(point.updated_at_ms, 2_000);
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn staleness_by_age_and_absence() {
        let service = TickerService::new();
        assert!(service.is_stale("BTC/USDT", 60_000, 1_000_000));

        service.publish("BTC/USDT", dec!(100), 1_000_000);
        assert!(!service.is_stale("BTC/USDT", 60_000, 1_050_000));
        assert!(service.is_stale("BTC/USDT", 60_000, 1_061_000));
    }
}
