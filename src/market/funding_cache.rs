//! Funding-rate cache and its poller.
//!
//! The poller is the only writer: every interval it pulls the full linear
//! ticker set, stores one `FundingRateData` per perpetual, and publishes
//! mark/index prices into the ticker service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::exchange::{ExchangeClient, TickerData};
use crate::models::{spot_symbol_of, FundingRateData, OrderCategory};

use super::TickerService;

#[derive(Debug, Default)]
pub struct FundingCache {
    rates: RwLock<HashMap<String, FundingRateData>>,
}

impl FundingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// All cached rates, sorted descending by funding rate.
    pub fn all_rates(&self) -> Vec<FundingRateData> {
        let mut rates: Vec<_> = self.rates.read().values().cloned().collect();
        rates.sort_by(|a, b| b.rate.cmp(&a.rate));
        rates
    }

    pub fn rate(&self, symbol: &str) -> Option<FundingRateData> {
        self.rates.read().get(symbol).cloned()
    }

    pub fn is_stale(&self, symbol: &str, max_age_ms: i64, now_ms: i64) -> bool {
        match self.rate(symbol) {
            Some(data) => now_ms - data.updated_at_ms > max_age_ms,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.rates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.read().is_empty()
    }

    /// Ingest one ticker snapshot, publishing prices as a side effect.
    /// Returns how many perpetuals carried a funding rate.
    pub fn update_from_tickers(
        &self,
        tickers: &[TickerData],
        ticker_service: &TickerService,
        now_ms: i64,
    ) -> usize {
        let mut updated = 0;
        let mut rates = self.rates.write();

        for ticker in tickers {
            let Some(rate) = ticker.funding_rate else {
                continue;
            };
            let Some(mark_price) = ticker.mark_price else {
                debug!(symbol = %ticker.symbol, "ticker carries funding but no mark price");
                continue;
            };

            rates.insert(
                ticker.symbol.clone(),
                FundingRateData {
                    symbol: ticker.symbol.clone(),
                    rate,
                    next_funding_time_ms: ticker.next_funding_time_ms.unwrap_or(0),
                    interval_hours: ticker.funding_interval_hours.unwrap_or(8),
                    mark_price,
                    index_price: ticker.index_price,
                    volume_24h: ticker.volume_24h.unwrap_or_default(),
                    updated_at_ms: now_ms,
                },
            );
            updated += 1;

            ticker_service.publish(&ticker.symbol, mark_price, now_ms);
            if let (Some(index), Some(spot)) =
                (ticker.index_price, spot_symbol_of(&ticker.symbol))
            {
                ticker_service.publish(spot, index, now_ms);
            }
        }

        updated
    }
}

/// Polls `fetch_tickers(linear)` on a fixed interval and feeds the cache.
pub struct FundingPoller {
    client: Arc<dyn ExchangeClient>,
    cache: Arc<FundingCache>,
    ticker_service: Arc<TickerService>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl FundingPoller {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        cache: Arc<FundingCache>,
        ticker_service: Arc<TickerService>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            ticker_service,
            clock,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("funding poller stopping");
                        return;
                    }
                }
            }
        }
    }

    pub async fn poll_once(&self) {
        match self.client.fetch_tickers(OrderCategory::Linear).await {
            Ok(tickers) => {
                let updated = self.cache.update_from_tickers(
                    &tickers,
                    &self.ticker_service,
                    self.clock.now_ms(),
                );
                debug!(tickers = tickers.len(), updated, "funding poll complete");
            }
            Err(e) => warn!(error = %e, "funding poll failed"),
        }
    }
}
