//! Look-ahead guard for backtests.
//!
//! Every range query through this wrapper is capped at the simulated
//! present, whatever the caller asked for. The backtest engine hands this
//! wrapper, never the raw store, to the signal engine.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::clock::{Clock, SimClock};
use crate::models::{HistoricalFundingRate, OhlcvCandle};

use super::store::{HistoricalStore, HistoryReader};

pub struct TimeBoundedHistory {
    inner: Arc<HistoricalStore>,
    sim_clock: SimClock,
}

impl TimeBoundedHistory {
    pub fn new(inner: Arc<HistoricalStore>, sim_clock: SimClock) -> Self {
        Self { inner, sim_clock }
    }

    fn cap(&self, until_ms: Option<i64>) -> Option<i64> {
        let now = self.sim_clock.now_ms();
        Some(match until_ms {
            Some(until) => until.min(now),
            None => now,
        })
    }
}

#[async_trait]
impl HistoryReader for TimeBoundedHistory {
    async fn funding_rates(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<HistoricalFundingRate>> {
        self.inner
            .funding_rates(symbol, since_ms, self.cap(until_ms))
            .await
    }

    async fn ohlcv_candles(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<OhlcvCandle>> {
        self.inner
            .ohlcv_candles(symbol, since_ms, self.cap(until_ms))
            .await
    }
}
