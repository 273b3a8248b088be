//! Historical data acquisition.
//!
//! Startup backfill walks backward from the oldest stored sample using
//! end-anchored pages, so a restart resumes exactly where the last run
//! stopped. Per-cycle incremental updates only ever append. Every request
//! carries an end time; the venue rejects start-only queries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::HistorySettings;
use crate::error::ExchangeError;
use crate::exchange::ExchangeClient;
use crate::market::FundingCache;
use crate::models::{FundingRateData, HistoryKind, TrackedPair};

use super::store::HistoricalStore;

const FUNDING_PAGE_LIMIT: u32 = 200;
const OHLCV_PAGE_LIMIT: u32 = 1000;

const MS_PER_DAY: i64 = 86_400_000;

/// `(completed, total, current_symbol)` callback for startup progress.
pub type FetchProgress = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

pub struct HistoricalFetcher {
    client: Arc<dyn ExchangeClient>,
    store: Arc<HistoricalStore>,
    settings: HistorySettings,
    clock: Arc<dyn Clock>,
    /// Live cache, when available, supplies the current funding interval for
    /// history rows (the venue omits it from history responses).
    funding_cache: Option<Arc<FundingCache>>,
    progress: Option<FetchProgress>,
}

impl HistoricalFetcher {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: Arc<HistoricalStore>,
        settings: HistorySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            store,
            settings,
            clock,
            funding_cache: None,
            progress: None,
        }
    }

    pub fn with_funding_cache(mut self, cache: Arc<FundingCache>) -> Self {
        self.funding_cache = Some(cache);
        self
    }

    pub fn with_progress(mut self, progress: FetchProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report_progress(&self, completed: usize, total: usize, symbol: &str) {
        if let Some(cb) = &self.progress {
            cb(completed, total, symbol);
        }
    }

    fn interval_hours_for(&self, symbol: &str) -> Option<u32> {
        self.funding_cache
            .as_ref()
            .and_then(|c| c.rate(symbol))
            .map(|r| r.interval_hours)
    }

    /// Retry a page fetch on transient failures: exponential backoff
    /// 1s, 2s, 4s, 8s, 16s; rate limits multiply the delay by 3.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    let delay_secs = self.settings.retry_base_delay_secs
                        * f64::from(1u32 << attempt)
                        * f64::from(e.backoff_multiplier());
                    warn!(what, attempt, delay_secs, error = %e, "fetch failed, backing off");
                    sleep(Duration::from_secs_f64(delay_secs)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until every symbol has at least `lookback_days` of funding and
    /// candle history (or the venue has no more). A symbol that exhausts
    /// retries is skipped with a warning; the gap stays visible in
    /// `data_status` and the next startup resumes it.
    pub async fn ensure_data_ready(&self, symbols: &[String], lookback_days: i64) -> Result<()> {
        let total = symbols.len();
        info!(total, lookback_days, "ensuring historical data is ready");

        for (index, symbol) in symbols.iter().enumerate() {
            self.report_progress(index, total, symbol);

            if let Err(e) = self.backfill_funding(symbol, lookback_days).await {
                warn!(symbol, error = %e, "funding backfill abandoned for symbol");
            }
            if let Err(e) = self.backfill_ohlcv(symbol, lookback_days).await {
                warn!(symbol, error = %e, "ohlcv backfill abandoned for symbol");
            }
        }

        self.report_progress(total, total, "");
        self.store.set_last_sync_ms(self.clock.now_ms()).await?;

        let status = self.store.data_status().await?;
        info!(
            total_records = status.total_records,
            earliest_ms = ?status.earliest_ms,
            latest_ms = ?status.latest_ms,
            "historical data ready"
        );
        Ok(())
    }

    async fn backfill_funding(&self, symbol: &str, lookback_days: i64) -> Result<()> {
        let now = self.clock.now_ms();
        let target = now - lookback_days * MS_PER_DAY;
        let state = self.store.get_fetch_state(symbol, HistoryKind::Funding).await?;
        let mut cursor = state.as_ref().map(|s| s.earliest_ms).unwrap_or(now);

        if state.is_some() && cursor <= target {
            debug!(symbol, "funding history already covers lookback window");
            return Ok(());
        }

        let interval_hint = self.interval_hours_for(symbol);
        while cursor > target {
            let batch = self
                .with_retries("funding history page", || {
                    self.client
                        .fetch_funding_rate_history(symbol, FUNDING_PAGE_LIMIT, Some(cursor))
                })
                .await?;
            if batch.is_empty() {
                debug!(symbol, cursor, "venue funding history exhausted");
                break;
            }

            // Pages arrive newest-first; persist oldest-first.
            let mut page = batch;
            page.reverse();
            if let Some(hours) = interval_hint {
                for record in &mut page {
                    record.interval_hours = hours;
                }
            }

            let oldest = page.first().map(|r| r.timestamp_ms).unwrap_or(cursor);
            let inserted = self
                .store
                .store_funding_batch(symbol, &page, self.clock.now_ms())
                .await?;
            debug!(symbol, oldest, rows = page.len(), inserted, "funding page persisted");

            if oldest >= cursor {
                break; // no backward progress, venue start reached
            }
            cursor = oldest - 1;

            // Safety margin above the client's own rate limiter.
            sleep(Duration::from_millis(self.settings.fetch_batch_delay_ms)).await;
        }
        Ok(())
    }

    async fn backfill_ohlcv(&self, symbol: &str, lookback_days: i64) -> Result<()> {
        let now = self.clock.now_ms();
        let target = now - lookback_days * MS_PER_DAY;
        let state = self.store.get_fetch_state(symbol, HistoryKind::Ohlcv).await?;
        let mut cursor = state.as_ref().map(|s| s.earliest_ms).unwrap_or(now);

        if state.is_some() && cursor <= target {
            debug!(symbol, "candle history already covers lookback window");
            return Ok(());
        }

        while cursor > target {
            let timeframe = self.settings.ohlcv_interval.clone();
            let batch = self
                .with_retries("ohlcv page", || {
                    self.client
                        .fetch_ohlcv(symbol, &timeframe, OHLCV_PAGE_LIMIT, Some(cursor))
                })
                .await?;
            if batch.is_empty() {
                debug!(symbol, cursor, "venue candle history exhausted");
                break;
            }

            let mut page = batch;
            page.reverse();

            let oldest = page.first().map(|c| c.timestamp_ms).unwrap_or(cursor);
            let inserted = self
                .store
                .store_ohlcv_batch(symbol, &page, self.clock.now_ms())
                .await?;
            debug!(symbol, oldest, rows = page.len(), inserted, "candle page persisted");

            if oldest >= cursor {
                break;
            }
            cursor = oldest - 1;

            sleep(Duration::from_millis(self.settings.fetch_batch_delay_ms)).await;
        }
        Ok(())
    }

    /// Forward-only top-up, called once per cycle. Fetches the most recent
    /// page (end-anchored, never a bare start time) and keeps only rows
    /// newer than the stored cursor.
    pub async fn incremental_update(&self, symbols: &[String]) -> Result<()> {
        let now = self.clock.now_ms();
        let mut new_funding = 0usize;
        let mut new_candles = 0usize;

        for symbol in symbols {
            match self.incremental_funding(symbol, now).await {
                Ok(n) => new_funding += n,
                Err(e) => warn!(symbol, error = %e, "incremental funding update failed"),
            }
            match self.incremental_ohlcv(symbol, now).await {
                Ok(n) => new_candles += n,
                Err(e) => warn!(symbol, error = %e, "incremental candle update failed"),
            }
        }

        self.store.set_last_sync_ms(now).await?;
        info!(
            symbols = symbols.len(),
            new_funding, new_candles, "incremental history update complete"
        );
        Ok(())
    }

    async fn incremental_funding(&self, symbol: &str, now: i64) -> Result<usize> {
        let since = self
            .store
            .get_fetch_state(symbol, HistoryKind::Funding)
            .await?
            .map(|s| s.latest_ms + 1)
            .unwrap_or(i64::MIN);

        let batch = self
            .with_retries("incremental funding page", || {
                self.client
                    .fetch_funding_rate_history(symbol, FUNDING_PAGE_LIMIT, Some(now))
            })
            .await?;

        let interval_hint = self.interval_hours_for(symbol);
        let mut fresh: Vec<_> = batch
            .into_iter()
            .filter(|r| r.timestamp_ms >= since)
            .collect();
        fresh.reverse();
        if let Some(hours) = interval_hint {
            for record in &mut fresh {
                record.interval_hours = hours;
            }
        }

        if fresh.is_empty() {
            debug!(symbol, "no new funding samples");
            return Ok(0);
        }
        let inserted = self.store.store_funding_batch(symbol, &fresh, now).await?;
        debug!(symbol, inserted, "incremental funding persisted");
        Ok(inserted)
    }

    async fn incremental_ohlcv(&self, symbol: &str, now: i64) -> Result<usize> {
        let since = self
            .store
            .get_fetch_state(symbol, HistoryKind::Ohlcv)
            .await?
            .map(|s| s.latest_ms + 1)
            .unwrap_or(i64::MIN);

        let timeframe = self.settings.ohlcv_interval.clone();
        let batch = self
            .with_retries("incremental ohlcv page", || {
                self.client.fetch_ohlcv(symbol, &timeframe, 200, Some(now))
            })
            .await?;

        let mut fresh: Vec<_> = batch
            .into_iter()
            .filter(|c| c.timestamp_ms >= since)
            .collect();
        fresh.reverse();

        if fresh.is_empty() {
            debug!(symbol, "no new candles");
            return Ok(0);
        }
        let inserted = self.store.store_ohlcv_batch(symbol, &fresh, now).await?;
        debug!(symbol, inserted, "incremental candles persisted");
        Ok(inserted)
    }

    /// Symbols currently on the active tracked-pair roster.
    pub async fn tracked_symbols(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .get_tracked_pairs(true)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect())
    }

    /// Re-evaluate the tracked-pair roster: the top `top_pairs_count`
    /// perpetuals by 24h volume stay active, everything else is retired
    /// (history retained).
    pub async fn refresh_tracked_pairs(&self, rates: &[FundingRateData]) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut by_volume: Vec<_> = rates.iter().collect();
        by_volume.sort_by(|a, b| b.volume_24h.cmp(&a.volume_24h));
        by_volume.truncate(self.settings.top_pairs_count);

        let mut active = Vec::with_capacity(by_volume.len());
        for data in &by_volume {
            self.store
                .upsert_tracked_pair(&TrackedPair {
                    symbol: data.symbol.clone(),
                    added_at_ms: now,
                    last_volume_24h: data.volume_24h,
                    active: true,
                })
                .await?;
            active.push(data.symbol.clone());
        }

        for pair in self.store.get_tracked_pairs(false).await? {
            if pair.active && !active.contains(&pair.symbol) {
                self.store.set_pair_active(&pair.symbol, false).await?;
                debug!(symbol = %pair.symbol, "pair dropped from tracked roster");
            }
        }

        info!(tracked = active.len(), "tracked-pair roster refreshed");
        Ok(active)
    }
}
