//! Embedded time-series store.
//!
//! WAL journal mode gives concurrent readers over a single serialized
//! writer. Inserts are insert-or-ignore on the `(symbol, timestamp_ms)`
//! composite key, so re-fetching an already-covered range is a no-op.
//! Decimals persist as canonical strings; timestamps as signed 64-bit
//! milliseconds.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::{FetchState, HistoricalFundingRate, HistoryKind, OhlcvCandle, TrackedPair};

/// Range reads shared by the signal engine and the backtest wrapper.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn funding_rates(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<HistoricalFundingRate>>;

    async fn ohlcv_candles(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<OhlcvCandle>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStatus {
    pub pair_count: usize,
    pub total_records: u64,
    pub earliest_ms: Option<i64>,
    pub latest_ms: Option<i64>,
    pub last_sync_ms: Option<i64>,
}

#[derive(Clone)]
pub struct HistoricalStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoricalStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open historical db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS funding_rates (
                symbol TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                rate TEXT NOT NULL,
                interval_hours INTEGER NOT NULL,
                PRIMARY KEY (symbol, timestamp_ms)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ohlcv_candles (
                symbol TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, timestamp_ms)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS fetch_state (
                symbol TEXT NOT NULL,
                data_type TEXT NOT NULL,
                earliest_ms INTEGER NOT NULL,
                latest_ms INTEGER NOT NULL,
                last_fetched_at_ms INTEGER NOT NULL,
                PRIMARY KEY (symbol, data_type)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tracked_pairs (
                symbol TEXT PRIMARY KEY,
                added_at_ms INTEGER NOT NULL,
                last_volume_24h TEXT NOT NULL,
                active INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a funding batch and advance the fetch cursor in one
    /// transaction. Returns the number of novel rows.
    pub async fn store_funding_batch(
        &self,
        symbol: &str,
        batch: &[HistoricalFundingRate],
        now_ms: i64,
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let batch_earliest = batch.iter().map(|r| r.timestamp_ms).min().unwrap_or(now_ms);
        let batch_latest = batch.iter().map(|r| r.timestamp_ms).max().unwrap_or(now_ms);

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO funding_rates (symbol, timestamp_ms, rate, interval_hours)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in batch {
                inserted += stmt.execute(params![
                    &record.symbol,
                    record.timestamp_ms,
                    record.rate.to_string(),
                    record.interval_hours,
                ])?;
            }
        }
        upsert_fetch_state_tx(&tx, symbol, HistoryKind::Funding, batch_earliest, batch_latest, now_ms)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Candle counterpart of [`store_funding_batch`].
    pub async fn store_ohlcv_batch(
        &self,
        symbol: &str,
        batch: &[OhlcvCandle],
        now_ms: i64,
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let batch_earliest = batch.iter().map(|c| c.timestamp_ms).min().unwrap_or(now_ms);
        let batch_latest = batch.iter().map(|c| c.timestamp_ms).max().unwrap_or(now_ms);

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO ohlcv_candles
                 (symbol, timestamp_ms, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for candle in batch {
                inserted += stmt.execute(params![
                    &candle.symbol,
                    candle.timestamp_ms,
                    candle.open.to_string(),
                    candle.high.to_string(),
                    candle.low.to_string(),
                    candle.close.to_string(),
                    candle.volume.to_string(),
                ])?;
            }
        }
        upsert_fetch_state_tx(&tx, symbol, HistoryKind::Ohlcv, batch_earliest, batch_latest, now_ms)?;
        tx.commit()?;
        Ok(inserted)
    }

    pub async fn get_funding_rates(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<HistoricalFundingRate>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timestamp_ms, rate, interval_hours FROM funding_rates
             WHERE symbol = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
             ORDER BY timestamp_ms ASC",
        )?;
        let rows = stmt.query_map(
            params![symbol, since_ms.unwrap_or(i64::MIN), until_ms.unwrap_or(i64::MAX)],
            funding_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_ohlcv_candles(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<OhlcvCandle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timestamp_ms, open, high, low, close, volume FROM ohlcv_candles
             WHERE symbol = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
             ORDER BY timestamp_ms ASC",
        )?;
        let rows = stmt.query_map(
            params![symbol, since_ms.unwrap_or(i64::MIN), until_ms.unwrap_or(i64::MAX)],
            candle_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_fetch_state(
        &self,
        symbol: &str,
        kind: HistoryKind,
    ) -> Result<Option<FetchState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, data_type, earliest_ms, latest_ms, last_fetched_at_ms
             FROM fetch_state WHERE symbol = ?1 AND data_type = ?2",
        )?;
        let mut rows = stmt.query(params![symbol, kind.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(FetchState {
            symbol: row.get(0)?,
            kind,
            earliest_ms: row.get(2)?,
            latest_ms: row.get(3)?,
            last_fetched_at_ms: row.get(4)?,
        }))
    }

    pub async fn update_fetch_state(&self, state: &FetchState) -> Result<()> {
        let conn = self.conn.lock().await;
        upsert_fetch_state_raw(
            &conn,
            &state.symbol,
            state.kind,
            state.earliest_ms,
            state.latest_ms,
            state.last_fetched_at_ms,
        )
    }

    pub async fn upsert_tracked_pair(&self, pair: &TrackedPair) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tracked_pairs (symbol, added_at_ms, last_volume_24h, active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol) DO UPDATE SET
                last_volume_24h = excluded.last_volume_24h,
                active = excluded.active",
            params![
                &pair.symbol,
                pair.added_at_ms,
                pair.last_volume_24h.to_string(),
                pair.active as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn set_pair_active(&self, symbol: &str, active: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tracked_pairs SET active = ?2 WHERE symbol = ?1",
            params![symbol, active as i64],
        )?;
        Ok(())
    }

    pub async fn get_tracked_pairs(&self, active_only: bool) -> Result<Vec<TrackedPair>> {
        let conn = self.conn.lock().await;
        let sql = if active_only {
            "SELECT symbol, added_at_ms, last_volume_24h, active FROM tracked_pairs
             WHERE active = 1 ORDER BY symbol ASC"
        } else {
            "SELECT symbol, added_at_ms, last_volume_24h, active FROM tracked_pairs
             ORDER BY symbol ASC"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(TrackedPair {
                symbol: row.get(0)?,
                added_at_ms: row.get(1)?,
                last_volume_24h: decimal_column(row, 2)?,
                active: row.get::<_, i64>(3)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn set_last_sync_ms(&self, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES ('last_sync_ms', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![now_ms.to_string()],
        )?;
        Ok(())
    }

    pub async fn data_status(&self) -> Result<DataStatus> {
        let conn = self.conn.lock().await;

        let pair_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM tracked_pairs WHERE active = 1", [], |r| {
                r.get(0)
            })?;
        let funding_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM funding_rates", [], |r| r.get(0))?;
        let candle_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM ohlcv_candles", [], |r| r.get(0))?;
        let (earliest, latest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(timestamp_ms), MAX(timestamp_ms) FROM funding_rates",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let last_sync_ms: Option<i64> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = 'last_sync_ms'",
                [],
                |r| r.get::<_, String>(0),
            )
            .ok()
            .and_then(|v| v.parse().ok());

        Ok(DataStatus {
            pair_count: pair_count as usize,
            total_records: (funding_count + candle_count) as u64,
            earliest_ms: earliest,
            latest_ms: latest,
            last_sync_ms,
        })
    }
}

#[async_trait]
impl HistoryReader for HistoricalStore {
    async fn funding_rates(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<HistoricalFundingRate>> {
        self.get_funding_rates(symbol, since_ms, until_ms).await
    }

    async fn ohlcv_candles(
        &self,
        symbol: &str,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<OhlcvCandle>> {
        self.get_ohlcv_candles(symbol, since_ms, until_ms).await
    }
}

fn upsert_fetch_state_tx(
    tx: &rusqlite::Transaction<'_>,
    symbol: &str,
    kind: HistoryKind,
    batch_earliest: i64,
    batch_latest: i64,
    now_ms: i64,
) -> Result<()> {
    tx.execute(
        "INSERT INTO fetch_state (symbol, data_type, earliest_ms, latest_ms, last_fetched_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(symbol, data_type) DO UPDATE SET
            earliest_ms = MIN(earliest_ms, excluded.earliest_ms),
            latest_ms = MAX(latest_ms, excluded.latest_ms),
            last_fetched_at_ms = excluded.last_fetched_at_ms",
        params![symbol, kind.as_str(), batch_earliest, batch_latest, now_ms],
    )?;
    Ok(())
}

fn upsert_fetch_state_raw(
    conn: &Connection,
    symbol: &str,
    kind: HistoryKind,
    earliest_ms: i64,
    latest_ms: i64,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO fetch_state (symbol, data_type, earliest_ms, latest_ms, last_fetched_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(symbol, data_type) DO UPDATE SET
            earliest_ms = excluded.earliest_ms,
            latest_ms = excluded.latest_ms,
            last_fetched_at_ms = excluded.last_fetched_at_ms",
        params![symbol, kind.as_str(), earliest_ms, latest_ms, now_ms],
    )?;
    Ok(())
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn funding_from_row(row: &Row<'_>) -> rusqlite::Result<HistoricalFundingRate> {
    Ok(HistoricalFundingRate {
        symbol: row.get(0)?,
        timestamp_ms: row.get(1)?,
        rate: decimal_column(row, 2)?,
        interval_hours: row.get(3)?,
    })
}

fn candle_from_row(row: &Row<'_>) -> rusqlite::Result<OhlcvCandle> {
    Ok(OhlcvCandle {
        symbol: row.get(0)?,
        timestamp_ms: row.get(1)?,
        open: decimal_column(row, 2)?,
        high: decimal_column(row, 3)?,
        low: decimal_column(row, 4)?,
        close: decimal_column(row, 5)?,
        volume: decimal_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_store() -> (HistoricalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let store = HistoricalStore::new(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    fn rate(symbol: &str, ts: i64, rate: Decimal) -> HistoricalFundingRate {
        HistoricalFundingRate {
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            rate,
            interval_hours: 8,
        }
    }

    #[tokio::test]
    async fn insert_reads_back_ascending() {
        let (store, _dir) = temp_store();
        let batch = vec![
            rate("BTC/USDT:USDT", 3_000, dec!(0.0003)),
            rate("BTC/USDT:USDT", 1_000, dec!(0.0001)),
            rate("BTC/USDT:USDT", 2_000, dec!(0.0002)),
        ];
        assert_eq!(store.store_funding_batch("BTC/USDT:USDT", &batch, 5_000).await.unwrap(), 3);

        let rows = store
            .get_funding_rates("BTC/USDT:USDT", None, None)
            .await
            .unwrap();
        let ts: Vec<_> = rows.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(ts, vec![1_000, 2_000, 3_000]);
        assert_eq!(rows[0].rate, dec!(0.0001));
    }

    #[tokio::test]
    async fn reinsert_is_deduplicated() {
        let (store, _dir) = temp_store();
        let batch = vec![
            rate("BTC/USDT:USDT", 1_000, dec!(0.0001)),
            rate("BTC/USDT:USDT", 2_000, dec!(0.0002)),
        ];
        assert_eq!(store.store_funding_batch("BTC/USDT:USDT", &batch, 5_000).await.unwrap(), 2);
        // Same batch again: zero novel rows.
        assert_eq!(store.store_funding_batch("BTC/USDT:USDT", &batch, 6_000).await.unwrap(), 0);

        let rows = store
            .get_funding_rates("BTC/USDT:USDT", None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn fetch_state_widens_with_batches() {
        let (store, _dir) = temp_store();
        store
            .store_funding_batch(
                "BTC/USDT:USDT",
                &[rate("BTC/USDT:USDT", 5_000, dec!(0.0001))],
                10_000,
            )
            .await
            .unwrap();
        store
            .store_funding_batch(
                "BTC/USDT:USDT",
                &[
                    rate("BTC/USDT:USDT", 2_000, dec!(0.0002)),
                    rate("BTC/USDT:USDT", 8_000, dec!(0.0003)),
                ],
                11_000,
            )
            .await
            .unwrap();

        let state = store
            .get_fetch_state("BTC/USDT:USDT", HistoryKind::Funding)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.earliest_ms, 2_000);
        assert_eq!(state.latest_ms, 8_000);
        assert_eq!(state.last_fetched_at_ms, 11_000);
    }

    #[tokio::test]
    async fn range_bounds_are_inclusive() {
        let (store, _dir) = temp_store();
        let batch: Vec<_> = (1..=5)
            .map(|i| rate("BTC/USDT:USDT", i * 1_000, dec!(0.0001)))
            .collect();
        store.store_funding_batch("BTC/USDT:USDT", &batch, 9_000).await.unwrap();

        let rows = store
            .get_funding_rates("BTC/USDT:USDT", Some(2_000), Some(4_000))
            .await
            .unwrap();
        let ts: Vec<_> = rows.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(ts, vec![2_000, 3_000, 4_000]);
    }

    #[tokio::test]
    async fn candles_round_trip() {
        let (store, _dir) = temp_store();
        let candle = OhlcvCandle {
            symbol: "BTC/USDT:USDT".to_string(),
            timestamp_ms: 1_000,
            open: dec!(50000.5),
            high: dec!(50100),
            low: dec!(49900),
            close: dec!(50050.25),
            volume: dec!(12.345),
        };
        store
            .store_ohlcv_batch("BTC/USDT:USDT", &[candle.clone()], 2_000)
            .await
            .unwrap();

        let rows = store
            .get_ohlcv_candles("BTC/USDT:USDT", None, None)
            .await
            .unwrap();
        assert_eq!(rows, vec![candle]);
    }

    #[tokio::test]
    async fn tracked_pairs_and_status() {
        let (store, _dir) = temp_store();
        store
            .upsert_tracked_pair(&TrackedPair {
                symbol: "BTC/USDT:USDT".to_string(),
                added_at_ms: 1_000,
                last_volume_24h: dec!(2000000),
                active: true,
            })
            .await
            .unwrap();
        store
            .upsert_tracked_pair(&TrackedPair {
                symbol: "ETH/USDT:USDT".to_string(),
                added_at_ms: 1_000,
                last_volume_24h: dec!(900000),
                active: true,
            })
            .await
            .unwrap();
        store.set_pair_active("ETH/USDT:USDT", false).await.unwrap();

        let active = store.get_tracked_pairs(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "BTC/USDT:USDT");
        assert_eq!(store.get_tracked_pairs(false).await.unwrap().len(), 2);

        store
            .store_funding_batch(
                "BTC/USDT:USDT",
                &[rate("BTC/USDT:USDT", 4_000, dec!(0.0001))],
                5_000,
            )
            .await
            .unwrap();
        store.set_last_sync_ms(5_000).await.unwrap();

        let status = store.data_status().await.unwrap();
        assert_eq!(status.pair_count, 1);
        assert_eq!(status.total_records, 1);
        assert_eq!(status.earliest_ms, Some(4_000));
        assert_eq!(status.latest_ms, Some(4_000));
        assert_eq!(status.last_sync_ms, Some(5_000));
    }
}
