//! Composite strategy: score each pair from rate level, rate trend, rate
//! persistence and basis, gated by a volume-trend hard filter.
//!
//! Every sub-signal degrades to a neutral default when its data is missing;
//! a pair is never rejected just because history has not been fetched yet.
//! Every computed score is logged with its full breakdown.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::SignalSettings;
use crate::history::HistoryReader;
use crate::models::FundingRateData;

const MS_PER_DAY: i64 = 86_400_000;

/// How far back rate history is pulled for trend and persistence. Covers the
/// deepest persistence window (30 periods at 8h) with slack.
const RATE_HISTORY_WINDOW_DAYS: i64 = 45;

/// EMA intermediates are quantized to 12 decimal places, composite scores
/// to 6.
const EMA_DP: u32 = 12;
const SCORE_DP: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Rising,
    Stable,
    Falling,
}

impl Trend {
    pub fn score(self) -> Decimal {
        match self {
            Self::Rising => Decimal::ONE,
            Self::Stable => dec!(0.5),
            Self::Falling => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSignal {
    pub symbol: String,
    pub score: Decimal,
    pub rate_level: Decimal,
    pub trend: Trend,
    pub trend_score: Decimal,
    pub persistence_score: Decimal,
    pub basis_score: Decimal,
    pub volume_ok: bool,
    pub passes_entry: bool,
}

pub struct SignalEngine {
    history: Arc<dyn HistoryReader>,
    clock: Arc<dyn Clock>,
}

impl SignalEngine {
    pub fn new(history: Arc<dyn HistoryReader>, clock: Arc<dyn Clock>) -> Self {
        Self { history, clock }
    }

    /// Score one pair from the live snapshot plus stored history.
    pub async fn score_pair(
        &self,
        data: &FundingRateData,
        config: &SignalSettings,
    ) -> CompositeSignal {
        let now = self.clock.now_ms();

        let rate_level = clamp01(safe_div(data.rate, config.rate_level_cap));

        let rates = match self
            .history
            .funding_rates(
                &data.symbol,
                Some(now - RATE_HISTORY_WINDOW_DAYS * MS_PER_DAY),
                Some(now),
            )
            .await
        {
            Ok(rows) => rows.iter().map(|r| r.rate).collect::<Vec<_>>(),
            Err(e) => {
                debug!(symbol = %data.symbol, error = %e, "rate history unavailable");
                Vec::new()
            }
        };

        let trend = trend_of(&rates, config.trend_ema_span, config.trend_stable_threshold);
        let trend_score = trend.score();
        let persistence_score = persistence_of(
            &rates,
            config.persistence_threshold,
            config.persistence_max_periods,
        );
        let basis_score = basis_score(data.mark_price, data.index_price, config.basis_cap);
        let volume_ok = self.volume_ok(data, config, now).await;

        let score = (config.weight_rate_level * rate_level
            + config.weight_trend * trend_score
            + config.weight_persistence * persistence_score
            + config.weight_basis * basis_score)
            .round_dp(SCORE_DP);
        let passes_entry = volume_ok && score >= config.entry_threshold;

        info!(
            symbol = %data.symbol,
            %score,
            %rate_level,
            ?trend,
            %persistence_score,
            %basis_score,
            volume_ok,
            passes_entry,
            "composite signal"
        );

        CompositeSignal {
            symbol: data.symbol.clone(),
            score,
            rate_level,
            trend,
            trend_score,
            persistence_score,
            basis_score,
            volume_ok,
            passes_entry,
        }
    }

    /// Current score for an open position; `None` when the rate has vanished
    /// from the snapshot (the caller treats that as an exit).
    pub async fn score_for_exit(
        &self,
        data: Option<&FundingRateData>,
        config: &SignalSettings,
    ) -> Option<Decimal> {
        match data {
            Some(data) => Some(self.score_pair(data, config).await.score),
            None => None,
        }
    }

    /// Hard filter: mean candle volume over the recent window must hold at
    /// least `volume_decline_ratio` of the prior window. Missing data never
    /// rejects.
    async fn volume_ok(&self, data: &FundingRateData, config: &SignalSettings, now: i64) -> bool {
        let window = config.volume_lookback_days * MS_PER_DAY;
        let candles = match self
            .history
            .ohlcv_candles(&data.symbol, Some(now - 2 * window), Some(now))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!(symbol = %data.symbol, error = %e, "candle history unavailable");
                return true;
            }
        };

        let split = now - window;
        let recent: Vec<Decimal> = candles
            .iter()
            .filter(|c| c.timestamp_ms > split)
            .map(|c| c.volume)
            .collect();
        let prior: Vec<Decimal> = candles
            .iter()
            .filter(|c| c.timestamp_ms <= split)
            .map(|c| c.volume)
            .collect();

        if recent.is_empty() || prior.is_empty() {
            return true;
        }

        let mean = |values: &[Decimal]| -> Decimal {
            values.iter().copied().sum::<Decimal>() / Decimal::from(values.len() as u64)
        };
        mean(&recent) >= config.volume_decline_ratio * mean(&prior)
    }
}

fn clamp01(value: Decimal) -> Decimal {
    value.clamp(Decimal::ZERO, Decimal::ONE)
}

fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Recursive EMA, each intermediate quantized to keep representations small.
fn ema_series(values: &[Decimal], span: usize) -> Vec<Decimal> {
    if values.is_empty() || span == 0 {
        return Vec::new();
    }
    let alpha = Decimal::TWO / Decimal::from(span as u64 + 1);
    let mut series = Vec::with_capacity(values.len());
    let mut previous = values[0].round_dp(EMA_DP);
    series.push(previous);
    for value in &values[1..] {
        previous = (alpha * value + (Decimal::ONE - alpha) * previous).round_dp(EMA_DP);
        series.push(previous);
    }
    series
}

/// Compare the newest EMA with the one `span` periods before it.
fn trend_of(rates: &[Decimal], span: usize, stable_threshold: Decimal) -> Trend {
    let ema = ema_series(rates, span);
    if span == 0 || ema.len() < span + 1 {
        return Trend::Stable;
    }
    let newest = ema[ema.len() - 1];
    let reference = ema[ema.len() - 1 - span];
    let diff = newest - reference;
    if diff > stable_threshold {
        Trend::Rising
    } else if diff < -stable_threshold {
        Trend::Falling
    } else {
        Trend::Stable
    }
}

/// Run length of trailing samples at or above the threshold, capped and
/// normalized to `[0, 1]`.
fn persistence_of(rates: &[Decimal], threshold: Decimal, max_periods: u32) -> Decimal {
    if max_periods == 0 {
        return Decimal::ZERO;
    }
    let count = rates
        .iter()
        .rev()
        .take_while(|rate| **rate >= threshold)
        .count() as u32;
    Decimal::from(count.min(max_periods)) / Decimal::from(max_periods)
}

/// `(mark - index) / index` normalized by the cap; zero on missing or
/// non-positive index so a bad spot feed can never divide by zero.
fn basis_score(mark_price: Decimal, index_price: Option<Decimal>, cap: Decimal) -> Decimal {
    let Some(index) = index_price else {
        return Decimal::ZERO;
    };
    if index <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let basis = (mark_price - index) / index;
    clamp01(safe_div(basis, cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::models::{HistoricalFundingRate, OhlcvCandle};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::RwLock;

    /// In-memory history for scripting sub-signal inputs.
    #[derive(Default)]
    struct MemoryHistory {
        rates: RwLock<Vec<HistoricalFundingRate>>,
        candles: RwLock<Vec<OhlcvCandle>>,
        fail: bool,
    }

    #[async_trait]
    impl HistoryReader for MemoryHistory {
        async fn funding_rates(
            &self,
            symbol: &str,
            since_ms: Option<i64>,
            until_ms: Option<i64>,
        ) -> Result<Vec<HistoricalFundingRate>> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(self
                .rates
                .read()
                .iter()
                .filter(|r| {
                    r.symbol == symbol
                        && r.timestamp_ms >= since_ms.unwrap_or(i64::MIN)
                        && r.timestamp_ms <= until_ms.unwrap_or(i64::MAX)
                })
                .cloned()
                .collect())
        }

        async fn ohlcv_candles(
            &self,
            symbol: &str,
            since_ms: Option<i64>,
            until_ms: Option<i64>,
        ) -> Result<Vec<OhlcvCandle>> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(self
                .candles
                .read()
                .iter()
                .filter(|c| {
                    c.symbol == symbol
                        && c.timestamp_ms >= since_ms.unwrap_or(i64::MIN)
                        && c.timestamp_ms <= until_ms.unwrap_or(i64::MAX)
                })
                .cloned()
                .collect())
        }
    }

    fn snapshot(rate: Decimal, mark: Decimal, index: Option<Decimal>) -> FundingRateData {
        FundingRateData {
            symbol: "BTC/USDT:USDT".to_string(),
            rate,
            next_funding_time_ms: 0,
            interval_hours: 8,
            mark_price: mark,
            index_price: index,
            volume_24h: dec!(2000000),
            updated_at_ms: 0,
        }
    }

    fn history_rates(now: i64, values: &[Decimal]) -> Vec<HistoricalFundingRate> {
        let step = 8 * 3_600_000i64;
        values
            .iter()
            .enumerate()
            .map(|(i, rate)| HistoricalFundingRate {
                symbol: "BTC/USDT:USDT".to_string(),
                timestamp_ms: now - step * (values.len() as i64 - i as i64),
                rate: *rate,
                interval_hours: 8,
            })
            .collect()
    }

    #[test]
    fn ema_is_quantized_and_recursive() {
        let series = ema_series(&[dec!(0.0001), dec!(0.0002), dec!(0.0003)], 6);
        assert_eq!(series.len(), 3);
        // alpha = 2/7; second value = alpha*0.0002 + (1-alpha)*0.0001
        let alpha = Decimal::TWO / dec!(7);
        let expected =
            (alpha * dec!(0.0002) + (Decimal::ONE - alpha) * dec!(0.0001)).round_dp(12);
        assert_eq!(series[1], expected);
        assert!(series.iter().all(|v| v.scale() <= 12));
    }

    #[test]
    fn trend_needs_more_than_span_samples() {
        let span = 6;
        let rising: Vec<Decimal> = (1..=6).map(|i| Decimal::new(i, 4)).collect();
        // Six samples is one short of a span-6 diff.
        assert_eq!(trend_of(&rising, span, dec!(0.00001)), Trend::Stable);

        let rising: Vec<Decimal> = (1..=12).map(|i| Decimal::new(i, 4)).collect();
        assert_eq!(trend_of(&rising, span, dec!(0.00001)), Trend::Rising);

        let falling: Vec<Decimal> = (1..=12).rev().map(|i| Decimal::new(i, 4)).collect();
        assert_eq!(trend_of(&falling, span, dec!(0.00001)), Trend::Falling);

        let flat: Vec<Decimal> = std::iter::repeat(dec!(0.0003)).take(12).collect();
        assert_eq!(trend_of(&flat, span, dec!(0.00001)), Trend::Stable);
    }

    #[test]
    fn persistence_counts_trailing_run() {
        let threshold = dec!(0.0002);
        let rates = vec![
            dec!(0.0003), // broken by the dip below
            dec!(0.0001),
            dec!(0.0002),
            dec!(0.0004),
        ];
        // Trailing run of 2, max 5 -> 0.4
        assert_eq!(persistence_of(&rates, threshold, 5), dec!(0.4));
        // Cap binds.
        let long: Vec<Decimal> = std::iter::repeat(dec!(0.0003)).take(50).collect();
        assert_eq!(persistence_of(&long, threshold, 30), Decimal::ONE);
        // Empty history scores zero.
        assert_eq!(persistence_of(&[], threshold, 30), Decimal::ZERO);
    }

    #[test]
    fn basis_boundaries() {
        // Zero or missing index never divides.
        assert_eq!(basis_score(dec!(100), Some(Decimal::ZERO), dec!(0.002)), Decimal::ZERO);
        assert_eq!(basis_score(dec!(100), None, dec!(0.002)), Decimal::ZERO);
        // Negative basis clamps to zero, saturated basis to one.
        assert_eq!(basis_score(dec!(99), Some(dec!(100)), dec!(0.002)), Decimal::ZERO);
        assert_eq!(basis_score(dec!(110), Some(dec!(100)), dec!(0.002)), Decimal::ONE);
    }

    /// Composite determinism: sub-scores 0.8/0.5/0.4/0.3 under default
    /// weights produce exactly 0.550 and pass the 0.5 entry threshold.
    #[tokio::test]
    async fn composite_determinism() {
        let now = 1_700_000_000_000i64;
        let history = Arc::new(MemoryHistory::default());
        // Six samples: trailing run of exactly 2 above the persistence
        // threshold, and too short for a span-6 trend diff.
        *history.rates.write() = history_rates(
            now,
            &[
                dec!(0.0005),
                dec!(0.0005),
                dec!(0.0005),
                dec!(0.00005), // breaks the run
                dec!(0.0004),
                dec!(0.0004),
            ],
        );

        let mut config = SignalSettings::default();
        config.persistence_threshold = dec!(0.0001);
        config.persistence_max_periods = 5;

        let engine = SignalEngine::new(history, Arc::new(SimClock::new(now)));
        // rate 0.0008 / cap 0.001 = 0.8; mark/index give basis 0.0006 / 0.002 = 0.3.
        let signal = engine
            .score_pair(
                &snapshot(dec!(0.0008), dec!(10006), Some(dec!(10000))),
                &config,
            )
            .await;

        assert_eq!(signal.rate_level, dec!(0.8));
        assert_eq!(signal.trend, Trend::Stable);
        assert_eq!(signal.persistence_score, dec!(0.4));
        assert_eq!(signal.basis_score, dec!(0.3));
        assert!(signal.volume_ok, "no candle data never rejects");
        // 0.35*0.8 + 0.25*0.5 + 0.25*0.4 + 0.15*0.3 = 0.550
        assert_eq!(signal.score, dec!(0.550));
        assert!(signal.passes_entry);
    }

    #[tokio::test]
    async fn degrades_to_neutral_when_store_fails() {
        let history = Arc::new(MemoryHistory {
            fail: true,
            ..Default::default()
        });
        let config = SignalSettings::default();
        let engine = SignalEngine::new(history, Arc::new(SimClock::new(1_000)));

        let signal = engine
            .score_pair(&snapshot(dec!(0.001), dec!(100), None), &config)
            .await;
        assert_eq!(signal.trend, Trend::Stable);
        assert_eq!(signal.trend_score, dec!(0.5));
        assert_eq!(signal.persistence_score, Decimal::ZERO);
        assert_eq!(signal.basis_score, Decimal::ZERO);
        assert!(signal.volume_ok);
        // rate_level saturates at 1; score is still well defined.
        assert_eq!(signal.rate_level, Decimal::ONE);
    }

    #[tokio::test]
    async fn volume_decline_rejects_entry() {
        let now = 10 * MS_PER_DAY;
        let history = Arc::new(MemoryHistory::default());
        let mut candles = Vec::new();
        // Prior window: volume 100/candle; recent window: volume 10/candle.
        for day in 0..3 {
            candles.push(OhlcvCandle {
                symbol: "BTC/USDT:USDT".to_string(),
                timestamp_ms: now - (6 - day) * MS_PER_DAY,
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: dec!(1),
                volume: dec!(100),
            });
            candles.push(OhlcvCandle {
                symbol: "BTC/USDT:USDT".to_string(),
                timestamp_ms: now - (3 - day) * MS_PER_DAY + 1,
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: dec!(1),
                volume: dec!(10),
            });
        }
        *history.candles.write() = candles;

        let config = SignalSettings::default(); // lookback 3 days, ratio 0.7
        let engine = SignalEngine::new(history, Arc::new(SimClock::new(now)));
        let signal = engine
            .score_pair(&snapshot(dec!(0.001), dec!(100), None), &config)
            .await;

        assert!(!signal.volume_ok);
        assert!(!signal.passes_entry, "volume filter is a hard gate");

        let exit_score = engine
            .score_for_exit(Some(&snapshot(dec!(0.001), dec!(100), None)), &config)
            .await;
        assert_eq!(exit_score, Some(signal.score));
        assert_eq!(engine.score_for_exit(None, &config).await, None);
    }
}
