//! Event-driven replay of stored history through the live strategy code.
//!
//! Three swaps and nothing else: the executor fills from injected prices,
//! the store is wrapped so no query can see past the simulated present, and
//! the clock the PnL tracker settles on is the simulation clock. The
//! decide-and-execute core is the same [`TradeCycle`] the live orchestrator
//! runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SimClock};
use crate::config::Settings;
use crate::error::TradeError;
use crate::exchange::{InstrumentCatalog, MarketEntry};
use crate::history::{HistoricalStore, TimeBoundedHistory};
use crate::market::TickerService;
use crate::models::{
    spot_symbol_of, FundingRateData, HistoricalFundingRate, InstrumentInfo, OhlcvCandle,
    OrderCategory, OrderRequest, OrderResult, Position, PositionPnl, StrategyMode,
};
use crate::orchestrator::TradeCycle;
use crate::risk::RiskManager;
use crate::strategy::{DynamicSizer, SignalEngine};
use crate::trading::{Executor, FeeCalculator, PaperExecutor, PnlTracker, PositionManager};

const MS_PER_DAY: i64 = 86_400_000;

/// Instrument constraints assumed for simulated markets.
fn synthetic_instrument() -> InstrumentInfo {
    InstrumentInfo {
        min_qty: dec!(0.001),
        qty_step: dec!(0.001),
        min_notional: dec!(5),
        tick_size: dec!(0.01),
    }
}

/// Executor for replays: holds the injected price map and the simulated
/// time, and delegates every fill to an inner [`PaperExecutor`] so slippage
/// and fee math are the same code path as paper trading.
pub struct BacktestExecutor {
    ticker: Arc<TickerService>,
    clock: SimClock,
    inner: PaperExecutor,
}

impl BacktestExecutor {
    pub fn new(fees: FeeCalculator, clock: SimClock) -> Self {
        let ticker = Arc::new(TickerService::new());
        let inner = PaperExecutor::new(
            Arc::clone(&ticker),
            fees,
            Arc::new(clock.clone()) as Arc<dyn Clock>,
        );
        Self {
            ticker,
            clock,
            inner,
        }
    }

    /// The injected price map; the position manager prices sizing off it.
    pub fn ticker(&self) -> Arc<TickerService> {
        Arc::clone(&self.ticker)
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.ticker.publish(symbol, price, self.clock.now_ms());
    }
}

#[async_trait]
impl Executor for BacktestExecutor {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, TradeError> {
        self.inner.place_order(req).await
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        category: OrderCategory,
    ) -> Result<bool, TradeError> {
        self.inner.cancel_order(order_id, symbol, category).await
    }
}

/// One completed round trip extracted from the tracker's closed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub position_id: String,
    pub perp_symbol: String,
    pub quantity: Decimal,
    pub opened_at_ms: i64,
    pub closed_at_ms: i64,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub funding_total: Decimal,
    pub price_pnl: Decimal,
    pub net_pnl: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    /// Round-trip count, not leg events.
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Quantized to 3 decimal places, half-up.
    pub win_rate: Decimal,
    pub total_pnl: Decimal,
    pub total_funding: Decimal,
    pub total_fees: Decimal,
    pub max_drawdown: Decimal,
    pub final_equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub metrics: BacktestMetrics,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<(i64, Decimal)>,
    pub pnl_histogram: Vec<(Decimal, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub label: String,
    pub metrics: BacktestMetrics,
}

/// Sequential parameter sweep: only the best run keeps its trades and
/// equity curve, the rest keep summary stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub best_label: String,
    pub best: BacktestResult,
    pub summaries: Vec<SweepSummary>,
}

pub struct BacktestEngine {
    store: Arc<HistoricalStore>,
}

impl BacktestEngine {
    pub fn new(store: Arc<HistoricalStore>) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        settings: &Settings,
        symbols: &[String],
        initial_balance: Decimal,
    ) -> Result<BacktestResult> {
        let mut rate_series: HashMap<String, Vec<HistoricalFundingRate>> = HashMap::new();
        let mut candle_series: HashMap<String, Vec<OhlcvCandle>> = HashMap::new();
        let mut ticks: BTreeSet<i64> = BTreeSet::new();

        for symbol in symbols {
            let rates = self
                .store
                .get_funding_rates(symbol, None, None)
                .await
                .with_context(|| format!("loading funding history for {symbol}"))?;
            ticks.extend(rates.iter().map(|r| r.timestamp_ms));
            rate_series.insert(symbol.clone(), rates);
            candle_series.insert(
                symbol.clone(),
                self.store.get_ohlcv_candles(symbol, None, None).await?,
            );
        }
        if ticks.is_empty() {
            bail!("no funding history for requested symbols");
        }
        let start = *ticks.iter().next().expect("non-empty");

        info!(
            symbols = symbols.len(),
            ticks = ticks.len(),
            "backtest replay starting"
        );

        // The three swaps.
        let clock = SimClock::new(start);
        let fees = FeeCalculator::new(settings.fees.clone());
        let executor = Arc::new(BacktestExecutor::new(fees.clone(), clock.clone()));
        let bounded: Arc<TimeBoundedHistory> = Arc::new(TimeBoundedHistory::new(
            Arc::clone(&self.store),
            clock.clone(),
        ));
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let catalog = Arc::new(InstrumentCatalog::new());
        catalog.refresh(synthetic_markets(symbols));

        let pnl = Arc::new(PnlTracker::new(fees.clone(), Arc::clone(&shared_clock)));
        let manager = Arc::new(PositionManager::new(
            executor.clone() as Arc<dyn Executor>,
            Arc::clone(&catalog),
            executor.ticker(),
            Arc::clone(&pnl),
            Arc::clone(&shared_clock),
            settings.trading.delta_drift_tolerance,
            settings.trading.order_timeout_secs,
        ));
        let risk = Arc::new(RiskManager::paper(settings.risk.clone()));
        let signal = match settings.trading.strategy_mode {
            StrategyMode::Composite => Some(Arc::new(SignalEngine::new(
                bounded as Arc<dyn crate::history::HistoryReader>,
                Arc::clone(&shared_clock),
            ))),
            StrategyMode::Simple => None,
        };
        let sizer = settings
            .sizing
            .enabled
            .then(|| DynamicSizer::new(settings.sizing.clone()));

        let cycle = TradeCycle::new(
            Arc::clone(&catalog),
            Arc::clone(&manager),
            Arc::clone(&pnl),
            fees,
            risk,
            signal,
            sizer,
        );

        let mut equity_curve: Vec<(i64, Decimal)> = Vec::with_capacity(ticks.len());
        let mut last_snapshot: Vec<FundingRateData> = Vec::new();

        for &t in &ticks {
            clock.set_ms(t);

            let snapshot = build_snapshot(t, &rate_series, &candle_series);
            for data in &snapshot {
                executor.set_price(&data.symbol, data.mark_price);
                if let (Some(index), Some(spot)) =
                    (data.index_price, spot_symbol_of(&data.symbol))
                {
                    executor.set_price(spot, index);
                }
            }

            let exposure = manager.current_exposure();
            let free_balance = (initial_balance - exposure).max(Decimal::ZERO);
            cycle.run(settings, &snapshot, free_balance).await;
            cycle.settle_if_due(&snapshot);

            let equity = initial_balance + mark_to_market(&manager, &pnl, &snapshot);
            equity_curve.push((t, equity));
            last_snapshot = snapshot;
        }

        // Realize whatever is still open at the final prices.
        for position in manager.open_positions() {
            if let Err(e) = manager.close_position(&position.id).await {
                debug!(id = %position.id, error = %e, "failed to flatten at end of replay");
            }
        }
        if let Some((t, _)) = equity_curve.last().copied() {
            let equity = initial_balance + mark_to_market(&manager, &pnl, &last_snapshot);
            equity_curve.push((t, equity));
        }

        Ok(summarize(&manager, &pnl, equity_curve, initial_balance))
    }

    pub async fn run_sweep(
        &self,
        variants: Vec<(String, Settings)>,
        symbols: &[String],
        initial_balance: Decimal,
    ) -> Result<SweepResult> {
        if variants.is_empty() {
            bail!("parameter sweep needs at least one configuration");
        }

        let mut summaries = Vec::with_capacity(variants.len());
        let mut best: Option<(String, BacktestResult)> = None;

        for (label, settings) in variants {
            info!(%label, "sweep configuration starting");
            let result = self.run(&settings, symbols, initial_balance).await?;
            summaries.push(SweepSummary {
                label: label.clone(),
                metrics: result.metrics.clone(),
            });

            // Only the best configuration keeps its trade list and equity
            // curve; the rest are dropped here to bound memory.
            let better = match &best {
                Some((_, current)) => result.metrics.total_pnl > current.metrics.total_pnl,
                None => true,
            };
            if better {
                best = Some((label, result));
            }
        }

        let (best_label, best) = best.expect("at least one variant ran");
        Ok(SweepResult {
            best_label,
            best,
            summaries,
        })
    }
}

fn synthetic_markets(symbols: &[String]) -> Vec<MarketEntry> {
    let mut entries = Vec::with_capacity(symbols.len() * 2);
    for symbol in symbols {
        let Some(spot) = spot_symbol_of(symbol) else {
            continue;
        };
        entries.push(MarketEntry {
            symbol: spot.to_string(),
            base: String::new(),
            quote: "USDT".to_string(),
            spot: true,
            linear: false,
            active: true,
            info: synthetic_instrument(),
        });
        entries.push(MarketEntry {
            symbol: symbol.clone(),
            base: String::new(),
            quote: "USDT".to_string(),
            spot: false,
            linear: true,
            active: true,
            info: synthetic_instrument(),
        });
    }
    entries
}

/// Snapshot for tick `t`: for each symbol, its latest rate at or before `t`
/// plus mark/index from the candle at or before `t`.
fn build_snapshot(
    t: i64,
    rate_series: &HashMap<String, Vec<HistoricalFundingRate>>,
    candle_series: &HashMap<String, Vec<OhlcvCandle>>,
) -> Vec<FundingRateData> {
    let mut snapshot = Vec::new();
    for (symbol, rates) in rate_series {
        let Some(rate) = latest_at(rates, t, |r| r.timestamp_ms) else {
            continue;
        };
        let candles = candle_series.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
        let Some(candle) = latest_at(candles, t, |c| c.timestamp_ms) else {
            continue; // no price yet, the pair is not tradeable at this tick
        };
        snapshot.push(FundingRateData {
            symbol: symbol.clone(),
            rate: rate.rate,
            next_funding_time_ms: t + i64::from(rate.interval_hours) * 3_600_000,
            interval_hours: rate.interval_hours,
            mark_price: candle.close,
            // The replay has no separate index feed; the basis sub-score
            // degrades to zero by construction.
            index_price: Some(candle.close),
            volume_24h: quote_volume_24h(candles, t),
            updated_at_ms: t,
        });
    }
    snapshot.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    snapshot
}

fn latest_at<T>(rows: &[T], t: i64, ts: impl Fn(&T) -> i64) -> Option<&T> {
    let idx = rows.partition_point(|row| ts(row) <= t);
    if idx == 0 { None } else { Some(&rows[idx - 1]) }
}

fn quote_volume_24h(candles: &[OhlcvCandle], t: i64) -> Decimal {
    candles
        .iter()
        .filter(|c| c.timestamp_ms <= t && c.timestamp_ms > t - MS_PER_DAY)
        .map(|c| c.volume * c.close)
        .sum()
}

/// Total PnL relative to the initial balance: funding minus fees plus the
/// price legs of both closed and open positions.
fn mark_to_market(
    manager: &PositionManager,
    pnl: &PnlTracker,
    snapshot: &[FundingRateData],
) -> Decimal {
    let summary = pnl.portfolio_summary();
    let mut total = summary.net;

    for position in manager.closed_positions() {
        if let Some(record) = pnl.pnl_record(&position.id) {
            total += closed_price_pnl(&record, &position);
        }
    }
    for position in manager.open_positions() {
        let Some(mark) = snapshot
            .iter()
            .find(|r| r.symbol == position.perp_symbol)
            .map(|r| r.mark_price)
        else {
            continue;
        };
        // Long spot gains what the short perp loses; entry basis remains.
        total += (mark - position.spot_entry_price) * position.quantity
            + (position.perp_entry_price - mark) * position.quantity;
    }
    total
}

fn closed_price_pnl(record: &PositionPnl, position: &Position) -> Decimal {
    let spot_exit = record.spot_exit_price.unwrap_or(position.spot_entry_price);
    let perp_exit = record.perp_exit_price.unwrap_or(position.perp_entry_price);
    (spot_exit - position.spot_entry_price) * position.quantity
        + (position.perp_entry_price - perp_exit) * position.quantity
}

fn summarize(
    manager: &PositionManager,
    pnl: &PnlTracker,
    equity_curve: Vec<(i64, Decimal)>,
    initial_balance: Decimal,
) -> BacktestResult {
    let mut trades = Vec::new();
    for position in manager.closed_positions() {
        let Some(record) = pnl.pnl_record(&position.id) else {
            continue;
        };
        let price_pnl = closed_price_pnl(&record, &position);
        let funding_total = record.funding_total();
        let exit_fee = record.exit_fee.unwrap_or(Decimal::ZERO);
        trades.push(BacktestTrade {
            position_id: position.id.clone(),
            perp_symbol: position.perp_symbol.clone(),
            quantity: position.quantity,
            opened_at_ms: position.opened_at_ms,
            closed_at_ms: record.closed_at_ms.unwrap_or(position.opened_at_ms),
            entry_fee: record.entry_fee,
            exit_fee,
            funding_total,
            price_pnl,
            net_pnl: funding_total + price_pnl - record.entry_fee - exit_fee,
        });
    }
    trades.sort_by_key(|t| t.opened_at_ms);

    let winning_trades = trades.iter().filter(|t| t.net_pnl > Decimal::ZERO).count();
    let losing_trades = trades.iter().filter(|t| t.net_pnl < Decimal::ZERO).count();
    let total_trades = trades.len();
    let win_rate = if total_trades == 0 {
        Decimal::ZERO
    } else {
        (Decimal::from(winning_trades as u64) / Decimal::from(total_trades as u64))
            .round_dp_with_strategy(3, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
    };

    let total_pnl: Decimal = trades.iter().map(|t| t.net_pnl).sum();
    let total_funding: Decimal = trades.iter().map(|t| t.funding_total).sum();
    let total_fees: Decimal = trades.iter().map(|t| t.entry_fee + t.exit_fee).sum();

    let mut peak = initial_balance;
    let mut max_drawdown = Decimal::ZERO;
    for (_, equity) in &equity_curve {
        if *equity > peak {
            peak = *equity;
        }
        if peak > Decimal::ZERO {
            max_drawdown = max_drawdown.max((peak - *equity) / peak);
        }
    }

    let final_equity = equity_curve
        .last()
        .map(|(_, e)| *e)
        .unwrap_or(initial_balance);

    let mut histogram: BTreeMap<Decimal, usize> = BTreeMap::new();
    for trade in &trades {
        *histogram.entry(trade.net_pnl.round_dp(0)).or_default() += 1;
    }

    BacktestResult {
        metrics: BacktestMetrics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            total_pnl,
            total_funding,
            total_fees,
            max_drawdown,
            final_equity,
        },
        trades,
        equity_curve,
        pnl_histogram: histogram.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ExchangeSettings, FeeSettings, HistorySettings, RiskSettings, SignalSettings,
        SizingSettings, TradingSettings,
    };
    use crate::models::TradeMode;

    fn settings(strategy_mode: StrategyMode) -> Settings {
        Settings {
            exchange: ExchangeSettings {
                api_key: None,
                api_secret: None,
                demo: true,
                mode: TradeMode::Paper,
            },
            trading: TradingSettings {
                min_funding_rate: dec!(0.0001),
                max_position_size_usd: dec!(1000),
                delta_drift_tolerance: dec!(0.02),
                order_timeout_secs: 5,
                scan_interval_secs: 60,
                strategy_mode,
            },
            fees: FeeSettings::default(),
            risk: RiskSettings {
                max_position_size_per_pair: dec!(1000),
                max_simultaneous_positions: 3,
                exit_funding_rate: dec!(0.00005),
                margin_alert_threshold: dec!(0.8),
                margin_critical_threshold: dec!(0.9),
                min_volume_24h: dec!(100),
                min_holding_periods: 3,
                paper_virtual_equity: dec!(10000),
            },
            history: HistorySettings {
                enabled: false,
                db_path: ":memory:".into(),
                lookback_days: 30,
                ohlcv_interval: "1h".into(),
                top_pairs_count: 20,
                pair_reeval_interval_hours: 168,
                max_retries: 5,
                retry_base_delay_secs: 0.001,
                fetch_batch_delay_ms: 0,
            },
            signal: SignalSettings::default(),
            sizing: SizingSettings {
                enabled: false,
                min_allocation_fraction: dec!(0.3),
                max_allocation_fraction: dec!(1.0),
                max_portfolio_exposure: dec!(5000),
            },
        }
    }

    async fn seeded_store() -> (Arc<HistoricalStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(HistoricalStore::new(dir.path().join("bt.db").to_str().unwrap()).unwrap());

        let step = 8 * 3_600_000i64;
        let symbol = "BTC/USDT:USDT";

        // 20 funding periods: strong positive funding for 10, then decayed
        // below the exit threshold.
        let rates: Vec<_> = (1..=20)
            .map(|i| HistoricalFundingRate {
                symbol: symbol.to_string(),
                timestamp_ms: i * step,
                rate: if i <= 10 { dec!(0.0015) } else { dec!(0.00001) },
                interval_hours: 8,
            })
            .collect();
        store.store_funding_batch(symbol, &rates, 21 * step).await.unwrap();

        // Hourly candles across the window, flat price, steady volume.
        let candles: Vec<_> = (0..=20 * 8)
            .map(|h| OhlcvCandle {
                symbol: symbol.to_string(),
                timestamp_ms: h * 3_600_000,
                open: dec!(100),
                high: dec!(100),
                low: dec!(100),
                close: dec!(100),
                volume: dec!(50),
            })
            .collect();
        store.store_ohlcv_batch(symbol, &candles, 21 * step).await.unwrap();

        (store, dir)
    }

    #[tokio::test]
    async fn replay_opens_collects_funding_and_exits() {
        let (store, _dir) = seeded_store().await;
        let engine = BacktestEngine::new(store);
        let cfg = settings(StrategyMode::Simple);

        let result = engine
            .run(&cfg, &["BTC/USDT:USDT".to_string()], dec!(10000))
            .await
            .unwrap();

        // One round trip: opened while funding was rich, closed on decay.
        assert_eq!(result.metrics.total_trades, 1);
        let trade = &result.trades[0];
        assert!(trade.funding_total > Decimal::ZERO, "funding was collected");
        assert!(trade.closed_at_ms > trade.opened_at_ms);
        // Funding income, flat prices: the trade should be net positive
        // after fees.
        assert!(trade.net_pnl > Decimal::ZERO);
        assert_eq!(result.metrics.win_rate, Decimal::ONE);
        assert!(!result.equity_curve.is_empty());
        assert!(!result.pnl_histogram.is_empty());
    }

    #[tokio::test]
    async fn empty_history_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(HistoricalStore::new(dir.path().join("e.db").to_str().unwrap()).unwrap());
        let engine = BacktestEngine::new(store);
        let cfg = settings(StrategyMode::Simple);

        assert!(engine
            .run(&cfg, &["BTC/USDT:USDT".to_string()], dec!(10000))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_only_the_best_trades() {
        let (store, _dir) = seeded_store().await;
        let engine = BacktestEngine::new(store);

        // A viable configuration and one whose entry floor excludes
        // everything.
        let viable = settings(StrategyMode::Simple);
        let mut inert = settings(StrategyMode::Simple);
        inert.trading.min_funding_rate = dec!(0.5);

        let sweep = engine
            .run_sweep(
                vec![
                    ("inert".to_string(), inert),
                    ("viable".to_string(), viable),
                ],
                &["BTC/USDT:USDT".to_string()],
                dec!(10000),
            )
            .await
            .unwrap();

        assert_eq!(sweep.best_label, "viable");
        assert!(!sweep.best.trades.is_empty());
        assert_eq!(sweep.summaries.len(), 2);
        let inert_summary = sweep
            .summaries
            .iter()
            .find(|s| s.label == "inert")
            .unwrap();
        assert_eq!(inert_summary.metrics.total_trades, 0);
    }

    #[tokio::test]
    async fn composite_mode_replays_without_lookahead() {
        let (store, _dir) = seeded_store().await;
        let engine = BacktestEngine::new(store);
        let mut cfg = settings(StrategyMode::Composite);
        // Let the rate level carry the score so entries happen early.
        cfg.signal.entry_threshold = dec!(0.4);

        let result = engine
            .run(&cfg, &["BTC/USDT:USDT".to_string()], dec!(10000))
            .await
            .unwrap();
        // The engine ran to completion through the bounded store; whether it
        // traded depends on the signal, but the curve must span the replay.
        assert!(result.equity_curve.len() >= 20);
    }

    #[test]
    fn latest_at_picks_the_row_at_or_before() {
        let rows = vec![1_000i64, 2_000, 3_000];
        assert_eq!(latest_at(&rows, 2_500, |r| *r), Some(&2_000));
        assert_eq!(latest_at(&rows, 3_000, |r| *r), Some(&3_000));
        assert_eq!(latest_at(&rows, 500, |r| *r), None);
    }
}
