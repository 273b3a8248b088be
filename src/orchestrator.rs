//! The autonomous trading loop.
//!
//! [`TradeCycle`] is the decide-and-execute core - exits first, then entries
//! in rank order - shared by composition between the live orchestrator and
//! the backtest engine. [`Orchestrator`] wraps it with the cycle lock,
//! incremental history top-up, margin monitoring, funding settlement and the
//! runtime-config overlay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex as SyncMutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::{RuntimeConfig, Settings};
use crate::error::TradeError;
use crate::exchange::{ExchangeClient, InstrumentCatalog};
use crate::history::HistoricalFetcher;
use crate::market::FundingCache;
use crate::models::{spot_symbol_of, FundingRateData, StrategyMode, TradeMode};
use crate::risk::{EmergencyController, RiskManager};
use crate::strategy::{rank_opportunities, DynamicSizer, SignalEngine};
use crate::strategy::ranker::RankerConfig;
use crate::trading::{FeeCalculator, PnlTracker, PositionManager};

/// One entry candidate, in rank order. `score` is present only under the
/// composite strategy.
#[derive(Debug, Clone)]
struct Candidate {
    spot_symbol: String,
    perp_symbol: String,
    score: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub candidates: usize,
    pub entered: usize,
    pub exited: usize,
    pub skipped: usize,
}

/// Decide-and-execute core shared by live trading and backtests.
pub struct TradeCycle {
    catalog: Arc<InstrumentCatalog>,
    manager: Arc<PositionManager>,
    pnl: Arc<PnlTracker>,
    fees: FeeCalculator,
    risk: Arc<RiskManager>,
    signal: Option<Arc<SignalEngine>>,
    sizer: Option<DynamicSizer>,
}

impl TradeCycle {
    pub fn new(
        catalog: Arc<InstrumentCatalog>,
        manager: Arc<PositionManager>,
        pnl: Arc<PnlTracker>,
        fees: FeeCalculator,
        risk: Arc<RiskManager>,
        signal: Option<Arc<SignalEngine>>,
        sizer: Option<DynamicSizer>,
    ) -> Self {
        Self {
            catalog,
            manager,
            pnl,
            fees,
            risk,
            signal,
            sizer,
        }
    }

    pub fn manager(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    pub fn pnl(&self) -> &Arc<PnlTracker> {
        &self.pnl
    }

    /// Run exits then entries against one funding snapshot.
    pub async fn run(
        &self,
        cfg: &Settings,
        rates: &[FundingRateData],
        free_balance: Decimal,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        if rates.is_empty() {
            debug!("empty funding snapshot, nothing to do");
            return report;
        }

        report.exited = self.run_exits(cfg, rates).await;

        let candidates = self.collect_candidates(cfg, rates).await;
        report.candidates = candidates.len();

        let (entered, skipped) = self.run_entries(cfg, candidates, free_balance).await;
        report.entered = entered;
        report.skipped = skipped;
        report
    }

    /// Close positions whose opportunity has decayed. Exits always run
    /// before entries so freed slots are available in the same cycle.
    async fn run_exits(&self, cfg: &Settings, rates: &[FundingRateData]) -> usize {
        let mut exited = 0;
        for position in self.manager.open_positions() {
            let data = rates.iter().find(|r| r.symbol == position.perp_symbol);

            let should_close = match (cfg.trading.strategy_mode, &self.signal, data) {
                // Rate gone from the snapshot: the pair is no longer tradeable.
                (_, _, None) => {
                    info!(perp = %position.perp_symbol, "rate unavailable, closing");
                    true
                }
                (StrategyMode::Composite, Some(engine), Some(data)) => {
                    match engine.score_for_exit(Some(data), &cfg.signal).await {
                        Some(score) if score < cfg.signal.exit_threshold => {
                            info!(perp = %position.perp_symbol, %score, "score below exit threshold");
                            true
                        }
                        Some(_) => false,
                        None => true,
                    }
                }
                // Simple mode, or composite without a constructible engine.
                (_, _, Some(data)) => {
                    if data.rate < cfg.risk.exit_funding_rate {
                        info!(
                            perp = %position.perp_symbol,
                            rate = %data.rate,
                            threshold = %cfg.risk.exit_funding_rate,
                            "rate below exit threshold"
                        );
                        true
                    } else {
                        false
                    }
                }
            };

            if should_close {
                match self.manager.close_position(&position.id).await {
                    Ok(_) => exited += 1,
                    Err(e) => error!(id = %position.id, error = %e, "exit close failed"),
                }
            }
        }
        exited
    }

    async fn collect_candidates(
        &self,
        cfg: &Settings,
        rates: &[FundingRateData],
    ) -> Vec<Candidate> {
        match (cfg.trading.strategy_mode, &self.signal) {
            (StrategyMode::Composite, Some(engine)) => {
                let mut scored = Vec::new();
                for data in rates {
                    if data.rate < cfg.trading.min_funding_rate
                        || data.volume_24h < cfg.risk.min_volume_24h
                    {
                        continue;
                    }
                    let Some(spot) = spot_symbol_of(&data.symbol) else {
                        continue;
                    };
                    if !self.catalog.has_active_spot(spot) {
                        continue;
                    }
                    let signal = engine.score_pair(data, &cfg.signal).await;
                    if signal.passes_entry {
                        scored.push(Candidate {
                            spot_symbol: spot.to_string(),
                            perp_symbol: data.symbol.clone(),
                            score: Some(signal.score),
                        });
                    }
                }
                scored.sort_by(|a, b| b.score.cmp(&a.score));
                scored
            }
            // Simple mode - and the composite flag without a signal engine,
            // which must behave exactly like simple mode.
            _ => rank_opportunities(
                rates,
                &self.catalog,
                &self.fees,
                &RankerConfig {
                    min_funding_rate: cfg.trading.min_funding_rate,
                    min_volume_24h: cfg.risk.min_volume_24h,
                    min_holding_periods: cfg.risk.min_holding_periods,
                },
            )
            .into_iter()
            .filter(|o| o.passes_filters)
            .map(|o| Candidate {
                spot_symbol: o.spot_symbol,
                perp_symbol: o.perp_symbol,
                score: None,
            })
            .collect(),
        }
    }

    async fn run_entries(
        &self,
        cfg: &Settings,
        candidates: Vec<Candidate>,
        mut free_balance: Decimal,
    ) -> (usize, usize) {
        let mut entered = 0;
        let mut skipped = 0;
        // Exposure is computed once and maintained incrementally; open
        // positions cannot change under us while the cycle lock is held.
        let mut current_exposure = self.manager.current_exposure();

        for candidate in candidates {
            let open_positions = self.manager.open_positions();
            let intended = free_balance.min(cfg.trading.max_position_size_usd);

            if let Err(e) =
                self.risk
                    .check_can_open(&candidate.perp_symbol, intended, &open_positions)
            {
                debug!(perp = %candidate.perp_symbol, reason = %e, "risk gate skipped candidate");
                skipped += 1;
                continue;
            }

            let budget = match (&self.sizer, candidate.score) {
                (Some(sizer), Some(score)) => {
                    match sizer.compute_signal_budget(
                        score,
                        cfg.trading.max_position_size_usd,
                        current_exposure,
                    ) {
                        Some(budget) => budget,
                        // No budget remains for any pair; stop trying.
                        None => break,
                    }
                }
                _ => cfg.trading.max_position_size_usd,
            };

            let available = free_balance.min(budget);
            match self
                .manager
                .open_position(&candidate.spot_symbol, &candidate.perp_symbol, available)
                .await
            {
                Ok(position) => {
                    entered += 1;
                    current_exposure += position.notional();
                    free_balance -= position.quantity * position.spot_entry_price;
                }
                Err(TradeError::InsufficientSize { symbol }) => {
                    debug!(%symbol, "candidate below exchange minimums");
                    skipped += 1;
                }
                Err(e) => {
                    error!(perp = %candidate.perp_symbol, error = %e, "entry failed");
                    skipped += 1;
                }
            }
        }
        (entered, skipped)
    }

    /// Record one funding payment per open position when a settlement
    /// interval has elapsed on the tracker's clock.
    pub fn settle_if_due(&self, rates: &[FundingRateData]) {
        if !self.pnl.settlement_due() {
            return;
        }
        let open = self.manager.open_positions();
        self.pnl.simulate_funding_settlement(&open, |symbol| {
            rates
                .iter()
                .find(|r| r.symbol == symbol)
                .map(|r| (r.rate, r.mark_price))
        });
    }
}

/// Live loop driver. At most one cycle is ever in flight; the lock also
/// serializes cycles against stop-time close-all.
pub struct Orchestrator {
    settings: Settings,
    runtime: RwLock<RuntimeConfig>,
    cache: Arc<FundingCache>,
    cycle: TradeCycle,
    risk: Arc<RiskManager>,
    client: Arc<dyn ExchangeClient>,
    fetcher: Option<Arc<HistoricalFetcher>>,
    emergency: SyncMutex<Option<Arc<EmergencyController>>>,
    cycle_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        cache: Arc<FundingCache>,
        cycle: TradeCycle,
        risk: Arc<RiskManager>,
        client: Arc<dyn ExchangeClient>,
        fetcher: Option<Arc<HistoricalFetcher>>,
    ) -> Self {
        Self {
            settings,
            runtime: RwLock::new(RuntimeConfig::default()),
            cache,
            cycle,
            risk,
            client,
            fetcher,
            emergency: SyncMutex::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    /// Second phase of construction: the controller needs the position
    /// manager (built before the orchestrator), the orchestrator needs the
    /// controller.
    pub fn set_emergency_controller(&self, controller: Arc<EmergencyController>) {
        *self.emergency.lock() = Some(controller);
    }

    pub fn set_runtime_config(&self, overlay: RuntimeConfig) {
        info!(?overlay, "runtime config updated, applies from next cycle");
        *self.runtime.write() = overlay;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn manager(&self) -> &Arc<PositionManager> {
        self.cycle.manager()
    }

    /// Spawn the loop as a background task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop().await })
    }

    /// Re-enter the loop after a stop. No-op while already running.
    pub fn restart(self: &Arc<Self>) {
        if self.is_running() {
            warn!("restart requested while running, ignoring");
            return;
        }
        info!("restarting autonomous loop");
        let _ = self.start();
    }

    async fn run_loop(&self) {
        info!("🚀 autonomous funding-arbitrage loop started");
        while self.is_running() {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "cycle failed, continuing");
            }
            let interval = {
                let cfg = self.runtime.read().apply(&self.settings);
                Duration::from_secs(cfg.trading.scan_interval_secs)
            };
            tokio::time::sleep(interval).await;
        }
        info!("autonomous loop exited");
    }

    /// One full cycle under the cycle lock.
    pub async fn run_cycle(&self) -> Result<()> {
        let _guard = self.cycle_lock.lock().await;
        let cfg = self.runtime.read().apply(&self.settings);

        if let Some(controller) = self.emergency.lock().clone() {
            if controller.is_triggered() {
                debug!("emergency stop active, skipping cycle");
                return Ok(());
            }
        }

        // 1. Non-blocking forward top-up of tracked history.
        if cfg.history.enabled {
            if let Some(fetcher) = &self.fetcher {
                match fetcher.tracked_symbols().await {
                    Ok(symbols) if !symbols.is_empty() => {
                        if let Err(e) = fetcher.incremental_update(&symbols).await {
                            warn!(error = %e, "incremental history update failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "tracked symbol lookup failed"),
                }
            }
        }

        // 2. Scan.
        let rates = self.cache.all_rates();
        if rates.is_empty() {
            debug!("funding cache empty, skipping cycle");
            return Ok(());
        }

        let free_balance = self.free_balance(&cfg).await?;

        // 3-5. Rank, exits, entries.
        let report = self.cycle.run(&cfg, &rates, free_balance).await;

        // 6. Margin monitor.
        let open_count = self.cycle.manager().open_positions().len();
        match self.risk.check_margin_ratio(open_count).await {
            Ok((mmr, _alert)) => {
                if self.risk.is_margin_critical(mmr) {
                    error!(%mmr, "margin critical");
                    let controller = self.emergency.lock().clone();
                    if let Some(controller) = controller {
                        controller.trigger("margin ratio critical").await;
                        return Ok(());
                    }
                }
            }
            Err(e) => warn!(error = %e, "margin check failed"),
        }

        // 7. Funding settlement.
        self.cycle.settle_if_due(&rates);

        // 8. Status.
        let summary = self.cycle.pnl().portfolio_summary();
        info!(
            candidates = report.candidates,
            entered = report.entered,
            exited = report.exited,
            skipped = report.skipped,
            open = summary.open_positions,
            funding = %summary.total_funding,
            net = %summary.net,
            "cycle complete"
        );
        Ok(())
    }

    async fn free_balance(&self, cfg: &Settings) -> Result<Decimal> {
        match cfg.exchange.mode {
            TradeMode::Live => Ok(self.client.fetch_balance().await?.total_available),
            TradeMode::Paper => {
                let deployed = self.cycle.manager().current_exposure();
                Ok((cfg.risk.paper_virtual_equity - deployed).max(Decimal::ZERO))
            }
        }
    }

    /// Synchronous loop kill for the emergency stop callback; the
    /// controller is already closing positions itself.
    pub fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Graceful stop: end the loop and close every open position. A second
    /// stop is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("stop requested but not running");
            return;
        }
        info!("stopping: closing open positions");
        let _guard = self.cycle_lock.lock().await;
        for position in self.cycle.manager().open_positions() {
            match self.cycle.manager().close_position(&position.id).await {
                Ok(_) => info!(id = %position.id, "position closed on shutdown"),
                Err(e) => error!(id = %position.id, error = %e, "shutdown close failed"),
            }
        }
    }
}
