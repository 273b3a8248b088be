//! Carrybot - autonomous funding-rate arbitrage engine.
//!
//! Scans every linear USDT perpetual on the venue, opens delta-neutral
//! long-spot/short-perp positions where funding beats fees, collects the
//! funding, and unwinds when the opportunity decays or risk limits breach.
//! Paper and live trading share one code path behind the executor
//! capability.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carrybot::clock::{Clock, WallClock};
use carrybot::config::Settings;
use carrybot::exchange::{BybitClient, ExchangeClient, InstrumentCatalog};
use carrybot::history::{HistoricalFetcher, HistoricalStore, HistoryReader};
use carrybot::market::{FundingCache, FundingPoller, TickerService};
use carrybot::models::{StrategyMode, TradeMode};
use carrybot::orchestrator::{Orchestrator, TradeCycle};
use carrybot::risk::{EmergencyController, RiskManager};
use carrybot::strategy::{DynamicSizer, SignalEngine};
use carrybot::trading::{
    Executor, FeeCalculator, LiveExecutor, PaperExecutor, PnlTracker, PositionManager,
};

/// Funding cache poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "carrybot", about = "Funding-rate arbitrage engine")]
struct Args {
    /// Override TRADE_MODE from the environment (paper|live).
    #[arg(long)]
    mode: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,carrybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::from_env()?;
    init_tracing();

    if let Some(mode) = args.mode.as_deref() {
        settings.exchange.mode = match mode {
            "live" => TradeMode::Live,
            "paper" => TradeMode::Paper,
            other => anyhow::bail!("unknown mode {other:?}, expected paper or live"),
        };
    }

    info!(
        mode = ?settings.exchange.mode,
        strategy = ?settings.trading.strategy_mode,
        "🚀 carrybot starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(WallClock);
    let client: Arc<dyn ExchangeClient> =
        Arc::new(BybitClient::new(&settings.exchange).context("building exchange client")?);

    // Market catalog: instrument limits and spot-leg eligibility.
    let catalog = Arc::new(InstrumentCatalog::new());
    let markets = client
        .fetch_markets()
        .await
        .context("fetching market catalog")?;
    catalog.refresh(markets);
    info!(markets = catalog.len(), "market catalog loaded");

    // Funding cache + ticker service, fed by the poller.
    let ticker_service = Arc::new(TickerService::new());
    let funding_cache = Arc::new(FundingCache::new());
    let poller = FundingPoller::new(
        Arc::clone(&client),
        Arc::clone(&funding_cache),
        Arc::clone(&ticker_service),
        Arc::clone(&clock),
        POLL_INTERVAL,
    );
    // Warm the cache once before anything consults it.
    poller.poll_once().await;
    info!(pairs = funding_cache.len(), "funding cache warmed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    // Historical store + startup backfill (blocking by design).
    let mut store: Option<Arc<HistoricalStore>> = None;
    let mut fetcher: Option<Arc<HistoricalFetcher>> = None;
    if settings.history.enabled {
        let opened = Arc::new(
            HistoricalStore::new(&settings.history.db_path).context("opening historical store")?,
        );
        let built = Arc::new(
            HistoricalFetcher::new(
                Arc::clone(&client),
                Arc::clone(&opened),
                settings.history.clone(),
                Arc::clone(&clock),
            )
            .with_funding_cache(Arc::clone(&funding_cache))
            .with_progress(Arc::new(|completed, total, symbol: &str| {
                if symbol.is_empty() {
                    info!(completed, total, "historical backfill complete");
                } else {
                    info!(completed, total, symbol, "backfilling history");
                }
            })),
        );

        let tracked = built
            .refresh_tracked_pairs(&funding_cache.all_rates())
            .await
            .context("building tracked-pair roster")?;
        built
            .ensure_data_ready(&tracked, settings.history.lookback_days)
            .await
            .context("startup historical backfill")?;

        store = Some(opened);
        fetcher = Some(built);
    }

    // One executor surface, two implementations.
    let fees = FeeCalculator::new(settings.fees.clone());
    let executor: Arc<dyn Executor> = match settings.exchange.mode {
        TradeMode::Live => Arc::new(LiveExecutor::new(Arc::clone(&client))),
        TradeMode::Paper => Arc::new(PaperExecutor::new(
            Arc::clone(&ticker_service),
            fees.clone(),
            Arc::clone(&clock),
        )),
    };

    let pnl = Arc::new(PnlTracker::new(fees.clone(), Arc::clone(&clock)));
    let manager = Arc::new(PositionManager::new(
        executor,
        Arc::clone(&catalog),
        Arc::clone(&ticker_service),
        Arc::clone(&pnl),
        Arc::clone(&clock),
        settings.trading.delta_drift_tolerance,
        settings.trading.order_timeout_secs,
    ));
    let risk = Arc::new(match settings.exchange.mode {
        TradeMode::Live => RiskManager::live(settings.risk.clone(), Arc::clone(&client)),
        TradeMode::Paper => RiskManager::paper(settings.risk.clone()),
    });

    // Optional components are feature-gated, not stubbed.
    let signal_engine = match (settings.trading.strategy_mode, &store) {
        (StrategyMode::Composite, Some(store)) => Some(Arc::new(SignalEngine::new(
            Arc::clone(store) as Arc<dyn HistoryReader>,
            Arc::clone(&clock),
        ))),
        (StrategyMode::Composite, None) => {
            warn!("composite strategy without historical store, degrading to ranked entries");
            None
        }
        (StrategyMode::Simple, _) => None,
    };
    let sizer = (settings.sizing.enabled
        && settings.trading.strategy_mode == StrategyMode::Composite)
        .then(|| DynamicSizer::new(settings.sizing.clone()));

    let cycle = TradeCycle::new(
        Arc::clone(&catalog),
        Arc::clone(&manager),
        Arc::clone(&pnl),
        fees,
        Arc::clone(&risk),
        signal_engine,
        sizer,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        Arc::clone(&funding_cache),
        cycle,
        risk,
        Arc::clone(&client),
        fetcher.clone(),
    ));

    // Two-phase construction: the controller gets a stop closure, the
    // orchestrator gets the controller.
    let emergency = Arc::new(EmergencyController::new(Arc::clone(&manager)));
    let orchestrator_weak: Weak<Orchestrator> = Arc::downgrade(&orchestrator);
    emergency.set_stop_callback(Box::new(move || {
        if let Some(orchestrator) = orchestrator_weak.upgrade() {
            orchestrator.halt();
        }
    }));
    orchestrator.set_emergency_controller(Arc::clone(&emergency));

    // Periodic tracked-pair re-evaluation.
    if let Some(fetcher) = fetcher.clone() {
        let cache = Arc::clone(&funding_cache);
        let mut shutdown = shutdown_tx.subscribe();
        let reeval_interval = Duration::from_secs(
            settings.history.pair_reeval_interval_hours.max(1) as u64 * 3600,
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reeval_interval);
            ticker.tick().await; // roster was just built at startup
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = fetcher.refresh_tracked_pairs(&cache.all_rates()).await {
                            warn!(error = %e, "pair re-evaluation failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    let loop_task = orchestrator.start();

    // Signal surface: SIGINT/SIGTERM stop gracefully, SIGUSR1 fires the
    // emergency controller.
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;

    let mut exit_code = 0;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping");
            orchestrator.stop().await;
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, stopping");
            orchestrator.stop().await;
        }
        _ = sigusr1.recv() => {
            warn!("SIGUSR1 received, triggering emergency stop");
            let survivors = emergency.trigger("operator signal").await;
            if !survivors.is_empty() {
                exit_code = 1;
            }
        }
    }

    // An internally-triggered emergency stop (margin critical) that left
    // positions open also exits non-zero so operators notice.
    if emergency.is_triggered() && !manager.open_positions().is_empty() {
        error!(
            open = manager.open_positions().len(),
            "exiting with positions still open"
        );
        exit_code = 1;
    }

    shutdown_tx.send(true).ok();
    loop_task.abort();
    poller_task.abort();

    let summary = pnl.portfolio_summary();
    info!(
        closed = summary.closed_positions,
        funding = %summary.total_funding,
        net = %summary.net,
        "carrybot stopped"
    );

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
