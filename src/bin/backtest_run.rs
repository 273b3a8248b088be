//! Backtest runner: replay stored funding and candle history through the
//! live strategy code and print the results.
//!
//! The history database is the one the main binary maintains; run the bot
//! (even in paper mode) long enough to backfill, then point this tool at it.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carrybot::backtest::{BacktestEngine, BacktestResult};
use carrybot::config::Settings;
use carrybot::history::HistoricalStore;
use carrybot::models::StrategyMode;

#[derive(Parser, Debug)]
#[command(name = "backtest_run", about = "Replay history through the strategy")]
struct Args {
    /// Path to the historical database.
    #[arg(long, default_value = "./carrybot_history.db")]
    db: String,

    /// Perpetual symbols to replay (comma separated). Defaults to the
    /// tracked-pair roster in the database.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Strategy mode: simple | composite.
    #[arg(long, default_value = "simple")]
    strategy: String,

    /// Starting balance in USDT.
    #[arg(long, default_value = "10000")]
    balance: String,

    /// Sweep entry parameters instead of a single run.
    #[arg(long)]
    sweep: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let balance = Decimal::from_str(&args.balance).context("parsing --balance")?;

    let mut settings = Settings::from_env()?;
    settings.trading.strategy_mode = match args.strategy.as_str() {
        "simple" => StrategyMode::Simple,
        "composite" => StrategyMode::Composite,
        other => bail!("unknown strategy {other:?}, expected simple or composite"),
    };

    let store = Arc::new(HistoricalStore::new(&args.db).context("opening history db")?);
    let status = store.data_status().await?;
    info!(
        records = status.total_records,
        earliest = ?status.earliest_ms,
        latest = ?status.latest_ms,
        "history loaded"
    );

    let symbols = if args.symbols.is_empty() {
        let tracked: Vec<String> = store
            .get_tracked_pairs(true)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect();
        if tracked.is_empty() {
            bail!("no symbols given and no tracked pairs in the database");
        }
        tracked
    } else {
        args.symbols.clone()
    };
    info!(symbols = ?symbols, "replaying");

    let engine = BacktestEngine::new(store);

    if args.sweep {
        let variants = sweep_variants(&settings);
        let sweep = engine.run_sweep(variants, &symbols, balance).await?;

        println!(
            "\n=== Parameter sweep ({} configurations) ===",
            sweep.summaries.len()
        );
        for summary in &sweep.summaries {
            println!(
                "{:<28} trades {:>4}  win rate {:>6}  pnl {:>12}",
                summary.label,
                summary.metrics.total_trades,
                summary.metrics.win_rate,
                summary.metrics.total_pnl.round_dp(2),
            );
        }
        println!("\nbest: {}", sweep.best_label);
        print_result(&sweep.best, balance);
    } else {
        let result = engine.run(&settings, &symbols, balance).await?;
        print_result(&result, balance);
    }

    Ok(())
}

/// A small grid over the entry floor (and entry threshold under the
/// composite strategy).
fn sweep_variants(base: &Settings) -> Vec<(String, Settings)> {
    let mut variants = Vec::new();
    for min_rate in [dec!(0.0001), dec!(0.0003), dec!(0.0005)] {
        match base.trading.strategy_mode {
            StrategyMode::Simple => {
                let mut cfg = base.clone();
                cfg.trading.min_funding_rate = min_rate;
                variants.push((format!("min_rate={min_rate}"), cfg));
            }
            StrategyMode::Composite => {
                for entry in [dec!(0.4), dec!(0.5), dec!(0.6)] {
                    let mut cfg = base.clone();
                    cfg.trading.min_funding_rate = min_rate;
                    cfg.signal.entry_threshold = entry;
                    variants.push((format!("min_rate={min_rate},entry={entry}"), cfg));
                }
            }
        }
    }
    variants
}

fn print_result(result: &BacktestResult, initial_balance: Decimal) {
    let m = &result.metrics;
    println!("\n=== Backtest result ===");
    println!("trades (round trips): {}", m.total_trades);
    println!("wins / losses:        {} / {}", m.winning_trades, m.losing_trades);
    println!("win rate:             {}", m.win_rate);
    println!("total funding:        {}", m.total_funding.round_dp(2));
    println!("total fees:           {}", m.total_fees.round_dp(2));
    println!("total pnl:            {}", m.total_pnl.round_dp(2));
    println!("max drawdown:         {}", m.max_drawdown.round_dp(4));
    println!(
        "final equity:         {} (from {})",
        m.final_equity.round_dp(2),
        initial_balance
    );

    if !result.pnl_histogram.is_empty() {
        println!("\npnl histogram (1 USDT buckets):");
        for (bucket, count) in &result.pnl_histogram {
            println!("  {:>10} : {}", bucket, "#".repeat(*count));
        }
    }

    if !result.trades.is_empty() {
        println!("\ntrades:");
        for trade in &result.trades {
            println!(
                "  {}  qty {:>10}  funding {:>10}  fees {:>8}  net {:>10}",
                trade.perp_symbol,
                trade.quantity,
                trade.funding_total.round_dp(2),
                (trade.entry_fee + trade.exit_fee).round_dp(2),
                trade.net_pnl.round_dp(2),
            );
        }
    }
}
