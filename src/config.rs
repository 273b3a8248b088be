//! Engine configuration.
//!
//! All options load from environment variables (with `.env` support) and
//! fall back to safe defaults; the immutable [`Settings`] tree is read once
//! at startup. The [`RuntimeConfig`] overlay carries the handful of strategy
//! parameters an operator may adjust while the engine runs; it is applied by
//! copying non-`None` fields over a clone of the settings at the top of each
//! cycle and is never read mid-cycle.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{StrategyMode, TradeMode};

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettings {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Use the venue's demo/testnet host.
    pub demo: bool,
    pub mode: TradeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSettings {
    pub min_funding_rate: Decimal,
    pub max_position_size_usd: Decimal,
    pub delta_drift_tolerance: Decimal,
    pub order_timeout_secs: u64,
    pub scan_interval_secs: u64,
    pub strategy_mode: StrategyMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSettings {
    pub spot_taker: Decimal,
    pub perp_taker: Decimal,
    pub spot_maker: Decimal,
    pub perp_maker: Decimal,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            spot_taker: dec!(0.001),
            perp_taker: dec!(0.00055),
            spot_maker: dec!(0.001),
            perp_maker: dec!(0.0002),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    pub max_position_size_per_pair: Decimal,
    pub max_simultaneous_positions: usize,
    pub exit_funding_rate: Decimal,
    pub margin_alert_threshold: Decimal,
    pub margin_critical_threshold: Decimal,
    pub min_volume_24h: Decimal,
    pub min_holding_periods: u32,
    /// Equity assumed when simulating the margin ratio in paper mode.
    pub paper_virtual_equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySettings {
    pub enabled: bool,
    pub db_path: String,
    pub lookback_days: i64,
    pub ohlcv_interval: String,
    pub top_pairs_count: usize,
    pub pair_reeval_interval_hours: i64,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
    pub fetch_batch_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSettings {
    pub trend_ema_span: usize,
    pub trend_stable_threshold: Decimal,
    pub persistence_threshold: Decimal,
    pub persistence_max_periods: u32,
    /// Funding rate per period that saturates the rate-level sub-score.
    pub rate_level_cap: Decimal,
    /// Basis that saturates the basis sub-score.
    pub basis_cap: Decimal,
    pub volume_lookback_days: i64,
    pub volume_decline_ratio: Decimal,
    pub weight_rate_level: Decimal,
    pub weight_trend: Decimal,
    pub weight_persistence: Decimal,
    pub weight_basis: Decimal,
    pub entry_threshold: Decimal,
    pub exit_threshold: Decimal,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            trend_ema_span: 6,
            trend_stable_threshold: dec!(0.00001),
            persistence_threshold: dec!(0.0001),
            persistence_max_periods: 30,
            rate_level_cap: dec!(0.001),
            basis_cap: dec!(0.002),
            volume_lookback_days: 3,
            volume_decline_ratio: dec!(0.7),
            weight_rate_level: dec!(0.35),
            weight_trend: dec!(0.25),
            weight_persistence: dec!(0.25),
            weight_basis: dec!(0.15),
            entry_threshold: dec!(0.5),
            exit_threshold: dec!(0.3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingSettings {
    pub enabled: bool,
    pub min_allocation_fraction: Decimal,
    pub max_allocation_fraction: Decimal,
    pub max_portfolio_exposure: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub trading: TradingSettings,
    pub fees: FeeSettings,
    pub risk: RiskSettings,
    pub history: HistorySettings,
    pub signal: SignalSettings,
    pub sizing: SizingSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mode = match env::var("TRADE_MODE").unwrap_or_else(|_| "paper".to_string()).as_str() {
            "live" => TradeMode::Live,
            _ => TradeMode::Paper,
        };
        let strategy_mode = match env::var("STRATEGY_MODE")
            .unwrap_or_else(|_| "simple".to_string())
            .as_str()
        {
            "composite" => StrategyMode::Composite,
            _ => StrategyMode::Simple,
        };

        let exchange = ExchangeSettings {
            api_key: env::var("BYBIT_API_KEY").ok(),
            api_secret: env::var("BYBIT_API_SECRET").ok(),
            demo: env_bool("BYBIT_DEMO", true),
            mode,
        };

        if exchange.mode == TradeMode::Live {
            exchange
                .api_key
                .as_ref()
                .context("BYBIT_API_KEY required in live mode")?;
            exchange
                .api_secret
                .as_ref()
                .context("BYBIT_API_SECRET required in live mode")?;
        }

        let trading = TradingSettings {
            min_funding_rate: env_decimal("MIN_FUNDING_RATE", dec!(0.0001)),
            max_position_size_usd: env_decimal("MAX_POSITION_SIZE_USD", dec!(1000)),
            delta_drift_tolerance: env_decimal("DELTA_DRIFT_TOLERANCE", dec!(0.02)),
            order_timeout_secs: env_parse("ORDER_TIMEOUT_SECONDS", 5),
            scan_interval_secs: env_parse("SCAN_INTERVAL", 60),
            strategy_mode,
        };

        let fees = FeeSettings {
            spot_taker: env_decimal("FEE_SPOT_TAKER", dec!(0.001)),
            perp_taker: env_decimal("FEE_PERP_TAKER", dec!(0.00055)),
            spot_maker: env_decimal("FEE_SPOT_MAKER", dec!(0.001)),
            perp_maker: env_decimal("FEE_PERP_MAKER", dec!(0.0002)),
        };

        let risk = RiskSettings {
            max_position_size_per_pair: env_decimal("MAX_POSITION_SIZE_PER_PAIR", dec!(1000)),
            max_simultaneous_positions: env_parse("MAX_SIMULTANEOUS_POSITIONS", 5),
            exit_funding_rate: env_decimal("EXIT_FUNDING_RATE", dec!(0.00005)),
            margin_alert_threshold: env_decimal("MARGIN_ALERT_THRESHOLD", dec!(0.8)),
            margin_critical_threshold: env_decimal("MARGIN_CRITICAL_THRESHOLD", dec!(0.9)),
            min_volume_24h: env_decimal("MIN_VOLUME_24H", dec!(1000000)),
            min_holding_periods: env_parse("MIN_HOLDING_PERIODS", 3),
            paper_virtual_equity: env_decimal("PAPER_VIRTUAL_EQUITY", dec!(10000)),
        };

        let history = HistorySettings {
            enabled: env_bool("HISTORICAL_ENABLED", true),
            db_path: env::var("HISTORICAL_DB_PATH")
                .unwrap_or_else(|_| "./carrybot_history.db".to_string()),
            lookback_days: env_parse("HISTORICAL_LOOKBACK_DAYS", 365),
            ohlcv_interval: env::var("OHLCV_INTERVAL").unwrap_or_else(|_| "1h".to_string()),
            top_pairs_count: env_parse("TOP_PAIRS_COUNT", 20),
            pair_reeval_interval_hours: env_parse("PAIR_REEVAL_INTERVAL_HOURS", 168),
            max_retries: env_parse("HISTORICAL_MAX_RETRIES", 5),
            retry_base_delay_secs: env_parse("HISTORICAL_RETRY_BASE_DELAY", 1.0),
            fetch_batch_delay_ms: env_parse("FETCH_BATCH_DELAY_MS", 100),
        };

        let signal_defaults = SignalSettings::default();
        let signal = SignalSettings {
            trend_ema_span: env_parse("TREND_EMA_SPAN", signal_defaults.trend_ema_span),
            trend_stable_threshold: env_decimal(
                "TREND_STABLE_THRESHOLD",
                signal_defaults.trend_stable_threshold,
            ),
            persistence_threshold: env_decimal(
                "PERSISTENCE_THRESHOLD",
                signal_defaults.persistence_threshold,
            ),
            persistence_max_periods: env_parse(
                "PERSISTENCE_MAX_PERIODS",
                signal_defaults.persistence_max_periods,
            ),
            rate_level_cap: env_decimal("RATE_LEVEL_CAP", signal_defaults.rate_level_cap),
            basis_cap: env_decimal("BASIS_WEIGHT_CAP", signal_defaults.basis_cap),
            volume_lookback_days: env_parse(
                "VOLUME_LOOKBACK_DAYS",
                signal_defaults.volume_lookback_days,
            ),
            volume_decline_ratio: env_decimal(
                "VOLUME_DECLINE_RATIO",
                signal_defaults.volume_decline_ratio,
            ),
            weight_rate_level: env_decimal("WEIGHT_RATE_LEVEL", signal_defaults.weight_rate_level),
            weight_trend: env_decimal("WEIGHT_TREND", signal_defaults.weight_trend),
            weight_persistence: env_decimal(
                "WEIGHT_PERSISTENCE",
                signal_defaults.weight_persistence,
            ),
            weight_basis: env_decimal("WEIGHT_BASIS", signal_defaults.weight_basis),
            entry_threshold: env_decimal("ENTRY_THRESHOLD", signal_defaults.entry_threshold),
            exit_threshold: env_decimal("EXIT_THRESHOLD", signal_defaults.exit_threshold),
        };

        let sizing = SizingSettings {
            enabled: env_bool("SIZING_ENABLED", false),
            min_allocation_fraction: env_decimal("MIN_ALLOCATION_FRACTION", dec!(0.3)),
            max_allocation_fraction: env_decimal("MAX_ALLOCATION_FRACTION", dec!(1.0)),
            max_portfolio_exposure: env_decimal("MAX_PORTFOLIO_EXPOSURE", dec!(5000)),
        };

        Ok(Self {
            exchange,
            trading,
            fees,
            risk,
            history,
            signal,
            sizing,
        })
    }
}

/// Mutable overlay of strategy parameters. Non-`None` fields replace their
/// counterparts in a clone of the immutable settings at cycle start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub min_funding_rate: Option<Decimal>,
    pub exit_funding_rate: Option<Decimal>,
    pub max_position_size_usd: Option<Decimal>,
    pub entry_threshold: Option<Decimal>,
    pub exit_threshold: Option<Decimal>,
    pub strategy_mode: Option<StrategyMode>,
    pub scan_interval_secs: Option<u64>,
}

impl RuntimeConfig {
    pub fn apply(&self, base: &Settings) -> Settings {
        let mut cfg = base.clone();
        if let Some(v) = self.min_funding_rate {
            cfg.trading.min_funding_rate = v;
        }
        if let Some(v) = self.exit_funding_rate {
            cfg.risk.exit_funding_rate = v;
        }
        if let Some(v) = self.max_position_size_usd {
            cfg.trading.max_position_size_usd = v;
        }
        if let Some(v) = self.entry_threshold {
            cfg.signal.entry_threshold = v;
        }
        if let Some(v) = self.exit_threshold {
            cfg.signal.exit_threshold = v;
        }
        if let Some(v) = self.strategy_mode {
            cfg.trading.strategy_mode = v;
        }
        if let Some(v) = self.scan_interval_secs {
            cfg.trading.scan_interval_secs = v;
        }
        cfg
    }
}
