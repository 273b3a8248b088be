//! Failure taxonomy for the engine.
//!
//! Exchange-boundary failures carry a retry classification; trade-protocol
//! failures name the exact way a two-leg open or close went wrong so the
//! orchestrator can decide whether to skip, roll back, or halt.

use rust_decimal::Decimal;
use thiserror::Error;

/// Failures surfaced by the exchange client.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network trouble or venue 5xx. Retry with exponential backoff.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Venue 429 / limit headers. Retry with a 3x backoff multiplier.
    #[error("rate limited by exchange: {0}")]
    RateLimit(String),

    /// Credentials rejected. Do not retry.
    #[error("exchange authentication failed: {0}")]
    Auth(String),

    /// Non-retryable venue rejection (bad request, unknown symbol, ...).
    #[error("permanent exchange error: {0}")]
    Permanent(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimit(_))
    }

    /// Multiplier applied on top of the exponential backoff schedule.
    pub fn backoff_multiplier(&self) -> u32 {
        match self {
            Self::RateLimit(_) => 3,
            _ => 1,
        }
    }
}

/// Failures of the trading protocol itself.
#[derive(Debug, Error)]
pub enum TradeError {
    /// Paper fills need a fresh cached price; a stale or missing entry fails
    /// the individual order and the position manager rolls back.
    #[error("price unavailable for {symbol}")]
    PriceUnavailable { symbol: String },

    /// The sizer could not produce a quantity above exchange minimums.
    #[error("computed quantity below exchange minimums for {symbol}")]
    InsufficientSize { symbol: String },

    /// The two-leg gather exceeded its bounded wait.
    #[error("delta hedge timed out after {timeout_secs}s")]
    DeltaHedgeTimeout { timeout_secs: u64 },

    /// One leg raised while the other may have filled.
    #[error("delta hedge leg failed: {0}")]
    DeltaHedgeError(String),

    /// Fills diverged beyond tolerance; both legs were emergency-closed.
    #[error("delta drift {drift_pct} exceeded tolerance {tolerance}")]
    DeltaDriftExceeded {
        drift_pct: Decimal,
        tolerance: Decimal,
    },

    /// Pre-trade risk gate rejected the candidate.
    #[error("risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    /// The one-shot emergency stop has fired; no further trading.
    #[error("emergency stop triggered: {0}")]
    EmergencyStopTriggered(String),

    /// Position id not known to the manager.
    #[error("unknown position {0}")]
    UnknownPosition(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
