//! Pre-trade risk gates, margin monitoring and the emergency controller.
//!
//! The margin ratio is always read fresh from the balance endpoint - a
//! cached value defeats the point of the check. Paper mode has no real
//! margin account, so the ratio is simulated from the open-position count
//! against the virtual equity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::RiskSettings;
use crate::error::{ExchangeError, TradeError};
use crate::exchange::ExchangeClient;
use crate::models::{Position, TradeMode};
use crate::trading::PositionManager;

pub struct RiskManager {
    config: RiskSettings,
    /// Present only in live mode; paper and backtest margin is simulated.
    client: Option<Arc<dyn ExchangeClient>>,
    mode: TradeMode,
}

impl RiskManager {
    pub fn live(config: RiskSettings, client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            config,
            client: Some(client),
            mode: TradeMode::Live,
        }
    }

    pub fn paper(config: RiskSettings) -> Self {
        Self {
            config,
            client: None,
            mode: TradeMode::Paper,
        }
    }

    /// Pre-trade gate. `Err` carries the reason the candidate is skipped.
    pub fn check_can_open(
        &self,
        perp_symbol: &str,
        size_usd: Decimal,
        open_positions: &[Position],
    ) -> Result<(), TradeError> {
        if size_usd > self.config.max_position_size_per_pair {
            return Err(TradeError::RiskLimitExceeded(format!(
                "size {size_usd} exceeds per-pair cap {}",
                self.config.max_position_size_per_pair
            )));
        }
        if open_positions.len() >= self.config.max_simultaneous_positions {
            return Err(TradeError::RiskLimitExceeded(format!(
                "already at {} simultaneous positions",
                self.config.max_simultaneous_positions
            )));
        }
        if open_positions.iter().any(|p| p.perp_symbol == perp_symbol) {
            return Err(TradeError::RiskLimitExceeded(format!(
                "{perp_symbol} already has an open position"
            )));
        }
        Ok(())
    }

    /// Fresh maintenance-margin ratio and whether it breaches the alert
    /// threshold. Logs the alert itself; the caller decides on escalation.
    pub async fn check_margin_ratio(
        &self,
        open_count: usize,
    ) -> Result<(Decimal, bool), ExchangeError> {
        let mmr = match (self.mode, &self.client) {
            (TradeMode::Live, Some(client)) => client.fetch_balance().await?.account_mm_rate,
            (TradeMode::Live, None) => {
                return Err(ExchangeError::Permanent(
                    "live risk manager constructed without a client".into(),
                ))
            }
            (TradeMode::Paper, _) => self.simulated_margin_ratio(open_count),
        };

        let is_alert = mmr > self.config.margin_alert_threshold;
        if is_alert {
            warn!(%mmr, threshold = %self.config.margin_alert_threshold, "margin ratio alert");
        }
        Ok((mmr, is_alert))
    }

    pub fn is_margin_critical(&self, mmr: Decimal) -> bool {
        mmr > self.config.margin_critical_threshold
    }

    fn simulated_margin_ratio(&self, open_count: usize) -> Decimal {
        if self.config.paper_virtual_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        Decimal::from(open_count as u64) * self.config.max_position_size_per_pair
            / self.config.paper_virtual_equity
    }
}

const EMERGENCY_CLOSE_ATTEMPTS: u32 = 3;

/// One-shot close-everything controller. The stop callback (set after
/// construction, breaking the orchestrator cycle) is invoked once all close
/// tasks have finished, successfully or not.
pub struct EmergencyController {
    manager: Arc<PositionManager>,
    triggered: AtomicBool,
    stop_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl EmergencyController {
    pub fn new(manager: Arc<PositionManager>) -> Self {
        Self {
            manager,
            triggered: AtomicBool::new(false),
            stop_callback: Mutex::new(None),
        }
    }

    pub fn set_stop_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.stop_callback.lock() = Some(callback);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Close every open position concurrently, retrying each, then stop the
    /// engine. Repeat triggers are no-ops. Returns the positions that could
    /// not be closed.
    pub async fn trigger(&self, reason: &str) -> Vec<Position> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            warn!(reason, "emergency stop already triggered, ignoring");
            return Vec::new();
        }

        let open = self.manager.open_positions();
        error!(reason, open = open.len(), "EMERGENCY STOP - closing all positions");

        let tasks = open.into_iter().map(|position| {
            let manager = Arc::clone(&self.manager);
            async move { close_with_retries(manager, position).await }
        });
        let survivors: Vec<Position> = join_all(tasks).await.into_iter().flatten().collect();

        for position in &survivors {
            error!(
                id = %position.id,
                spot = %position.spot_symbol,
                perp = %position.perp_symbol,
                qty = %position.quantity,
                legs = "long spot / short perp",
                "position STILL OPEN after emergency close, manual intervention required"
            );
        }

        if let Some(callback) = self.stop_callback.lock().as_ref() {
            callback();
        }
        info!(
            survivors = survivors.len(),
            "emergency close-all finished"
        );
        survivors
    }
}

/// Linear backoff: 1s after the first failure, 2s after the second.
async fn close_with_retries(
    manager: Arc<PositionManager>,
    position: Position,
) -> Option<Position> {
    for attempt in 1..=EMERGENCY_CLOSE_ATTEMPTS {
        match manager.close_position(&position.id).await {
            Ok(_) => return None,
            Err(TradeError::UnknownPosition(_)) => return None, // already gone
            Err(e) => {
                warn!(
                    id = %position.id,
                    attempt,
                    error = %e,
                    "emergency close attempt failed"
                );
                if attempt < EMERGENCY_CLOSE_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                }
            }
        }
    }
    Some(position)
}
