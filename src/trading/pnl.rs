//! Per-position accounting: fees, funding settlements, realized and
//! unrealized PnL.
//!
//! Time comes from the injected clock, so backtests drive the settlement
//! cadence from data timestamps while live trading uses the wall clock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::models::{FundingPayment, Position, PositionPnl};

use super::fees::FeeCalculator;

/// Default funding settlement cadence: 8 hours.
pub const DEFAULT_SETTLEMENT_INTERVAL_MS: i64 = 8 * 3_600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub position_id: String,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub funding_total: Decimal,
    pub unrealized: Decimal,
    pub net: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub open_positions: usize,
    pub closed_positions: usize,
    pub total_entry_fees: Decimal,
    pub total_exit_fees: Decimal,
    pub total_funding: Decimal,
    pub net: Decimal,
}

pub struct PnlTracker {
    records: RwLock<HashMap<String, PositionPnl>>,
    fees: FeeCalculator,
    clock: Arc<dyn Clock>,
    settlement_interval_ms: i64,
    last_settlement_ms: RwLock<Option<i64>>,
}

impl PnlTracker {
    pub fn new(fees: FeeCalculator, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            fees,
            clock,
            settlement_interval_ms: DEFAULT_SETTLEMENT_INTERVAL_MS,
            last_settlement_ms: RwLock::new(None),
        }
    }

    pub fn with_settlement_interval_ms(mut self, interval_ms: i64) -> Self {
        self.settlement_interval_ms = interval_ms;
        self
    }

    pub fn record_open(&self, position: &Position, entry_fee: Decimal) {
        self.records.write().insert(
            position.id.clone(),
            PositionPnl {
                position_id: position.id.clone(),
                entry_fee,
                exit_fee: None,
                funding_payments: Vec::new(),
                spot_exit_price: None,
                perp_exit_price: None,
                closed_at_ms: None,
            },
        );
    }

    /// Append one signed funding payment for the short-perp position.
    pub fn record_funding(
        &self,
        position_id: &str,
        quantity: Decimal,
        rate: Decimal,
        mark_price: Decimal,
        now_ms: i64,
    ) {
        let amount = self.fees.funding_payment(quantity, mark_price, rate, true);
        let mut records = self.records.write();
        let Some(record) = records.get_mut(position_id) else {
            debug!(position_id, "funding for unknown position dropped");
            return;
        };
        record.funding_payments.push(FundingPayment {
            timestamp_ms: now_ms,
            rate,
            mark_price,
            amount,
        });
        debug!(position_id, %rate, %mark_price, %amount, "funding recorded");
    }

    pub fn record_close(
        &self,
        position_id: &str,
        exit_fee: Decimal,
        spot_exit_price: Decimal,
        perp_exit_price: Decimal,
        closed_at_ms: i64,
    ) {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(position_id) {
            record.exit_fee = Some(exit_fee);
            record.spot_exit_price = Some(spot_exit_price);
            record.perp_exit_price = Some(perp_exit_price);
            record.closed_at_ms = Some(closed_at_ms);
        }
    }

    /// True when a settlement interval has elapsed since the last one (or
    /// none has happened yet). Marks the settlement time when it fires.
    pub fn settlement_due(&self) -> bool {
        let now = self.clock.now_ms();
        let mut last = self.last_settlement_ms.write();
        match *last {
            Some(at) if now - at < self.settlement_interval_ms => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// One funding payment per open position at the current rate and mark.
    /// `rate_lookup` maps a perp symbol to `(rate, mark_price)`.
    pub fn simulate_funding_settlement<F>(&self, open_positions: &[Position], rate_lookup: F)
    where
        F: Fn(&str) -> Option<(Decimal, Decimal)>,
    {
        let now = self.clock.now_ms();
        let mut settled = 0usize;
        for position in open_positions {
            let Some((rate, mark_price)) = rate_lookup(&position.perp_symbol) else {
                debug!(symbol = %position.perp_symbol, "no rate for settlement, skipped");
                continue;
            };
            self.record_funding(&position.id, position.quantity, rate, mark_price, now);
            settled += 1;
        }
        if settled > 0 {
            info!(settled, "funding settlement applied");
        }
    }

    pub fn pnl_record(&self, position_id: &str) -> Option<PositionPnl> {
        self.records.read().get(position_id).cloned()
    }

    /// Fees-and-funding breakdown; `unrealized` is supplied by the caller
    /// (mark-to-market needs current prices this tracker does not hold).
    pub fn total_pnl(&self, position_id: &str, unrealized: Decimal) -> Option<PnlBreakdown> {
        let records = self.records.read();
        let record = records.get(position_id)?;
        let exit_fee = record.exit_fee.unwrap_or(Decimal::ZERO);
        let funding_total = record.funding_total();
        Some(PnlBreakdown {
            position_id: position_id.to_string(),
            entry_fee: record.entry_fee,
            exit_fee,
            funding_total,
            unrealized,
            net: funding_total + unrealized - record.entry_fee - exit_fee,
        })
    }

    pub fn portfolio_summary(&self) -> PortfolioSummary {
        let records = self.records.read();
        let mut summary = PortfolioSummary::default();
        for record in records.values() {
            if record.closed_at_ms.is_some() {
                summary.closed_positions += 1;
            } else {
                summary.open_positions += 1;
            }
            summary.total_entry_fees += record.entry_fee;
            summary.total_exit_fees += record.exit_fee.unwrap_or(Decimal::ZERO);
            summary.total_funding += record.funding_total();
        }
        summary.net =
            summary.total_funding - summary.total_entry_fees - summary.total_exit_fees;
        summary
    }
}
