//! Delta-neutral position lifecycle.
//!
//! Both legs are submitted concurrently under a bounded wait. Whatever goes
//! wrong (timeout, a failed leg, fills drifting apart) the protocol
//! unwinds to flat: cancel what may be resting, reverse what filled, and
//! report the precise failure. All position mutations serialize on one lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::TradeError;
use crate::exchange::InstrumentCatalog;
use crate::market::TickerService;
use crate::models::{
    OrderCategory, OrderRequest, OrderResult, OrderSide, Position, PositionStatus,
};

use super::executor::Executor;
use super::pnl::PnlTracker;
use super::sizing;

pub struct PositionManager {
    executor: Arc<dyn Executor>,
    catalog: Arc<InstrumentCatalog>,
    ticker: Arc<TickerService>,
    pnl: Arc<PnlTracker>,
    clock: Arc<dyn Clock>,
    drift_tolerance: Decimal,
    order_timeout: Duration,
    mutation_lock: Mutex<()>,
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<dyn Executor>,
        catalog: Arc<InstrumentCatalog>,
        ticker: Arc<TickerService>,
        pnl: Arc<PnlTracker>,
        clock: Arc<dyn Clock>,
        drift_tolerance: Decimal,
        order_timeout_secs: u64,
    ) -> Self {
        Self {
            executor,
            catalog,
            ticker,
            pnl,
            clock,
            drift_tolerance,
            order_timeout: Duration::from_secs(order_timeout_secs),
            mutation_lock: Mutex::new(()),
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed.read().clone()
    }

    pub fn has_open_for(&self, perp_symbol: &str) -> bool {
        self.open
            .read()
            .values()
            .any(|p| p.perp_symbol == perp_symbol)
    }

    /// `sum(quantity x perp_entry_price)` over open positions.
    pub fn current_exposure(&self) -> Decimal {
        self.open.read().values().map(|p| p.notional()).sum()
    }

    pub async fn open_position(
        &self,
        spot_symbol: &str,
        perp_symbol: &str,
        budget: Decimal,
    ) -> Result<Position, TradeError> {
        let _guard = self.mutation_lock.lock().await;

        let spot_info =
            self.catalog
                .instrument(spot_symbol)
                .ok_or_else(|| TradeError::InsufficientSize {
                    symbol: spot_symbol.to_string(),
                })?;
        let perp_info =
            self.catalog
                .instrument(perp_symbol)
                .ok_or_else(|| TradeError::InsufficientSize {
                    symbol: perp_symbol.to_string(),
                })?;

        let price = self
            .ticker
            .price(perp_symbol)
            .ok_or_else(|| TradeError::PriceUnavailable {
                symbol: perp_symbol.to_string(),
            })?
            .price;

        let quantity = sizing::calculate_matching_quantity(&spot_info, &perp_info, price, budget)
            .ok_or_else(|| TradeError::InsufficientSize {
                symbol: perp_symbol.to_string(),
            })?;

        let spot_req =
            OrderRequest::market(spot_symbol, OrderSide::Buy, quantity, OrderCategory::Spot);
        let perp_req =
            OrderRequest::market(perp_symbol, OrderSide::Sell, quantity, OrderCategory::Linear);

        let (spot_fill, perp_fill) = self.submit_pair(spot_req, perp_req).await?;

        let check = sizing::validate_delta(
            spot_fill.filled_qty,
            perp_fill.filled_qty,
            self.drift_tolerance,
        );
        if !check.within_tolerance {
            error!(
                spot = %spot_fill.filled_qty,
                perp = %perp_fill.filled_qty,
                drift = %check.drift_pct,
                "fills drifted beyond tolerance, emergency closing both legs"
            );
            self.reverse_fills(&spot_fill, &perp_fill).await;
            return Err(TradeError::DeltaDriftExceeded {
                drift_pct: check.drift_pct,
                tolerance: self.drift_tolerance,
            });
        }

        // Conservative delta-neutral bound: both legs carry the smaller fill.
        let matched_qty = spot_fill.filled_qty.min(perp_fill.filled_qty);
        let position = Position {
            id: Uuid::new_v4().to_string(),
            spot_symbol: spot_symbol.to_string(),
            perp_symbol: perp_symbol.to_string(),
            quantity: matched_qty,
            spot_entry_price: spot_fill.filled_price,
            perp_entry_price: perp_fill.filled_price,
            opened_at_ms: self.clock.now_ms(),
            status: PositionStatus::Open,
        };

        self.pnl
            .record_open(&position, spot_fill.fee + perp_fill.fee);
        self.open
            .write()
            .insert(position.id.clone(), position.clone());

        info!(
            id = %position.id,
            spot = spot_symbol,
            perp = perp_symbol,
            qty = %position.quantity,
            spot_price = %position.spot_entry_price,
            perp_price = %position.perp_entry_price,
            "position opened"
        );
        Ok(position)
    }

    pub async fn close_position(&self, position_id: &str) -> Result<Position, TradeError> {
        let _guard = self.mutation_lock.lock().await;

        let position = self
            .open
            .read()
            .get(position_id)
            .cloned()
            .ok_or_else(|| TradeError::UnknownPosition(position_id.to_string()))?;

        let spot_req = OrderRequest::market(
            &position.spot_symbol,
            OrderSide::Sell,
            position.quantity,
            OrderCategory::Spot,
        );
        let perp_req = OrderRequest::market(
            &position.perp_symbol,
            OrderSide::Buy,
            position.quantity,
            OrderCategory::Linear,
        );

        let (spot_fill, perp_fill) = self.submit_pair(spot_req, perp_req).await?;

        self.pnl.record_close(
            position_id,
            spot_fill.fee + perp_fill.fee,
            spot_fill.filled_price,
            perp_fill.filled_price,
            self.clock.now_ms(),
        );

        let mut closed = position.clone();
        closed.status = PositionStatus::Closed;
        self.open.write().remove(position_id);
        self.closed.write().push(closed.clone());

        info!(
            id = %closed.id,
            perp = %closed.perp_symbol,
            qty = %closed.quantity,
            spot_exit = %spot_fill.filled_price,
            perp_exit = %perp_fill.filled_price,
            "position closed"
        );
        Ok(closed)
    }

    /// Submit both legs concurrently; unwind on timeout or a failed leg.
    async fn submit_pair(
        &self,
        spot_req: OrderRequest,
        perp_req: OrderRequest,
    ) -> Result<(OrderResult, OrderResult), TradeError> {
        let spot_slot: Arc<SyncMutex<Option<OrderResult>>> = Arc::new(SyncMutex::new(None));
        let perp_slot: Arc<SyncMutex<Option<OrderResult>>> = Arc::new(SyncMutex::new(None));

        let spot_task = {
            let executor = Arc::clone(&self.executor);
            let slot = Arc::clone(&spot_slot);
            let req = spot_req.clone();
            tokio::spawn(async move {
                let result = executor.place_order(&req).await;
                if let Ok(fill) = &result {
                    *slot.lock() = Some(fill.clone());
                }
                result
            })
        };
        let perp_task = {
            let executor = Arc::clone(&self.executor);
            let slot = Arc::clone(&perp_slot);
            let req = perp_req.clone();
            tokio::spawn(async move {
                let result = executor.place_order(&req).await;
                if let Ok(fill) = &result {
                    *slot.lock() = Some(fill.clone());
                }
                result
            })
        };

        let joined = tokio::time::timeout(self.order_timeout, async {
            tokio::join!(spot_task, perp_task)
        })
        .await;

        match joined {
            Err(_elapsed) => {
                // Bounded wait expired: stop waiting, cancel whatever reported in.
                self.cancel_filled(&spot_slot, &spot_req).await;
                self.cancel_filled(&perp_slot, &perp_req).await;
                Err(TradeError::DeltaHedgeTimeout {
                    timeout_secs: self.order_timeout.as_secs(),
                })
            }
            Ok((spot_join, perp_join)) => {
                let spot_result = spot_join
                    .map_err(|e| TradeError::DeltaHedgeError(format!("spot task: {e}")))?;
                let perp_result = perp_join
                    .map_err(|e| TradeError::DeltaHedgeError(format!("perp task: {e}")))?;

                match (spot_result, perp_result) {
                    (Ok(spot_fill), Ok(perp_fill)) => Ok((spot_fill, perp_fill)),
                    (spot_result, perp_result) => {
                        let reason = [
                            spot_result.err().map(|e| format!("spot: {e}")),
                            perp_result.err().map(|e| format!("perp: {e}")),
                        ]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join("; ");

                        self.cancel_filled(&spot_slot, &spot_req).await;
                        self.cancel_filled(&perp_slot, &perp_req).await;
                        Err(TradeError::DeltaHedgeError(reason))
                    }
                }
            }
        }
    }

    /// Best-effort cancel of a leg that reported a fill before the pair failed.
    async fn cancel_filled(
        &self,
        slot: &Arc<SyncMutex<Option<OrderResult>>>,
        req: &OrderRequest,
    ) {
        let fill = slot.lock().clone();
        if let Some(fill) = fill {
            if let Err(e) = self
                .executor
                .cancel_order(&fill.order_id, &req.symbol, req.category)
                .await
            {
                warn!(order_id = %fill.order_id, error = %e, "rollback cancel failed");
            }
        }
    }

    /// Reverse two completed fills with market orders. Used when drift
    /// validation fails after both legs filled.
    async fn reverse_fills(&self, spot_fill: &OrderResult, perp_fill: &OrderResult) {
        let spot_reverse = OrderRequest::market(
            &spot_fill.symbol,
            spot_fill.side.opposite(),
            spot_fill.filled_qty,
            OrderCategory::Spot,
        );
        let perp_reverse = OrderRequest::market(
            &perp_fill.symbol,
            perp_fill.side.opposite(),
            perp_fill.filled_qty,
            OrderCategory::Linear,
        );

        for req in [spot_reverse, perp_reverse] {
            if req.quantity <= Decimal::ZERO {
                continue;
            }
            if let Err(e) = self.executor.place_order(&req).await {
                error!(
                    symbol = %req.symbol,
                    side = req.side.as_str(),
                    qty = %req.quantity,
                    error = %e,
                    "emergency reverse order failed, manual intervention required"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::config::FeeSettings;
    use crate::exchange::MarketEntry;
    use crate::models::InstrumentInfo;
    use crate::trading::fees::FeeCalculator;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    /// Scripted executor: per-symbol fill-quantity overrides, failure
    /// injection, optional hang; records every placed and cancelled order.
    #[derive(Default)]
    struct ScriptedExecutor {
        fill_qty_override: SyncMutex<HashMap<String, Decimal>>,
        fail_symbols: SyncMutex<Vec<String>>,
        hang: SyncMutex<bool>,
        placed: SyncMutex<Vec<OrderRequest>>,
        cancelled: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, TradeError> {
            if *self.hang.lock() {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.placed.lock().push(req.clone());
            if self.fail_symbols.lock().contains(&req.symbol) {
                return Err(TradeError::PriceUnavailable {
                    symbol: req.symbol.clone(),
                });
            }
            let filled_qty = self
                .fill_qty_override
                .lock()
                .get(&req.symbol)
                .copied()
                .unwrap_or(req.quantity);
            Ok(OrderResult {
                order_id: format!("ord-{}", self.placed.lock().len()),
                symbol: req.symbol.clone(),
                side: req.side,
                filled_qty,
                filled_price: dec!(50000),
                fee: dec!(1),
                timestamp_ms: 0,
                is_simulated: true,
            })
        }

        async fn cancel_order(
            &self,
            order_id: &str,
            _symbol: &str,
            _category: OrderCategory,
        ) -> Result<bool, TradeError> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(true)
        }
    }

    fn catalog() -> Arc<InstrumentCatalog> {
        let catalog = InstrumentCatalog::new();
        let info = InstrumentInfo {
            min_qty: dec!(0.001),
            qty_step: dec!(0.001),
            min_notional: dec!(5),
            tick_size: dec!(0.1),
        };
        catalog.refresh(vec![
            MarketEntry {
                symbol: "BTC/USDT".to_string(),
                base: "BTC".to_string(),
                quote: "USDT".to_string(),
                spot: true,
                linear: false,
                active: true,
                info: info.clone(),
            },
            MarketEntry {
                symbol: "BTC/USDT:USDT".to_string(),
                base: "BTC".to_string(),
                quote: "USDT".to_string(),
                spot: false,
                linear: true,
                active: true,
                info,
            },
        ]);
        Arc::new(catalog)
    }

    fn manager(executor: Arc<ScriptedExecutor>, timeout_secs: u64) -> PositionManager {
        let ticker = Arc::new(TickerService::new());
        ticker.publish("BTC/USDT:USDT", dec!(50000), 0);
        ticker.publish("BTC/USDT", dec!(49990), 0);
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(0));
        let pnl = Arc::new(PnlTracker::new(
            FeeCalculator::new(FeeSettings::default()),
            Arc::clone(&clock),
        ));
        PositionManager::new(
            executor,
            catalog(),
            ticker,
            pnl,
            clock,
            dec!(0.02),
            timeout_secs,
        )
    }

    #[tokio::test]
    async fn open_and_close_round_trip() {
        let executor = Arc::new(ScriptedExecutor::default());
        let manager = manager(executor.clone(), 5);

        let position = manager
            .open_position("BTC/USDT", "BTC/USDT:USDT", dec!(500))
            .await
            .unwrap();
        assert_eq!(position.quantity, dec!(0.01));
        assert_eq!(manager.open_positions().len(), 1);
        assert_eq!(manager.current_exposure(), dec!(0.01) * dec!(50000));
        assert!(manager.has_open_for("BTC/USDT:USDT"));

        // Two legs: spot buy + perp sell, identical quantity.
        {
            let placed = executor.placed.lock();
            assert_eq!(placed.len(), 2);
            let spot = placed.iter().find(|r| r.symbol == "BTC/USDT").unwrap();
            let perp = placed.iter().find(|r| r.symbol == "BTC/USDT:USDT").unwrap();
            assert_eq!(spot.side, OrderSide::Buy);
            assert_eq!(perp.side, OrderSide::Sell);
            assert_eq!(spot.quantity, perp.quantity);
        }

        let closed = manager.close_position(&position.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(manager.open_positions().is_empty());
        assert_eq!(manager.closed_positions().len(), 1);
        assert_eq!(manager.current_exposure(), Decimal::ZERO);

        // Close legs reversed the open legs.
        let placed = executor.placed.lock();
        assert_eq!(placed[2].side, OrderSide::Sell); // spot
        assert_eq!(placed[3].side, OrderSide::Buy); // perp
    }

    #[tokio::test]
    async fn drift_beyond_tolerance_reverses_both_legs() {
        let executor = Arc::new(ScriptedExecutor::default());
        // Spot fills 1.000 of everything requested... scripted: perp only 90%.
        executor
            .fill_qty_override
            .lock()
            .insert("BTC/USDT:USDT".to_string(), dec!(0.009));
        let manager = manager(executor.clone(), 5);

        let err = manager
            .open_position("BTC/USDT", "BTC/USDT:USDT", dec!(500))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::DeltaDriftExceeded { .. }));

        // No position persisted.
        assert!(manager.open_positions().is_empty());

        // Four orders total: two entry legs plus two reversals.
        let placed = executor.placed.lock();
        assert_eq!(placed.len(), 4);
        let spot_reverse = &placed[2];
        let perp_reverse = &placed[3];
        assert_eq!(spot_reverse.symbol, "BTC/USDT");
        assert_eq!(spot_reverse.side, OrderSide::Sell);
        assert_eq!(spot_reverse.quantity, dec!(0.01));
        assert_eq!(perp_reverse.symbol, "BTC/USDT:USDT");
        assert_eq!(perp_reverse.side, OrderSide::Buy);
        assert_eq!(perp_reverse.quantity, dec!(0.009));
    }

    #[tokio::test]
    async fn one_leg_failure_cancels_the_other() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor
            .fail_symbols
            .lock()
            .push("BTC/USDT:USDT".to_string());
        let manager = manager(executor.clone(), 5);

        let err = manager
            .open_position("BTC/USDT", "BTC/USDT:USDT", dec!(500))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::DeltaHedgeError(_)));
        assert!(manager.open_positions().is_empty());

        // The spot leg that filled was cancelled best-effort.
        assert_eq!(executor.cancelled.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_open() {
        let executor = Arc::new(ScriptedExecutor::default());
        *executor.hang.lock() = true;
        let manager = manager(executor.clone(), 1);

        let err = manager
            .open_position("BTC/USDT", "BTC/USDT:USDT", dec!(500))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::DeltaHedgeTimeout { timeout_secs: 1 }));
        assert!(manager.open_positions().is_empty());
        // Nothing filled, so nothing to cancel.
        assert!(executor.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn insufficient_budget_is_rejected_before_any_order() {
        let executor = Arc::new(ScriptedExecutor::default());
        let manager = manager(executor.clone(), 5);

        // 10 USD at 50_000 rounds down to zero steps.
        let err = manager
            .open_position("BTC/USDT", "BTC/USDT:USDT", dec!(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::InsufficientSize { .. }));
        assert!(executor.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn closing_unknown_position_errors() {
        let executor = Arc::new(ScriptedExecutor::default());
        let manager = manager(executor, 5);
        let err = manager.close_position("nope").await.unwrap_err();
        assert!(matches!(err, TradeError::UnknownPosition(_)));
    }
}
