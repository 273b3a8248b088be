//! The executor capability.
//!
//! One surface, two worlds: `LiveExecutor` hands orders to the venue,
//! `PaperExecutor` fills them from the cached price with deterministic
//! slippage. Everything upstream holds an `Arc<dyn Executor>`; nothing
//! branches on which one it got.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::TradeError;
use crate::exchange::ExchangeClient;
use crate::market::TickerService;
use crate::models::{OrderCategory, OrderRequest, OrderResult, OrderSide};

use super::fees::FeeCalculator;

/// Symmetric paper slippage: 5 basis points against the order.
const SLIPPAGE: Decimal = dec!(0.0005);

/// A paper fill refuses prices older than this.
const MAX_PRICE_AGE_MS: i64 = 60_000;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, TradeError>;

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        category: OrderCategory,
    ) -> Result<bool, TradeError>;
}

/// Delegates to the exchange client; the decimal/string boundary lives in
/// the adapter, not here.
pub struct LiveExecutor {
    client: Arc<dyn ExchangeClient>,
}

impl LiveExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Executor for LiveExecutor {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, TradeError> {
        Ok(self.client.place_order(req).await?)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        category: OrderCategory,
    ) -> Result<bool, TradeError> {
        Ok(self.client.cancel_order(order_id, symbol, category).await?)
    }
}

/// Fills orders from the ticker service at the cached price plus slippage.
pub struct PaperExecutor {
    ticker: Arc<TickerService>,
    fees: FeeCalculator,
    clock: Arc<dyn Clock>,
}

impl PaperExecutor {
    pub fn new(ticker: Arc<TickerService>, fees: FeeCalculator, clock: Arc<dyn Clock>) -> Self {
        Self { ticker, fees, clock }
    }

    fn fill_price(&self, symbol: &str, side: OrderSide) -> Result<Decimal, TradeError> {
        let now = self.clock.now_ms();
        if self.ticker.is_stale(symbol, MAX_PRICE_AGE_MS, now) {
            return Err(TradeError::PriceUnavailable {
                symbol: symbol.to_string(),
            });
        }
        let point = self
            .ticker
            .price(symbol)
            .ok_or_else(|| TradeError::PriceUnavailable {
                symbol: symbol.to_string(),
            })?;

        // Buys pay up, sells give up.
        let price = match side {
            OrderSide::Buy => point.price * (Decimal::ONE + SLIPPAGE),
            OrderSide::Sell => point.price * (Decimal::ONE - SLIPPAGE),
        };
        Ok(price)
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, TradeError> {
        let filled_price = self.fill_price(&req.symbol, req.side)?;
        let fee = self.fees.order_fee(req.quantity, filled_price, req.category);

        let result = OrderResult {
            order_id: format!("sim-{}", Uuid::new_v4()),
            symbol: req.symbol.clone(),
            side: req.side,
            filled_qty: req.quantity,
            filled_price,
            fee,
            timestamp_ms: self.clock.now_ms(),
            is_simulated: true,
        };
        debug!(
            symbol = %result.symbol,
            side = result.side.as_str(),
            qty = %result.filled_qty,
            price = %result.filled_price,
            "paper fill"
        );
        Ok(result)
    }

    async fn cancel_order(
        &self,
        _order_id: &str,
        _symbol: &str,
        _category: OrderCategory,
    ) -> Result<bool, TradeError> {
        // Paper fills are immediate; there is never anything resting to cancel.
        Ok(true)
    }
}
