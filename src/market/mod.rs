//! Live market state: the funding cache and the price ticker service,
//! written only by the poller and read by everything else.

pub mod funding_cache;
pub mod ticker_service;

pub use funding_cache::{FundingCache, FundingPoller};
pub use ticker_service::{PricePoint, TickerService};
