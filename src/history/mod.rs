//! Historical time-series persistence and acquisition.
//!
//! The store owns its SQLite file exclusively. Live strategy code reads it
//! directly; backtests read through the time-bounded wrapper so no query can
//! see past the simulated present.

pub mod bounded;
pub mod fetcher;
pub mod store;

pub use bounded::TimeBoundedHistory;
pub use fetcher::{FetchProgress, HistoricalFetcher};
pub use store::{DataStatus, HistoricalStore, HistoryReader};
