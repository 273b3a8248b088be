//! Execution layer: fee math, sizing, the executor capability, the two-leg
//! position protocol and PnL accounting.

pub mod executor;
pub mod fees;
pub mod pnl;
pub mod position;
pub mod sizing;

pub use executor::{Executor, LiveExecutor, PaperExecutor};
pub use fees::FeeCalculator;
pub use pnl::{PnlBreakdown, PnlTracker, PortfolioSummary};
pub use position::PositionManager;
pub use sizing::DeltaCheck;
