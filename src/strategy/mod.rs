//! Strategy layer: the simple yield ranker, the composite signal engine and
//! the score-driven position sizer.

pub mod ranker;
pub mod signal;
pub mod sizer;

pub use ranker::{rank_opportunities, RankedOpportunity};
pub use signal::{CompositeSignal, SignalEngine, Trend};
pub use sizer::DynamicSizer;
