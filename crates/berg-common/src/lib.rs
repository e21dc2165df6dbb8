//! Shared types for the berg market-microstructure stack.
//!
//! This crate contains:
//! - Common domain types (Side, BookSide, Cohort, TradeEvent, DepthDiff)
//! - The emitted signal schema consumed downstream (MarketSignal)
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for ladder state. Floats are reserved for derived
//! metrics (confidence, VPIN, CVD in quote currency).

pub mod events;
pub mod types;

pub use events::{
    AlgoSignal, CancellationContext, IcebergCloseSignal, IcebergRefillSignal, MarketSignal,
    WhaleTradeSignal,
};
pub use types::*;
