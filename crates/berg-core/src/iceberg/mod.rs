//! Hidden-liquidity detection and lifecycle tracking.
//!
//! - `detector`: Δt-validated refill evaluation (trade vs. visible volume)
//! - `adjuster`: crypto-aware confidence adjustment from flow context
//! - `registry`: time-decaying map of active iceberg levels
//! - `spoofing`: cancellation-time spoofing probability

pub mod adjuster;
pub mod detector;
pub mod registry;
pub mod spoofing;
