//! Real-time iceberg-order and smart-money detection core.
//!
//! This crate implements the microstructure pipeline for one exchange
//! symbol: a deterministic local order book synchronized against the
//! exchange diff stream, Δt-validated hidden-liquidity detection,
//! crypto-aware confidence adjustment, a time-decaying iceberg registry,
//! trade-cohort / CVD / algorithm classification, and VPIN flow toxicity.
//!
//! ## Architecture
//!
//! - **Single-writer**: one cooperative task per symbol owns all mutable
//!   state (`SymbolEngine`) and multiplexes trades, diffs, and the cleanup
//!   timer. Cross-symbol tasks share nothing but read-only configuration.
//! - **Exchange time only**: every Δt below the ingestion boundary is
//!   computed from exchange-origin event times in milliseconds.
//! - **Decimal ladders**: prices and quantities are `rust_decimal::Decimal`;
//!   floats appear only in derived metrics (confidence, VPIN, CVD in quote).
//! - **Non-signals return absence**: unreliable VPIN, missing derivatives,
//!   and short algo windows yield `None`, never errors.
//!
//! ## Modules
//!
//! - `book`: canonical bid/ask ladders with integrity checks
//! - `sync`: snapshot + diff reconciliation with gap recovery
//! - `pending`: trade candidates awaiting post-trade book confirmation
//! - `iceberg`: Δt detector, flow-context adjuster, decaying registry
//! - `cohort`: whale/dolphin/minnow segmentation, CVD, algo classification
//! - `toxicity`: VPIN buckets with reliability gating
//! - `derivatives`: optional derivatives context as a capability object
//! - `emitter`: non-blocking signal emission
//! - `engine`: the per-symbol ingestion loop

pub mod book;
pub mod cohort;
pub mod config;
pub mod derivatives;
pub mod emitter;
pub mod engine;
pub mod iceberg;
pub mod pending;
pub mod sync;
pub mod toxicity;

pub use book::OrderBook;
pub use cohort::{AlgoDetection, CohortAnalyzer, CvdDeltas, TradeClassification};
pub use config::{ConfigError, SymbolConfig};
pub use derivatives::{DerivativesCache, DerivativesProvider, NullDerivativesProvider};
pub use emitter::{signal_channel, EmitterStats, SignalEmitter};
pub use engine::{run_symbol, SnapshotError, SnapshotProvider, SymbolEngine};
pub use iceberg::adjuster::{adjust_confidence, FlowContext};
pub use iceberg::detector::{IcebergDetector, RefillDetection};
pub use iceberg::registry::{IcebergLevel, IcebergRegistry, IcebergStatus};
pub use pending::{PendingRefillCheck, PendingRefillQueue};
pub use sync::SyncError;
pub use toxicity::{FlowToxicityAnalyzer, ToxicityLevel, VolumeBucket};
