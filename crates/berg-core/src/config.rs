//! Per-symbol configuration.
//!
//! Each symbol carries its own thresholds; presets for the majors mirror
//! their liquidity profiles (BTC tight, SOL wide). Invalid combinations
//! are rejected at initialization, never at runtime.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use thiserror::Error;

/// Fatal configuration errors. Raised once at init; the engine never
/// starts with a config that fails validation.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("whale threshold {whale} must be at least 10x minnow threshold {minnow}")]
    CohortGapTooNarrow { whale: f64, minnow: f64 },

    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("refill probability floor {0} must lie in (0, 1)")]
    BadProbabilityFloor(f64),

    #[error("directional threshold {0} must lie in (0.5, 1]")]
    BadDirectionalThreshold(f64),

    #[error("max TTL {ttl}s must not be shorter than the decay half-life {half_life}s")]
    TtlShorterThanHalfLife { ttl: f64, half_life: f64 },

    #[error("queue retention {retention}ms must cover the refill delay cap {delay}ms")]
    RetentionBelowRefillCap { retention: i64, delay: i64 },

    #[error("algo window must hold at least 2 trades, got {0}")]
    WindowTooSmall(usize),
}

/// All tunables for one symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SymbolConfig {
    pub symbol: String,

    /// Baseline volumes below this are noise; no refill analysis.
    pub dust_threshold: Decimal,
    /// Trades below this size never enter the pending-refill queue.
    pub min_trade_qty: Decimal,

    // --- Iceberg detection (Δt validation) ---
    /// Hard refill-delay cap in ms. Diffs later than this are not refills.
    pub iceberg_max_refill_delay_ms: i64,
    /// Sigmoid midpoint τ in ms.
    pub iceberg_refill_cutoff_ms: f64,
    /// Sigmoid steepness α.
    pub iceberg_refill_alpha: f64,
    /// Minimum temporal confidence to keep a candidate.
    pub iceberg_min_p_refill: f64,
    /// Out-of-order tolerance: a diff may precede its trade by this much.
    pub iceberg_race_tolerance_ms: i64,
    /// Minimum hidden quantity (base units).
    pub iceberg_min_hidden_qty: Decimal,
    /// Minimum hidden/trade ratio.
    pub iceberg_min_ratio: Decimal,
    /// Pending-queue retention; kept longer than the reject horizon so
    /// near-boundary diffs are rejected by the detector, not silently GC'd.
    pub iceberg_queue_retention_ms: i64,

    // --- Registry decay / lifecycle ---
    pub iceberg_decay_half_life_s: f64,
    pub iceberg_max_ttl_s: f64,
    /// Levels whose decayed confidence drops below this are cancelled.
    pub iceberg_min_decayed_confidence: f64,
    /// Breach fires only when price clears the level by more than this.
    pub breach_tolerance_pct: Decimal,
    /// Hidden notional boundaries for size classification, USD.
    pub whale_iceberg_usd: f64,
    pub dolphin_iceberg_usd: f64,

    // --- Cohorts / CVD ---
    pub whale_threshold_usd: f64,
    pub minnow_threshold_usd: f64,
    /// Floors applied when dynamic percentile thresholds are enabled.
    pub whale_floor_usd: f64,
    pub minnow_floor_usd: f64,
    pub dynamic_thresholds: bool,

    // --- Algorithm classification ---
    pub algo_window_size: usize,
    pub algo_directional_threshold: f64,
    /// Trades older than this fall out of the algo window.
    pub algo_max_age_ms: i64,

    // --- VPIN ---
    pub vpin_bucket_size_usd: f64,
    pub vpin_min_buckets: usize,
    pub vpin_flat_threshold: f64,
    pub vpin_window: usize,

    // --- Order book imbalance ---
    pub obi_lambda: f64,
    pub obi_depth: usize,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self::btc()
    }
}

impl SymbolConfig {
    /// BTCUSDT profile: tight spreads, deep book.
    pub fn btc() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            dust_threshold: dec!(0.0001),
            min_trade_qty: dec!(0.01),
            iceberg_max_refill_delay_ms: 50,
            iceberg_refill_cutoff_ms: 30.0,
            iceberg_refill_alpha: 0.15,
            iceberg_min_p_refill: 0.6,
            iceberg_race_tolerance_ms: 20,
            iceberg_min_hidden_qty: dec!(0.05),
            iceberg_min_ratio: dec!(0.3),
            iceberg_queue_retention_ms: 100,
            iceberg_decay_half_life_s: 300.0,
            iceberg_max_ttl_s: 3600.0,
            iceberg_min_decayed_confidence: 0.1,
            breach_tolerance_pct: dec!(0.0005),
            whale_iceberg_usd: 100_000.0,
            dolphin_iceberg_usd: 10_000.0,
            whale_threshold_usd: 100_000.0,
            minnow_threshold_usd: 1_000.0,
            whale_floor_usd: 10_000.0,
            minnow_floor_usd: 100.0,
            dynamic_thresholds: false,
            algo_window_size: 200,
            algo_directional_threshold: 0.85,
            algo_max_age_ms: 60_000,
            vpin_bucket_size_usd: 1_000_000.0,
            vpin_min_buckets: 10,
            vpin_flat_threshold: 0.05,
            vpin_window: 50,
            obi_lambda: 0.1,
            obi_depth: 20,
        }
    }

    /// ETHUSDT profile: wider spreads, smaller notional floors.
    pub fn eth() -> Self {
        Self {
            symbol: "ETHUSDT".to_string(),
            dust_threshold: dec!(0.01),
            min_trade_qty: dec!(0.1),
            iceberg_min_hidden_qty: dec!(1.0),
            breach_tolerance_pct: dec!(0.001),
            whale_threshold_usd: 50_000.0,
            minnow_threshold_usd: 500.0,
            whale_floor_usd: 5_000.0,
            minnow_floor_usd: 50.0,
            vpin_bucket_size_usd: 300_000.0,
            obi_lambda: 0.05,
            obi_depth: 30,
            ..Self::btc()
        }
    }

    /// SOLUSDT profile: volatile, thin book.
    pub fn sol() -> Self {
        Self {
            symbol: "SOLUSDT".to_string(),
            dust_threshold: dec!(0.1),
            min_trade_qty: dec!(1.0),
            iceberg_min_hidden_qty: dec!(10.0),
            breach_tolerance_pct: dec!(0.001),
            whale_threshold_usd: 25_000.0,
            minnow_threshold_usd: 200.0,
            whale_floor_usd: 2_000.0,
            minnow_floor_usd: 20.0,
            vpin_bucket_size_usd: 75_000.0,
            obi_lambda: 0.03,
            obi_depth: 50,
            ..Self::btc()
        }
    }

    /// Resolve a preset by symbol; unknown symbols get the BTC profile
    /// with the requested symbol name.
    pub fn for_symbol(symbol: &str) -> Self {
        match symbol.to_uppercase().as_str() {
            "BTCUSDT" => Self::btc(),
            "ETHUSDT" => Self::eth(),
            "SOLUSDT" => Self::sol(),
            other => Self {
                symbol: other.to_string(),
                ..Self::btc()
            },
        }
    }

    /// Validate the configuration. Called once at engine construction;
    /// any error here is fatal for the symbol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.whale_threshold_usd <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "whale_threshold_usd",
                value: self.whale_threshold_usd,
            });
        }
        if self.minnow_threshold_usd <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "minnow_threshold_usd",
                value: self.minnow_threshold_usd,
            });
        }
        if self.whale_threshold_usd < 10.0 * self.minnow_threshold_usd {
            return Err(ConfigError::CohortGapTooNarrow {
                whale: self.whale_threshold_usd,
                minnow: self.minnow_threshold_usd,
            });
        }
        if self.vpin_bucket_size_usd <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "vpin_bucket_size_usd",
                value: self.vpin_bucket_size_usd,
            });
        }
        if self.iceberg_max_refill_delay_ms <= 0 {
            return Err(ConfigError::NonPositive {
                name: "iceberg_max_refill_delay_ms",
                value: self.iceberg_max_refill_delay_ms as f64,
            });
        }
        if self.iceberg_decay_half_life_s <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "iceberg_decay_half_life_s",
                value: self.iceberg_decay_half_life_s,
            });
        }
        if !(0.0..1.0).contains(&self.iceberg_min_p_refill) || self.iceberg_min_p_refill == 0.0 {
            return Err(ConfigError::BadProbabilityFloor(self.iceberg_min_p_refill));
        }
        if !(self.algo_directional_threshold > 0.5 && self.algo_directional_threshold <= 1.0) {
            return Err(ConfigError::BadDirectionalThreshold(
                self.algo_directional_threshold,
            ));
        }
        if self.iceberg_max_ttl_s < self.iceberg_decay_half_life_s {
            return Err(ConfigError::TtlShorterThanHalfLife {
                ttl: self.iceberg_max_ttl_s,
                half_life: self.iceberg_decay_half_life_s,
            });
        }
        if self.iceberg_queue_retention_ms < self.iceberg_max_refill_delay_ms {
            return Err(ConfigError::RetentionBelowRefillCap {
                retention: self.iceberg_queue_retention_ms,
                delay: self.iceberg_max_refill_delay_ms,
            });
        }
        if self.algo_window_size < 2 {
            return Err(ConfigError::WindowTooSmall(self.algo_window_size));
        }
        Ok(())
    }
}
