//! Flow toxicity via VPIN (volume-synchronized probability of informed
//! trading).
//!
//! Trades are aggregated into fixed quote-volume buckets; each closed
//! bucket records the absolute buy/sell imbalance. VPIN is the mean
//! imbalance ratio over the trailing bucket window.
//!
//! A reliability gate suppresses the signal in flat markets: a high VPIN
//! assembled from near-balanced buckets is noise, not toxicity, so an
//! unreliable gauge reports absence rather than a number.

use berg_common::{Side, TradeEvent};

use crate::config::SymbolConfig;

/// One fixed-size volume container. Volumes are quote-currency floats —
/// a derived metric, not ladder state.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeBucket {
    bucket_size: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl VolumeBucket {
    pub fn new(bucket_size: f64) -> Self {
        Self {
            bucket_size,
            buy_volume: 0.0,
            sell_volume: 0.0,
        }
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }

    pub fn is_complete(&self) -> bool {
        self.total_volume() >= self.bucket_size
    }

    /// |buy − sell| in quote currency.
    pub fn imbalance(&self) -> f64 {
        (self.buy_volume - self.sell_volume).abs()
    }

    /// Imbalance normalized by the bucket size, 0..=1 for a full bucket.
    pub fn imbalance_ratio(&self) -> f64 {
        if self.bucket_size <= 0.0 {
            return 0.0;
        }
        self.imbalance() / self.bucket_size
    }

    /// Add volume on `side`, filling at most to capacity.
    ///
    /// Returns the overflow that did not fit; the caller rolls it into
    /// the next bucket.
    pub fn add(&mut self, side: Side, volume: f64) -> f64 {
        let capacity_left = (self.bucket_size - self.total_volume()).max(0.0);
        let accepted = volume.min(capacity_left);
        match side {
            Side::Buy => self.buy_volume += accepted,
            Side::Sell => self.sell_volume += accepted,
        }
        volume - accepted
    }
}

/// Categorical toxicity bands over the VPIN value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToxicityLevel {
    Extreme,
    High,
    Moderate,
    Low,
    Minimal,
}

impl ToxicityLevel {
    fn from_vpin(vpin: f64) -> Self {
        if vpin >= 0.9 {
            ToxicityLevel::Extreme
        } else if vpin >= 0.7 {
            ToxicityLevel::High
        } else if vpin >= 0.5 {
            ToxicityLevel::Moderate
        } else if vpin >= 0.3 {
            ToxicityLevel::Low
        } else {
            ToxicityLevel::Minimal
        }
    }
}

impl std::fmt::Display for ToxicityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ToxicityLevel::Extreme => "EXTREME",
            ToxicityLevel::High => "HIGH",
            ToxicityLevel::Moderate => "MODERATE",
            ToxicityLevel::Low => "LOW",
            ToxicityLevel::Minimal => "MINIMAL",
        };
        write!(f, "{label}")
    }
}

/// VPIN tracker for one symbol.
#[derive(Debug)]
pub struct FlowToxicityAnalyzer {
    bucket_size_usd: f64,
    window: usize,
    min_buckets: usize,
    flat_threshold: f64,
    open: VolumeBucket,
    closed: std::collections::VecDeque<VolumeBucket>,
}

impl FlowToxicityAnalyzer {
    pub fn new(cfg: &SymbolConfig) -> Self {
        Self {
            bucket_size_usd: cfg.vpin_bucket_size_usd,
            window: cfg.vpin_window,
            min_buckets: cfg.vpin_min_buckets,
            flat_threshold: cfg.vpin_flat_threshold,
            open: VolumeBucket::new(cfg.vpin_bucket_size_usd),
            closed: std::collections::VecDeque::new(),
        }
    }

    /// Fold one trade into the open bucket, closing and rolling buckets
    /// as they fill. A single block trade can close several buckets.
    pub fn on_trade(&mut self, trade: &TradeEvent) {
        let side = trade.aggressor_side();
        let mut remaining = trade.quote_volume_f64();
        while remaining > 0.0 {
            remaining = self.open.add(side, remaining);
            if self.open.is_complete() {
                let full = std::mem::replace(&mut self.open, VolumeBucket::new(self.bucket_size_usd));
                self.closed.push_back(full);
                while self.closed.len() > self.window {
                    self.closed.pop_front();
                }
            } else {
                break;
            }
        }
    }

    pub fn closed_buckets(&self) -> usize {
        self.closed.len()
    }

    /// A VPIN reading is trustworthy only with enough closed buckets and
    /// a mean absolute imbalance clear of the flat-market floor.
    pub fn is_reliable(&self) -> bool {
        if self.closed.len() < self.min_buckets {
            return false;
        }
        let total_imbalance: f64 = self.closed.iter().map(VolumeBucket::imbalance).sum();
        let normalized = total_imbalance / (self.closed.len() as f64 * self.bucket_size_usd);
        normalized >= self.flat_threshold
    }

    /// Mean imbalance ratio over the trailing window, or `None` when the
    /// gauge is unreliable. Absence is a non-signal, not an error.
    pub fn current_vpin(&self) -> Option<f64> {
        if !self.is_reliable() {
            return None;
        }
        let n = self.closed.len().min(self.window);
        let sum: f64 = self
            .closed
            .iter()
            .rev()
            .take(n)
            .map(VolumeBucket::imbalance_ratio)
            .sum();
        Some((sum / n as f64).clamp(0.0, 1.0))
    }

    /// Categorical reading derived from `current_vpin`.
    pub fn toxicity_level(&self) -> Option<ToxicityLevel> {
        self.current_vpin().map(ToxicityLevel::from_vpin)
    }
}
