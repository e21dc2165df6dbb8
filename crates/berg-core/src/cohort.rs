//! Trade-size cohorts, CVD tracking, and algorithm classification.
//!
//! Every trade is segmented into whale / dolphin / minnow by quote
//! notional and added to its cohort's cumulative volume delta. Minnow
//! trades additionally feed a bounded window used to recognize execution
//! algorithms: parent orders get shredded into child orders below the
//! minnow line, so that is where TWAP/VWAP/iceberg/sweep signatures live.
//!
//! ## Classification
//!
//! With a full window that is sufficiently directional, the decision tree
//! runs in strict priority order:
//!
//! 1. size uniformity > 0.90 → ICEBERG_ALGO (fixed display quantity)
//! 2. mean interval < 50 ms → SWEEP (latency is the aggression signal,
//!    before any variance check — a sweep may have arbitrary CV)
//! 3. CV < 0.10 → TWAP
//! 4. 0.10 ≤ CV < 0.50 → VWAP
//! 5. directional ratio > 0.90 → GENERIC_ALGO
//! 6. otherwise no classification.

use std::collections::VecDeque;

use berg_common::{AlgoKind, Cohort, Side, TradeEvent};
use tracing::debug;

use crate::config::{ConfigError, SymbolConfig};

/// Minimum history before dynamic percentile thresholds take over from
/// the static ones.
const MIN_SAMPLES_FOR_DYNAMIC: usize = 100;
/// Dynamic thresholds are refreshed every this many trades.
const DYNAMIC_REFRESH_STRIDE: u64 = 100;
/// Trade-size history retained for percentile estimation.
const SIZE_HISTORY_CAP: usize = 1000;
/// Recent trades kept for the flow cohort mix handed to the adjuster.
const RECENT_MIX_CAP: usize = 50;
/// Minimum interval samples before timing statistics mean anything.
const MIN_TIMING_SAMPLES: usize = 10;
/// A trade counts toward size uniformity when within this fraction of
/// the modal size.
const UNIFORMITY_BAND: f64 = 0.05;

/// Result of folding one trade into the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeClassification {
    pub cohort: Cohort,
    pub volume_usd: f64,
    pub side: Side,
    pub algo: Option<AlgoDetection>,
}

/// A recognized execution algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgoDetection {
    pub kind: AlgoKind,
    pub side: Side,
    pub confidence: f64,
    pub window_size: usize,
    pub directional_ratio: f64,
    pub mean_interval_ms: f64,
    pub interval_cv: f64,
    pub size_uniformity: f64,
}

/// Per-cohort cumulative volume delta, signed quote USD.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CvdDeltas {
    pub whale: f64,
    pub dolphin: f64,
    pub minnow: f64,
}

impl CvdDeltas {
    pub fn total(&self) -> f64 {
        self.whale + self.dolphin + self.minnow
    }
}

/// Single-symbol cohort and algorithm analyzer.
#[derive(Debug)]
pub struct CohortAnalyzer {
    whale_floor_usd: f64,
    minnow_floor_usd: f64,
    dynamic_thresholds: bool,
    window_cap: usize,
    directional_threshold: f64,
    max_age_ms: i64,

    cvd: CvdDeltas,
    reported_cvd: CvdDeltas,
    trade_count: u64,

    /// Effective thresholds; equal to the static ones until dynamic
    /// recalibration kicks in.
    effective_whale_usd: f64,
    effective_minnow_usd: f64,
    trade_size_history: VecDeque<f64>,

    /// (event_time_ms, aggressor side) of recent minnow trades.
    algo_window: VecDeque<(i64, Side)>,
    /// Inter-trade gaps in ms; always one shorter than the window.
    interval_history: VecDeque<f64>,
    /// Quote sizes aligned with the window.
    size_pattern: VecDeque<f64>,

    /// (volume_usd, cohort) of the most recent trades, all cohorts.
    recent_mix: VecDeque<(f64, Cohort)>,
}

impl CohortAnalyzer {
    pub fn new(cfg: &SymbolConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            whale_floor_usd: cfg.whale_floor_usd,
            minnow_floor_usd: cfg.minnow_floor_usd,
            dynamic_thresholds: cfg.dynamic_thresholds,
            window_cap: cfg.algo_window_size,
            directional_threshold: cfg.algo_directional_threshold,
            max_age_ms: cfg.algo_max_age_ms,
            cvd: CvdDeltas::default(),
            reported_cvd: CvdDeltas::default(),
            trade_count: 0,
            effective_whale_usd: cfg.whale_threshold_usd,
            effective_minnow_usd: cfg.minnow_threshold_usd,
            trade_size_history: VecDeque::with_capacity(SIZE_HISTORY_CAP),
            algo_window: VecDeque::with_capacity(cfg.algo_window_size),
            interval_history: VecDeque::with_capacity(cfg.algo_window_size),
            size_pattern: VecDeque::with_capacity(cfg.algo_window_size),
            recent_mix: VecDeque::with_capacity(RECENT_MIX_CAP),
        })
    }

    /// Fold one trade in: classify, update CVD, maintain the algorithm
    /// window, and possibly emit an algo detection.
    pub fn on_trade(&mut self, trade: &TradeEvent) -> TradeClassification {
        let volume_usd = trade.quote_volume_f64();
        let side = trade.aggressor_side();

        self.trade_size_history.push_back(volume_usd);
        while self.trade_size_history.len() > SIZE_HISTORY_CAP {
            self.trade_size_history.pop_front();
        }
        self.trade_count += 1;
        if self.dynamic_thresholds && self.trade_count % DYNAMIC_REFRESH_STRIDE == 0 {
            self.recalibrate_thresholds();
        }

        let cohort = self.classify(volume_usd);

        let signed = match side {
            Side::Buy => volume_usd,
            Side::Sell => -volume_usd,
        };
        match cohort {
            Cohort::Whale => self.cvd.whale += signed,
            Cohort::Dolphin => self.cvd.dolphin += signed,
            Cohort::Minnow => self.cvd.minnow += signed,
        }

        self.recent_mix.push_back((volume_usd, cohort));
        while self.recent_mix.len() > RECENT_MIX_CAP {
            self.recent_mix.pop_front();
        }

        let algo = if cohort == Cohort::Minnow {
            self.feed_algo_window(trade, volume_usd, side)
        } else {
            None
        };

        TradeClassification { cohort, volume_usd, side, algo }
    }

    /// Cohort for a quote notional under the current thresholds.
    ///
    /// The minnow boundary is inclusive: a trade exactly at the threshold
    /// classifies as minnow, not dolphin.
    pub fn classify(&self, volume_usd: f64) -> Cohort {
        if volume_usd >= self.effective_whale_usd {
            Cohort::Whale
        } else if volume_usd <= self.effective_minnow_usd {
            Cohort::Minnow
        } else {
            Cohort::Dolphin
        }
    }

    /// Current effective (whale, minnow) thresholds in USD.
    pub fn thresholds(&self) -> (f64, f64) {
        (self.effective_whale_usd, self.effective_minnow_usd)
    }

    /// Cohort volume shares over the recent trade mix. The three fractions
    /// sum to 1 whenever any volume has been seen.
    pub fn cohort_mix(&self) -> (f64, f64, f64) {
        let mut whale = 0.0;
        let mut dolphin = 0.0;
        let mut minnow = 0.0;
        for &(vol, cohort) in &self.recent_mix {
            match cohort {
                Cohort::Whale => whale += vol,
                Cohort::Dolphin => dolphin += vol,
                Cohort::Minnow => minnow += vol,
            }
        }
        let total = whale + dolphin + minnow;
        if total <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        (whale / total, dolphin / total, minnow / total)
    }

    /// Absolute CVD per cohort since start.
    pub fn cvd(&self) -> CvdDeltas {
        self.cvd
    }

    /// CVD change since the previous call. Downstream consumers get
    /// deltas, not absolutes — absolute CVD is a random walk.
    pub fn take_cvd_deltas(&mut self) -> CvdDeltas {
        let delta = CvdDeltas {
            whale: self.cvd.whale - self.reported_cvd.whale,
            dolphin: self.cvd.dolphin - self.reported_cvd.dolphin,
            minnow: self.cvd.minnow - self.reported_cvd.minnow,
        };
        self.reported_cvd = self.cvd;
        delta
    }

    // Window-length accessors, used by the engine invariant checks.
    pub fn window_len(&self) -> usize {
        self.algo_window.len()
    }

    pub fn interval_len(&self) -> usize {
        self.interval_history.len()
    }

    pub fn size_pattern_len(&self) -> usize {
        self.size_pattern.len()
    }

    fn recalibrate_thresholds(&mut self) {
        if self.trade_size_history.len() < MIN_SAMPLES_FOR_DYNAMIC {
            return;
        }
        let mut sorted: Vec<f64> = self.trade_size_history.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let percentile = |sorted: &[f64], p: f64| -> f64 {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        let mut whale = percentile(&sorted, 0.95).max(self.whale_floor_usd);
        let minnow = percentile(&sorted, 0.20).max(self.minnow_floor_usd);
        // The 10x gap invariant holds even under dynamic recomputation.
        if whale < minnow * 10.0 {
            whale = minnow * 10.0;
        }
        self.effective_whale_usd = whale;
        self.effective_minnow_usd = minnow;
        debug!(whale, minnow, "cohort thresholds recalibrated");
    }

    fn feed_algo_window(
        &mut self,
        trade: &TradeEvent,
        volume_usd: f64,
        side: Side,
    ) -> Option<AlgoDetection> {
        if let Some(&(prev_time, _)) = self.algo_window.back() {
            self.interval_history
                .push_back((trade.event_time_ms - prev_time) as f64);
        }
        self.algo_window.push_back((trade.event_time_ms, side));
        self.size_pattern.push_back(volume_usd);

        // Capacity bound: all three shrink together.
        while self.algo_window.len() > self.window_cap {
            self.algo_window.pop_front();
            self.size_pattern.pop_front();
            self.interval_history.pop_front();
        }

        self.age_out(trade.event_time_ms);
        debug_assert_eq!(self.size_pattern.len(), self.algo_window.len());
        debug_assert_eq!(
            self.interval_history.len(),
            self.algo_window.len().saturating_sub(1)
        );
        self.maybe_classify()
    }

    /// Drop trades older than `max_age_ms` from the window head, the same
    /// count from the size pattern, and min(count, intervals) intervals.
    fn age_out(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.max_age_ms;
        let mut stale = 0usize;
        for &(ts, _) in &self.algo_window {
            if ts < cutoff {
                stale += 1;
            } else {
                break;
            }
        }
        if stale == 0 {
            return;
        }
        let interval_drops = stale.min(self.interval_history.len());
        for _ in 0..stale {
            self.algo_window.pop_front();
            self.size_pattern.pop_front();
        }
        for _ in 0..interval_drops {
            self.interval_history.pop_front();
        }
    }

    fn maybe_classify(&mut self) -> Option<AlgoDetection> {
        if self.algo_window.len() < self.window_cap {
            return None;
        }

        let total = self.algo_window.len();
        let sells = self.algo_window.iter().filter(|(_, s)| *s == Side::Sell).count();
        let buys = total - sells;
        let (dominant, dominant_count) = if sells > buys {
            (Side::Sell, sells)
        } else {
            (Side::Buy, buys)
        };
        let directional_ratio = dominant_count as f64 / total as f64;
        if directional_ratio < self.directional_threshold {
            return None;
        }

        let (mean, cv) = self.timing_stats();
        let (uniformity, _modal_size) = self.size_uniformity();

        let detection = classify_algo(
            mean,
            cv,
            uniformity,
            directional_ratio,
            dominant,
            total,
        );

        if let Some(ref detection) = detection {
            debug!(
                kind = %detection.kind,
                side = %detection.side,
                confidence = detection.confidence,
                mean_interval_ms = mean,
                cv,
                uniformity,
                "execution algorithm classified"
            );
            // Suppress repeat alerts for the same burst.
            self.algo_window.clear();
            self.interval_history.clear();
            self.size_pattern.clear();
        }
        detection
    }

    /// (mean, coefficient of variation) of inter-trade intervals.
    /// Sample standard deviation (n − 1).
    fn timing_stats(&self) -> (f64, f64) {
        let n = self.interval_history.len();
        if n < MIN_TIMING_SAMPLES {
            return (0.0, 0.0);
        }
        let mean = self.interval_history.iter().sum::<f64>() / n as f64;
        if mean <= 0.0 {
            return (0.0, 0.0);
        }
        let variance = self
            .interval_history
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        (mean, variance.sqrt() / mean)
    }

    /// Fraction of trades within 5% of the modal size (sizes bucketed to
    /// cents to find the mode), plus the modal size itself.
    fn size_uniformity(&self) -> (f64, Option<f64>) {
        if self.size_pattern.len() < MIN_TIMING_SAMPLES {
            return (0.0, None);
        }
        let mut counts: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
        for &size in &self.size_pattern {
            *counts.entry((size * 100.0).round() as i64).or_insert(0) += 1;
        }
        let Some((&modal_cents, _)) = counts.iter().max_by_key(|(_, count)| **count) else {
            return (0.0, None);
        };
        let modal = modal_cents as f64 / 100.0;
        if modal <= 0.0 {
            return (0.0, None);
        }
        let within = self
            .size_pattern
            .iter()
            .filter(|&&size| (size - modal).abs() <= UNIFORMITY_BAND * modal)
            .count();
        (within as f64 / self.size_pattern.len() as f64, Some(modal))
    }
}

/// Priority-ordered decision tree over the window statistics.
fn classify_algo(
    mean_interval_ms: f64,
    cv: f64,
    uniformity: f64,
    directional_ratio: f64,
    side: Side,
    window_size: usize,
) -> Option<AlgoDetection> {
    let build = |kind: AlgoKind, confidence: f64| AlgoDetection {
        kind,
        side,
        confidence: confidence.clamp(0.0, 1.0),
        window_size,
        directional_ratio,
        mean_interval_ms,
        interval_cv: cv,
        size_uniformity: uniformity,
    };

    if uniformity > 0.90 {
        return Some(build(AlgoKind::IcebergAlgo, uniformity));
    }
    if mean_interval_ms <= 0.0 {
        // No usable timing signal; only the directional fallback remains.
        if directional_ratio > 0.90 {
            return Some(build(AlgoKind::GenericAlgo, directional_ratio));
        }
        return None;
    }
    // The sweep check precedes the CV checks: a sweep may have arbitrary
    // CV, and the aggression signal is the latency itself.
    if mean_interval_ms < 50.0 {
        let speed_bonus = ((50.0 - mean_interval_ms) / 50.0).clamp(0.0, 0.25);
        return Some(build(AlgoKind::Sweep, 0.75 + speed_bonus));
    }
    if cv < 0.10 {
        return Some(build(AlgoKind::Twap, 1.0 - cv * 5.0));
    }
    if cv < 0.50 {
        return Some(build(AlgoKind::Vwap, 0.70 + (0.50 - cv)));
    }
    if directional_ratio > 0.90 {
        return Some(build(AlgoKind::GenericAlgo, directional_ratio));
    }
    None
}
