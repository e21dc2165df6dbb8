//! Δt-validated iceberg detection.
//!
//! A genuine exchange-side refill restores the consumed level within tens
//! of milliseconds; a market maker re-quoting the level takes noticeably
//! longer. The temporal model is a falling sigmoid over the trade-to-diff
//! delay:
//!
//! `P(refill | Δt) = 1 / (1 + e^(α·(Δt − τ)))`
//!
//! with τ = 30 ms and α = 0.15 on Binance spot. Volume filters then require
//! the trade to have consumed meaningfully more than was visible.

use berg_common::{BookSide, TradeEvent};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::SymbolConfig;

/// A refill that passed every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RefillDetection {
    pub price: Decimal,
    pub side: BookSide,
    pub hidden_volume: Decimal,
    pub visible_before: Decimal,
    /// hidden / trade quantity.
    pub ratio: Decimal,
    /// Temporal confidence from the sigmoid.
    pub p_refill: f64,
    /// Volume confidence × temporal confidence, before flow adjustment.
    pub confidence: f64,
    pub delta_t_ms: i64,
}

/// Stateless evaluator configured per symbol.
#[derive(Debug, Clone)]
pub struct IcebergDetector {
    max_refill_delay_ms: i64,
    race_tolerance_ms: i64,
    cutoff_ms: f64,
    alpha: f64,
    min_p_refill: f64,
    dust_threshold: Decimal,
    min_hidden_qty: Decimal,
    min_ratio: Decimal,
}

impl IcebergDetector {
    pub fn new(cfg: &SymbolConfig) -> Self {
        Self {
            max_refill_delay_ms: cfg.iceberg_max_refill_delay_ms,
            race_tolerance_ms: cfg.iceberg_race_tolerance_ms,
            cutoff_ms: cfg.iceberg_refill_cutoff_ms,
            alpha: cfg.iceberg_refill_alpha,
            min_p_refill: cfg.iceberg_min_p_refill,
            dust_threshold: cfg.dust_threshold,
            min_hidden_qty: cfg.iceberg_min_hidden_qty,
            min_ratio: cfg.iceberg_min_ratio,
        }
    }

    /// Temporal refill probability. The exponent is clipped to ±50 so
    /// extreme delays cannot overflow `exp`.
    pub fn refill_probability(&self, delta_t_ms: i64) -> f64 {
        let exponent = (self.alpha * (delta_t_ms as f64 - self.cutoff_ms)).clamp(-50.0, 50.0);
        1.0 / (1.0 + exponent.exp())
    }

    /// Evaluate one restored candidate.
    ///
    /// Filters, in order:
    /// 1. `Δt < −race_tolerance` — diff predated the trade beyond the race
    ///    window; not a causal refill.
    /// 2. `Δt > max_refill_delay` — too slow, a re-quote rather than a refill.
    /// 3–4. sigmoid probability below the floor.
    /// 5. baseline visible volume below the dust threshold.
    /// 6. trade did not exceed the visible volume — nothing was hidden.
    /// 7. hidden volume / ratio below the significance thresholds.
    pub fn evaluate(
        &self,
        trade: &TradeEvent,
        visible_before: Decimal,
        delta_t_ms: i64,
    ) -> Option<RefillDetection> {
        if delta_t_ms < -self.race_tolerance_ms {
            return None;
        }
        if delta_t_ms > self.max_refill_delay_ms {
            return None;
        }

        let p_refill = self.refill_probability(delta_t_ms);
        if p_refill < self.min_p_refill {
            return None;
        }

        if visible_before < self.dust_threshold {
            return None;
        }
        if trade.quantity <= visible_before {
            return None;
        }

        let hidden_volume = trade.quantity - visible_before;
        let ratio = hidden_volume / trade.quantity;
        if hidden_volume < self.min_hidden_qty || ratio < self.min_ratio {
            return None;
        }

        // Volume confidence caps at 0.95: there is always residual doubt.
        let volume_confidence = ratio.min(Decimal::new(95, 2)).to_f64().unwrap_or(0.0);
        let confidence = volume_confidence * p_refill;

        Some(RefillDetection {
            price: trade.price,
            side: trade.resting_side(),
            hidden_volume,
            visible_before,
            ratio,
            p_refill,
            confidence,
            delta_t_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn detector() -> IcebergDetector {
        IcebergDetector::new(&SymbolConfig::btc())
    }

    fn buy_trade(quantity: Decimal) -> TradeEvent {
        TradeEvent {
            price: dec!(100000),
            quantity,
            is_buyer_maker: false,
            event_time_ms: 1_700_000_000_000,
            trade_id: None,
        }
    }

    #[test]
    fn test_fast_refill_detected() {
        // Buy 0.5 against 0.1 visible, level restored 18ms later.
        let d = detector();
        let detection = d.evaluate(&buy_trade(dec!(0.5)), dec!(0.1), 18).unwrap();

        assert_eq!(detection.hidden_volume, dec!(0.4));
        assert_eq!(detection.ratio, dec!(0.8));
        assert_eq!(detection.side, BookSide::Ask);

        // p = 1 / (1 + e^(0.15·(18−30)))
        let expected_p = 1.0 / (1.0 + (0.15f64 * (18.0 - 30.0)).exp());
        assert!((detection.p_refill - expected_p).abs() < 1e-9);
        assert!((detection.p_refill - 0.858).abs() < 0.01);
        assert!((detection.confidence - 0.8 * expected_p).abs() < 1e-9);
        assert!((detection.confidence - 0.68).abs() < 0.01);
    }

    #[test]
    fn test_slow_refill_rejected() {
        // Identical trade, diff 120ms later: beyond the 50ms cap.
        let d = detector();
        assert!(d.evaluate(&buy_trade(dec!(0.5)), dec!(0.1), 120).is_none());
    }

    #[test]
    fn test_race_condition_rejected() {
        // Diff 25ms before the trade: outside the −20ms tolerance.
        let d = detector();
        assert!(d.evaluate(&buy_trade(dec!(0.5)), dec!(0.1), -25).is_none());
    }

    #[test]
    fn test_small_negative_delta_tolerated() {
        // −10ms is inside the race window and yields near-certain timing.
        let d = detector();
        let detection = d.evaluate(&buy_trade(dec!(0.5)), dec!(0.1), -10).unwrap();
        assert!(detection.p_refill > 0.99);
    }

    #[test]
    fn test_probability_floor_rejects_borderline_delay() {
        // At Δt just above τ the sigmoid sits near 0.5 < 0.6 floor.
        let d = detector();
        assert!(d.evaluate(&buy_trade(dec!(0.5)), dec!(0.1), 35).is_none());
    }

    #[test]
    fn test_dust_baseline_rejected() {
        let d = detector();
        assert!(d.evaluate(&buy_trade(dec!(0.5)), dec!(0.00005), 18).is_none());
    }

    #[test]
    fn test_trade_within_visible_not_hidden() {
        let d = detector();
        assert!(d.evaluate(&buy_trade(dec!(0.1)), dec!(0.1), 18).is_none());
        assert!(d.evaluate(&buy_trade(dec!(0.05)), dec!(0.1), 18).is_none());
    }

    #[test]
    fn test_hidden_and_ratio_thresholds() {
        let d = detector();
        // hidden = 0.04 < 0.05 minimum.
        assert!(d.evaluate(&buy_trade(dec!(0.14)), dec!(0.1), 18).is_none());
        // hidden = 0.3 but ratio = 0.23 < 0.3 minimum.
        assert!(d.evaluate(&buy_trade(dec!(1.3)), dec!(1.0), 18).is_none());
        // Both thresholds met exactly at the boundary pass (>= semantics).
        let detection = d.evaluate(&buy_trade(dec!(0.15)), dec!(0.1), 18);
        assert!(detection.is_some());
    }

    #[test]
    fn test_side_follows_aggressor() {
        let d = detector();
        let sell = TradeEvent {
            is_buyer_maker: true,
            ..buy_trade(dec!(0.5))
        };
        // Aggressive sell hit a bid wall: the hidden order is a bid.
        let detection = d.evaluate(&sell, dec!(0.1), 10).unwrap();
        assert_eq!(detection.side, BookSide::Bid);
    }

    #[test]
    fn test_volume_confidence_caps_at_095() {
        let d = detector();
        // ratio ~0.999 should clamp to 0.95 before the timing multiplier.
        let detection = d.evaluate(&buy_trade(dec!(100)), dec!(0.1), 0).unwrap();
        let p = d.refill_probability(0);
        assert!((detection.confidence - 0.95 * p).abs() < 1e-9);
    }

    #[test]
    fn test_sigmoid_exponent_clipping() {
        let d = detector();
        // Far future / far past delays must not overflow.
        assert!(d.refill_probability(10_000) < 1e-20);
        assert!(d.refill_probability(-10_000) > 1.0 - 1e-20);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        let d = detector();
        assert!((d.refill_probability(30) - 0.5).abs() < 1e-12);
    }
}
