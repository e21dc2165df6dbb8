//! Emitted signal schema.
//!
//! Every signal carries the symbol and the exchange-origin event time in
//! milliseconds, plus the minimum fields a consumer needs to reconstruct
//! state. Payloads are serializable for downstream persistence / ML
//! feature extraction.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{AlgoKind, BookSide, Side};

/// Market conditions captured at the moment an iceberg was cancelled.
///
/// Scalar data only; no references back into the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationContext {
    pub mid_price_at_cancel: Decimal,
    /// |mid − level| / level × 100 at cancel time.
    pub distance_from_level_pct: f64,
    /// Price change over the preceding 5 seconds (quote units per second).
    pub price_velocity_5s: f64,
    /// True when the price was moving toward the level when it vanished.
    pub moving_towards_level: bool,
    /// Share of the accumulated hidden volume that traded, 0–100.
    pub volume_executed_pct: f64,
}

/// Payload for iceberg detection and refill signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcebergRefillSignal {
    pub symbol: String,
    pub event_time_ms: i64,
    pub price: Decimal,
    pub side: BookSide,
    pub hidden_volume: Decimal,
    pub visible_before: Decimal,
    pub confidence: f64,
    pub refill_count: u32,
    pub delta_t_ms: i64,
}

/// Payload for iceberg lifecycle-end signals (breached / exhausted / cancelled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcebergCloseSignal {
    pub symbol: String,
    pub event_time_ms: i64,
    pub price: Decimal,
    pub side: BookSide,
    pub survival_seconds: f64,
    pub total_volume_absorbed: Decimal,
    pub refill_count: u32,
    pub cancellation_context: Option<CancellationContext>,
}

/// Payload for a classified execution algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoSignal {
    pub symbol: String,
    pub event_time_ms: i64,
    pub side: Side,
    pub kind: AlgoKind,
    pub confidence: f64,
    pub window_size: usize,
}

/// Payload for a single whale-sized trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhaleTradeSignal {
    pub symbol: String,
    pub event_time_ms: i64,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub volume_usd: f64,
}

/// A signal emitted by the detection core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum MarketSignal {
    IcebergDetected(IcebergRefillSignal),
    IcebergRefilled(IcebergRefillSignal),
    IcebergBreached(IcebergCloseSignal),
    IcebergExhausted(IcebergCloseSignal),
    IcebergCancelled(IcebergCloseSignal),
    AlgoDetected(AlgoSignal),
    WhaleTrade(WhaleTradeSignal),
}

impl MarketSignal {
    pub fn symbol(&self) -> &str {
        match self {
            MarketSignal::IcebergDetected(s) | MarketSignal::IcebergRefilled(s) => &s.symbol,
            MarketSignal::IcebergBreached(s)
            | MarketSignal::IcebergExhausted(s)
            | MarketSignal::IcebergCancelled(s) => &s.symbol,
            MarketSignal::AlgoDetected(s) => &s.symbol,
            MarketSignal::WhaleTrade(s) => &s.symbol,
        }
    }

    /// Exchange-origin event time in milliseconds.
    pub fn event_time_ms(&self) -> i64 {
        match self {
            MarketSignal::IcebergDetected(s) | MarketSignal::IcebergRefilled(s) => s.event_time_ms,
            MarketSignal::IcebergBreached(s)
            | MarketSignal::IcebergExhausted(s)
            | MarketSignal::IcebergCancelled(s) => s.event_time_ms,
            MarketSignal::AlgoDetected(s) => s.event_time_ms,
            MarketSignal::WhaleTrade(s) => s.event_time_ms,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            MarketSignal::IcebergDetected(_) => "iceberg_detected",
            MarketSignal::IcebergRefilled(_) => "iceberg_refilled",
            MarketSignal::IcebergBreached(_) => "iceberg_breached",
            MarketSignal::IcebergExhausted(_) => "iceberg_exhausted",
            MarketSignal::IcebergCancelled(_) => "iceberg_cancelled",
            MarketSignal::AlgoDetected(_) => "algo_detected",
            MarketSignal::WhaleTrade(_) => "whale_trade",
        }
    }
}

impl std::fmt::Display for MarketSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketSignal::IcebergDetected(s) => write!(
                f,
                "IcebergDetected({} {} @ {} hidden={} conf={:.2})",
                s.symbol, s.side, s.price, s.hidden_volume, s.confidence
            ),
            MarketSignal::IcebergRefilled(s) => write!(
                f,
                "IcebergRefilled({} {} @ {} hidden={} refills={})",
                s.symbol, s.side, s.price, s.hidden_volume, s.refill_count
            ),
            MarketSignal::IcebergBreached(s) => write!(
                f,
                "IcebergBreached({} {} @ {} absorbed={})",
                s.symbol, s.side, s.price, s.total_volume_absorbed
            ),
            MarketSignal::IcebergExhausted(s) => {
                write!(f, "IcebergExhausted({} {} @ {})", s.symbol, s.side, s.price)
            }
            MarketSignal::IcebergCancelled(s) => {
                write!(f, "IcebergCancelled({} {} @ {})", s.symbol, s.side, s.price)
            }
            MarketSignal::AlgoDetected(s) => write!(
                f,
                "AlgoDetected({} {}_{} conf={:.2} n={})",
                s.symbol, s.side, s.kind, s.confidence, s.window_size
            ),
            MarketSignal::WhaleTrade(s) => write!(
                f,
                "WhaleTrade({} {} ${:.0} @ {})",
                s.symbol, s.side, s.volume_usd, s.price
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn refill_signal() -> IcebergRefillSignal {
        IcebergRefillSignal {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 1_700_000_000_018,
            price: dec!(100000),
            side: BookSide::Ask,
            hidden_volume: dec!(0.4),
            visible_before: dec!(0.1),
            confidence: 0.68,
            refill_count: 1,
            delta_t_ms: 18,
        }
    }

    #[test]
    fn test_signal_accessors() {
        let signal = MarketSignal::IcebergDetected(refill_signal());
        assert_eq!(signal.symbol(), "BTCUSDT");
        assert_eq!(signal.event_time_ms(), 1_700_000_000_018);
        assert_eq!(signal.kind_str(), "iceberg_detected");
    }

    #[test]
    fn test_signal_display() {
        let signal = MarketSignal::IcebergDetected(refill_signal());
        let text = signal.to_string();
        assert!(text.contains("BTCUSDT"));
        assert!(text.contains("100000"));
        assert!(text.contains("0.4"));
    }

    #[test]
    fn test_signal_serde_tagging() {
        let signal = MarketSignal::AlgoDetected(AlgoSignal {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 1000,
            side: Side::Buy,
            kind: AlgoKind::Twap,
            confidence: 0.9,
            window_size: 200,
        });
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"event_kind\":\"algo_detected\""));
        assert!(json.contains("\"TWAP\""));

        let back: MarketSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn test_close_signal_carries_context() {
        let signal = MarketSignal::IcebergCancelled(IcebergCloseSignal {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 2000,
            price: dec!(60000),
            side: BookSide::Bid,
            survival_seconds: 120.0,
            total_volume_absorbed: dec!(3.5),
            refill_count: 4,
            cancellation_context: Some(CancellationContext {
                mid_price_at_cancel: dec!(60100),
                distance_from_level_pct: 0.17,
                price_velocity_5s: -2.0,
                moving_towards_level: true,
                volume_executed_pct: 8.0,
            }),
        });
        match signal {
            MarketSignal::IcebergCancelled(s) => {
                let ctx = s.cancellation_context.unwrap();
                assert!(ctx.moving_towards_level);
                assert_eq!(ctx.mid_price_at_cancel, dec!(60100));
            }
            _ => unreachable!(),
        }
    }
}
