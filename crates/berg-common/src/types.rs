//! Core domain types shared across the workspace.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Side of the order book a resting order lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn opposite(&self) -> Self {
        match self {
            BookSide::Bid => BookSide::Ask,
            BookSide::Ask => BookSide::Bid,
        }
    }

    pub fn is_ask(&self) -> bool {
        matches!(self, BookSide::Ask)
    }

    pub fn from_is_ask(is_ask: bool) -> Self {
        if is_ask { BookSide::Ask } else { BookSide::Bid }
    }
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookSide::Bid => write!(f, "BID"),
            BookSide::Ask => write!(f, "ASK"),
        }
    }
}

/// Trade-size cohort, partitioned by quote-currency notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cohort {
    /// Largest trades (institutional size).
    Whale,
    /// Mid-sized trades.
    Dolphin,
    /// Smallest trades (retail / child orders of execution algos).
    Minnow,
}

impl Cohort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cohort::Whale => "whale",
            Cohort::Dolphin => "dolphin",
            Cohort::Minnow => "minnow",
        }
    }
}

impl std::fmt::Display for Cohort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified execution-algorithm families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgoKind {
    /// Constant inter-trade intervals.
    Twap,
    /// Intervals tracking volume; moderate variance.
    Vwap,
    /// Fixed child-order size signature.
    IcebergAlgo,
    /// Aggressive sub-50ms bursts.
    Sweep,
    /// Highly directional flow without a recognizable pattern.
    GenericAlgo,
}

impl AlgoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgoKind::Twap => "TWAP",
            AlgoKind::Vwap => "VWAP",
            AlgoKind::IcebergAlgo => "ICEBERG_ALGO",
            AlgoKind::Sweep => "SWEEP",
            AlgoKind::GenericAlgo => "GENERIC_ALGO",
        }
    }
}

impl std::fmt::Display for AlgoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single price level (price + quantity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// A trade from the exchange stream.
///
/// `event_time_ms` is the exchange-origin timestamp in milliseconds.
/// Local wall clock is never mixed into Δt calculations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub price: Decimal,
    pub quantity: Decimal,
    /// True when the maker was the buyer, i.e. the aggressor sold.
    pub is_buyer_maker: bool,
    pub event_time_ms: i64,
    pub trade_id: Option<u64>,
}

impl TradeEvent {
    /// Side of the taker (aggressor).
    pub fn aggressor_side(&self) -> Side {
        if self.is_buyer_maker { Side::Sell } else { Side::Buy }
    }

    /// Book side the trade consumed liquidity from.
    pub fn resting_side(&self) -> BookSide {
        if self.is_buyer_maker { BookSide::Bid } else { BookSide::Ask }
    }

    /// Notional in quote currency as an exact decimal.
    pub fn quote_volume(&self) -> Decimal {
        self.price * self.quantity
    }

    /// Notional in quote currency as a float, for derived metrics only.
    pub fn quote_volume_f64(&self) -> f64 {
        self.quote_volume().to_f64().unwrap_or(0.0)
    }
}

/// Incremental depth update from the exchange diff stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthDiff {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub event_time_ms: i64,
    /// (price, quantity); zero quantity deletes the level.
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Full order book snapshot from the REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Derivatives market context, refreshed out-of-band and read by snapshot.
///
/// Every field is optional: an absent value is a non-signal, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DerivativesSnapshot {
    /// Annualized futures basis, percent.
    pub basis_apr: Option<f64>,
    /// Put IV minus call IV, percent.
    pub skew_pct: Option<f64>,
    /// Total dealer gamma exposure.
    pub total_gex: Option<f64>,
    pub updated_at_ms: i64,
}
