//! Local order book state.
//!
//! Canonical bid/ask ladders for one symbol, maintained from WebSocket
//! diffs on top of a REST snapshot. `BTreeMap<Decimal, Decimal>` gives
//! sorted iteration both ways: bids are read in reverse (best = highest),
//! asks forward (best = lowest).

use std::collections::BTreeMap;

use berg_common::BookSide;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// In-memory order book for a single symbol.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub(crate) fn set_last_update_id(&mut self, id: u64) {
        self.last_update_id = id;
    }

    /// Replace all levels with a full snapshot. Zero-quantity levels are
    /// dropped on the way in.
    pub fn apply_snapshot(
        &mut self,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        last_update_id: u64,
    ) {
        self.bids.clear();
        self.asks.clear();
        for &(price, qty) in bids {
            if qty > Decimal::ZERO {
                self.bids.insert(price, qty);
            }
        }
        for &(price, qty) in asks {
            if qty > Decimal::ZERO {
                self.asks.insert(price, qty);
            }
        }
        self.last_update_id = last_update_id;
    }

    /// Apply one side of a diff: zero quantity deletes the level,
    /// anything else upserts it.
    pub(crate) fn apply_levels(&mut self, side: BookSide, levels: &[(Decimal, Decimal)]) {
        let ladder = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        for &(price, qty) in levels {
            debug_assert!(qty >= Decimal::ZERO, "negative quantity at {price}");
            if qty.is_zero() {
                ladder.remove(&price);
            } else {
                ladder.insert(price, qty);
            }
        }
    }

    /// Visible quantity resting at `price` on `side`, zero if absent.
    pub fn volume_at(&self, price: Decimal, side: BookSide) -> Decimal {
        let ladder = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        ladder.get(&price).copied().unwrap_or(Decimal::ZERO)
    }

    /// Whether `price` currently exists on `side`.
    pub fn has_level(&self, price: Decimal, side: BookSide) -> bool {
        !self.volume_at(price, side).is_zero()
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
            _ => None,
        }
    }

    /// Top-N bids, best first.
    pub fn top_bids(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        self.bids.iter().rev().take(n).map(|(p, q)| (*p, *q)).collect()
    }

    /// Top-N asks, best first.
    pub fn top_asks(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        self.asks.iter().take(n).map(|(p, q)| (*p, *q)).collect()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Exponentially weighted order book imbalance over the top `depth`
    /// levels per side.
    ///
    /// Each level contributes `qty · e^(−λ·i)` where `i` is the 0-based
    /// distance from the top of its side. Far levels decay toward zero,
    /// which filters spoof walls parked away from the spread. Returns the
    /// weighted bid mass minus the weighted ask mass.
    pub fn weighted_obi(&self, depth: usize, lambda: f64) -> f64 {
        let mut bid_mass = 0.0;
        for (i, (_, qty)) in self.bids.iter().rev().take(depth).enumerate() {
            let weight = (-lambda * i as f64).exp();
            bid_mass += qty.to_f64().unwrap_or(0.0) * weight;
        }
        let mut ask_mass = 0.0;
        for (i, (_, qty)) in self.asks.iter().take(depth).enumerate() {
            let weight = (-lambda * i as f64).exp();
            ask_mass += qty.to_f64().unwrap_or(0.0) * weight;
        }
        bid_mass - ask_mass
    }

    /// Returns `Err((bid, ask))` when the book is crossed.
    ///
    /// A crossed book after a clean diff sequence indicates lost state;
    /// the caller must resync.
    pub fn validate_integrity(&self) -> Result<(), (Decimal, Decimal)> {
        if let (Some((bid, _)), Some((ask, _))) = (self.best_bid(), self.best_ask())
            && bid >= ask
        {
            return Err((bid, ask));
        }
        Ok(())
    }
}
