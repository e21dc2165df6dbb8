//! Refill candidates awaiting post-trade book confirmation.
//!
//! A trade alone cannot prove hidden liquidity: the proof is the diff that
//! restores the consumed level within the refill window. Each qualifying
//! trade is parked here with its pre-trade visible volume; when a diff
//! arrives, candidates whose level has been restored are handed to the
//! detector. Entries older than the retention horizon are garbage-collected
//! on every new trade.

use std::collections::VecDeque;

use berg_common::{BookSide, TradeEvent};
use rust_decimal::Decimal;

use crate::book::OrderBook;

/// A trade waiting for the diff that would prove a refill.
#[derive(Debug, Clone)]
pub struct PendingRefillCheck {
    pub trade: TradeEvent,
    /// Visible volume at the trade price before the trade consumed it.
    pub visible_before: Decimal,
    pub price: Decimal,
    /// Side of the book the hidden order would rest on.
    pub side: BookSide,
}

impl PendingRefillCheck {
    pub fn trade_time_ms(&self) -> i64 {
        self.trade.event_time_ms
    }
}

/// Bounded queue of refill candidates for one symbol.
#[derive(Debug)]
pub struct PendingRefillQueue {
    entries: VecDeque<PendingRefillCheck>,
    /// Entries older than this (vs. the newest exchange time seen) drop.
    retention_ms: i64,
    /// A diff may precede its trade by up to this much and still match.
    race_tolerance_ms: i64,
}

impl PendingRefillQueue {
    pub fn new(retention_ms: i64, race_tolerance_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            retention_ms,
            race_tolerance_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park a trade for later confirmation.
    pub fn push(&mut self, check: PendingRefillCheck) {
        self.entries.push_back(check);
    }

    /// Whether a recent trade consumed liquidity at `price`/`side`.
    /// Distinguishes a level emptied by trading from one pulled by its
    /// owner.
    pub fn has_candidate(&self, price: Decimal, side: BookSide) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.price == price && entry.side == side)
    }

    /// Drop entries older than the retention horizon. Called on every new
    /// trade; entries arrive in exchange-time order, so removal stops at
    /// the first fresh entry.
    pub fn gc(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.retention_ms;
        while let Some(front) = self.entries.front() {
            if front.trade_time_ms() < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Extract candidates whose level the incoming diff has restored.
    ///
    /// For each entry, with `Δt = diff_time − trade_time`:
    /// - `Δt < −race_tolerance`: the diff predates the trade beyond the
    ///   race window; the entry stays and waits for a later diff.
    /// - `Δt > retention`: expired, removed silently.
    /// - level restored to at least the pre-trade visible volume: removed
    ///   and returned for detector evaluation (the detector applies its
    ///   own timing filters and may still reject).
    /// - otherwise: stays queued.
    pub fn take_restored(&mut self, book: &OrderBook, diff_time_ms: i64) -> Vec<PendingRefillCheck> {
        let mut matched = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &self.entries[i];
            let delta_t = diff_time_ms - entry.trade_time_ms();

            if delta_t > self.retention_ms {
                self.entries.remove(i);
                continue;
            }
            if delta_t < -self.race_tolerance_ms {
                i += 1;
                continue;
            }
            if book.volume_at(entry.price, entry.side) >= entry.visible_before {
                // remove() preserves relative order of the remainder.
                if let Some(entry) = self.entries.remove(i) {
                    matched.push(entry);
                }
                continue;
            }
            i += 1;
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade_at(time_ms: i64) -> TradeEvent {
        TradeEvent {
            price: dec!(100000),
            quantity: dec!(0.5),
            is_buyer_maker: false,
            event_time_ms: time_ms,
            trade_id: None,
        }
    }

    fn check_at(time_ms: i64) -> PendingRefillCheck {
        PendingRefillCheck {
            trade: trade_at(time_ms),
            visible_before: dec!(0.1),
            price: dec!(100000),
            side: BookSide::Ask,
        }
    }

    fn restored_book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(&[(dec!(99990), dec!(1))], &[(dec!(100000), dec!(0.1))], 1);
        book
    }

    #[test]
    fn test_gc_drops_only_expired() {
        let mut queue = PendingRefillQueue::new(100, 20);
        queue.push(check_at(1_000));
        queue.push(check_at(1_080));
        queue.push(check_at(1_150));

        queue.gc(1_150);
        assert_eq!(queue.len(), 2); // the 1_000 entry aged out
    }

    #[test]
    fn test_take_restored_matches_restored_level() {
        let mut queue = PendingRefillQueue::new(100, 20);
        queue.push(check_at(1_000));

        let book = restored_book();
        let matched = queue.take_restored(&book, 1_018);
        assert_eq!(matched.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(matched[0].visible_before, dec!(0.1));
    }

    #[test]
    fn test_unrestored_level_keeps_entry() {
        let mut queue = PendingRefillQueue::new(100, 20);
        queue.push(check_at(1_000));

        let mut book = OrderBook::new("BTCUSDT");
        // Level restored only partially (below the pre-trade baseline).
        book.apply_snapshot(&[(dec!(99990), dec!(1))], &[(dec!(100000), dec!(0.05))], 1);

        let matched = queue.take_restored(&book, 1_018);
        assert!(matched.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_early_diff_beyond_race_window_leaves_entry() {
        let mut queue = PendingRefillQueue::new(100, 20);
        queue.push(check_at(1_000));

        let book = restored_book();
        // Diff 25ms before the trade: outside the ±20ms race window.
        let matched = queue.take_restored(&book, 975);
        assert!(matched.is_empty());
        assert_eq!(queue.len(), 1);

        // A later in-window diff still matches the same entry.
        let matched = queue.take_restored(&book, 1_010);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_expired_entry_removed_during_scan() {
        let mut queue = PendingRefillQueue::new(100, 20);
        queue.push(check_at(1_000));

        let book = restored_book();
        let matched = queue.take_restored(&book, 1_200);
        assert!(matched.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_has_candidate_matches_price_and_side() {
        let mut queue = PendingRefillQueue::new(100, 20);
        queue.push(check_at(1_000));
        assert!(queue.has_candidate(dec!(100000), BookSide::Ask));
        assert!(!queue.has_candidate(dec!(100000), BookSide::Bid));
        assert!(!queue.has_candidate(dec!(100010), BookSide::Ask));
    }

    #[test]
    fn test_scan_preserves_untouched_entries() {
        let mut queue = PendingRefillQueue::new(100, 20);
        let mut other = check_at(1_005);
        other.price = dec!(100010);
        queue.push(check_at(1_000));
        queue.push(other);

        let book = restored_book(); // only 100000 restored
        let matched = queue.take_restored(&book, 1_018);
        assert_eq!(matched.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.entries[0].price, dec!(100010));
    }
}
