//! Time-decaying registry of active iceberg levels.
//!
//! The registry is the sole owner of `IcebergLevel`s; other components see
//! snapshots, never references. Confidence is stored as the value set at the
//! last update and MUST be read through [`IcebergLevel::decayed_confidence`]:
//! a level that stops refilling loses confidence exponentially, so stale
//! "zombie" levels cannot pollute downstream consumers.

use std::collections::HashMap;

use berg_common::{BookSide, CancellationContext};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

use crate::book::OrderBook;
use crate::config::SymbolConfig;
use crate::iceberg::spoofing;

/// Lifecycle state of a tracked level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcebergStatus {
    /// Holding and refilling.
    Active,
    /// Absorbed without further refills within the TTL.
    Exhausted,
    /// Price crossed through the level.
    Breached,
    /// Visible remainder vanished before being filled.
    Cancelled,
}

/// One hidden-liquidity level.
///
/// `confidence_score` is deliberately private: consumers go through
/// `decayed_confidence`, which folds in the elapsed silence.
#[derive(Debug, Clone, PartialEq)]
pub struct IcebergLevel {
    pub price: Decimal,
    pub side: BookSide,
    /// Hidden volume accumulated across all refills, base units.
    pub total_hidden_volume: Decimal,
    pub refill_count: u32,
    pub creation_time_ms: i64,
    pub last_update_time_ms: i64,
    pub status: IcebergStatus,
    confidence_score: f64,
    pub spoofing_probability: f64,
    /// Hidden notional at or above the whale boundary (~$100k).
    pub is_whale_iceberg: bool,
    /// Hidden notional in the dolphin band (~$10k–$100k).
    pub is_dolphin_iceberg: bool,
    pub cancellation_context: Option<CancellationContext>,
}

impl IcebergLevel {
    /// Confidence at the last update, decayed by the silence since:
    /// `confidence · 2^(−Δt / half_life)`, clamped to [0, 1]. Monotone
    /// non-increasing in elapsed time and multiplicative over consecutive
    /// intervals.
    pub fn decayed_confidence(&self, now_ms: i64, half_life_s: f64) -> f64 {
        let elapsed_s = (now_ms - self.last_update_time_ms).max(0) as f64 / 1000.0;
        let decay = (-std::f64::consts::LN_2 * elapsed_s / half_life_s).exp();
        (self.confidence_score * decay).clamp(0.0, 1.0)
    }

    /// Confidence exactly as set at the last update. Registry-internal;
    /// everything outside this module reads the decayed value.
    pub(crate) fn raw_confidence(&self) -> f64 {
        self.confidence_score
    }

    pub fn survival_seconds(&self, now_ms: i64) -> f64 {
        (now_ms - self.creation_time_ms).max(0) as f64 / 1000.0
    }

    /// Refills per minute over the level's lifetime. Levels younger than
    /// one second report 0 to avoid a meaningless spike.
    pub fn refill_frequency(&self, now_ms: i64) -> f64 {
        let lifetime_s = self.survival_seconds(now_ms);
        if lifetime_s < 1.0 {
            return 0.0;
        }
        self.refill_count as f64 / (lifetime_s / 60.0)
    }

    /// Accumulated hidden notional in quote currency.
    pub fn hidden_notional(&self) -> f64 {
        (self.price * self.total_hidden_volume).to_f64().unwrap_or(0.0)
    }

    fn classify_size(&mut self, whale_usd: f64, dolphin_usd: f64) {
        let notional = self.hidden_notional();
        self.is_whale_iceberg = notional >= whale_usd;
        self.is_dolphin_iceberg = !self.is_whale_iceberg && notional >= dolphin_usd;
    }
}

/// Outcome of an upsert: whether the level is new or a refill of an
/// existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Refilled,
}

/// Registry of levels for one symbol.
#[derive(Debug)]
pub struct IcebergRegistry {
    levels: HashMap<Decimal, IcebergLevel>,
    half_life_s: f64,
    max_ttl_s: f64,
    min_decayed_confidence: f64,
    breach_tolerance_pct: Decimal,
    whale_iceberg_usd: f64,
    dolphin_iceberg_usd: f64,
}

impl IcebergRegistry {
    pub fn new(cfg: &SymbolConfig) -> Self {
        Self {
            levels: HashMap::new(),
            half_life_s: cfg.iceberg_decay_half_life_s,
            max_ttl_s: cfg.iceberg_max_ttl_s,
            min_decayed_confidence: cfg.iceberg_min_decayed_confidence,
            breach_tolerance_pct: cfg.breach_tolerance_pct,
            whale_iceberg_usd: cfg.whale_iceberg_usd,
            dolphin_iceberg_usd: cfg.dolphin_iceberg_usd,
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, price: Decimal) -> Option<&IcebergLevel> {
        self.levels.get(&price)
    }

    /// Active level at `price` on `side`, if any.
    pub fn active_at(&self, price: Decimal, side: BookSide) -> Option<&IcebergLevel> {
        self.levels
            .get(&price)
            .filter(|lvl| lvl.side == side && lvl.status == IcebergStatus::Active)
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &IcebergLevel> {
        self.levels.values().filter(|lvl| lvl.status == IcebergStatus::Active)
    }

    /// Decayed confidence for the level at `price`, if tracked.
    pub fn decayed_confidence(&self, price: Decimal, now_ms: i64) -> Option<f64> {
        self.levels
            .get(&price)
            .map(|lvl| lvl.decayed_confidence(now_ms, self.half_life_s))
    }

    /// Create or refill the level at `price`.
    ///
    /// On refill: hidden volume accumulates, the refill counter increments,
    /// the decay clock restarts, and the stored confidence is replaced by
    /// the newly adjusted value (it is the confidence *at last update*).
    pub fn upsert(
        &mut self,
        price: Decimal,
        side: BookSide,
        hidden_volume: Decimal,
        confidence: f64,
        now_ms: i64,
    ) -> (UpsertOutcome, &IcebergLevel) {
        use std::collections::hash_map::Entry;

        let whale_usd = self.whale_iceberg_usd;
        let dolphin_usd = self.dolphin_iceberg_usd;

        let mut fresh = IcebergLevel {
            price,
            side,
            total_hidden_volume: hidden_volume,
            refill_count: 1,
            creation_time_ms: now_ms,
            last_update_time_ms: now_ms,
            status: IcebergStatus::Active,
            confidence_score: confidence,
            spoofing_probability: 0.0,
            is_whale_iceberg: false,
            is_dolphin_iceberg: false,
            cancellation_context: None,
        };
        fresh.classify_size(whale_usd, dolphin_usd);

        match self.levels.entry(price) {
            Entry::Occupied(entry)
                if entry.get().status == IcebergStatus::Active && entry.get().side == side =>
            {
                let lvl = entry.into_mut();
                lvl.total_hidden_volume += hidden_volume;
                lvl.refill_count += 1;
                lvl.last_update_time_ms = now_ms;
                lvl.confidence_score = confidence;
                lvl.classify_size(whale_usd, dolphin_usd);
                (UpsertOutcome::Refilled, &*lvl)
            }
            // A stale corpse or an opposite-side remnant gets replaced.
            Entry::Occupied(mut entry) => {
                entry.insert(fresh);
                (UpsertOutcome::Created, &*entry.into_mut())
            }
            Entry::Vacant(entry) => (UpsertOutcome::Created, &*entry.insert(fresh)),
        }
    }

    /// Mark and extract every active level crossed by a trade at `price`.
    ///
    /// An ask wall is breached when the trade clears it upward by more than
    /// the tolerance; a bid wall, downward. Breached levels leave the
    /// registry — their terminal event is the only remaining consumer.
    pub fn check_breaches(&mut self, trade_price: Decimal) -> Vec<IcebergLevel> {
        let tolerance_pct = self.breach_tolerance_pct;
        let breached_prices: Vec<Decimal> = self
            .levels
            .iter()
            .filter(|(_, lvl)| lvl.status == IcebergStatus::Active)
            .filter(|(price, lvl)| {
                let tolerance = **price * tolerance_pct;
                match lvl.side {
                    BookSide::Ask => trade_price > **price + tolerance,
                    BookSide::Bid => trade_price < **price - tolerance,
                }
            })
            .map(|(price, _)| *price)
            .collect();

        breached_prices
            .into_iter()
            .filter_map(|price| self.levels.remove(&price))
            .map(|mut lvl| {
                lvl.status = IcebergStatus::Breached;
                lvl
            })
            .collect()
    }

    /// Periodic sweep: levels silent past the TTL are exhausted; levels
    /// whose decayed confidence fell below the floor are cancelled with a
    /// captured cancellation context and a spoofing score.
    ///
    /// `mid_price` and `price_velocity_5s` describe the market at sweep
    /// time for the cancellation context.
    pub fn cleanup(
        &mut self,
        now_ms: i64,
        mid_price: Option<Decimal>,
        price_velocity_5s: f64,
    ) -> Vec<IcebergLevel> {
        let half_life = self.half_life_s;
        let ttl_ms = (self.max_ttl_s * 1000.0) as i64;
        let floor = self.min_decayed_confidence;

        let expired: Vec<Decimal> = self
            .levels
            .iter()
            .filter(|(_, lvl)| {
                lvl.status != IcebergStatus::Active
                    || now_ms - lvl.last_update_time_ms > ttl_ms
                    || lvl.decayed_confidence(now_ms, half_life) < floor
            })
            .map(|(price, _)| *price)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for price in expired {
            let Some(mut lvl) = self.levels.remove(&price) else { continue };
            if lvl.status != IcebergStatus::Active {
                // Terminal state already reported; just drop the corpse.
                continue;
            }
            if now_ms - lvl.last_update_time_ms > ttl_ms {
                lvl.status = IcebergStatus::Exhausted;
            } else {
                self.cancel_level(&mut lvl, now_ms, mid_price, price_velocity_5s);
            }
            debug!(
                price = %lvl.price,
                status = ?lvl.status,
                refills = lvl.refill_count,
                "iceberg removed by cleanup"
            );
            removed.push(lvl);
        }
        removed
    }

    /// Cancel the active level at `price`/`side` because its visible
    /// remainder was pulled from the book. Returns the cancelled level,
    /// or `None` when nothing active was tracked there.
    pub fn cancel_if_pulled(
        &mut self,
        price: Decimal,
        side: BookSide,
        now_ms: i64,
        mid_price: Option<Decimal>,
        price_velocity_5s: f64,
    ) -> Option<IcebergLevel> {
        let is_target = matches!(
            self.levels.get(&price),
            Some(lvl) if lvl.status == IcebergStatus::Active && lvl.side == side
        );
        if !is_target {
            return None;
        }
        let mut lvl = self.levels.remove(&price)?;
        self.cancel_level(&mut lvl, now_ms, mid_price, price_velocity_5s);
        Some(lvl)
    }

    /// After a resync, cancel ghost levels whose price no longer exists on
    /// their side of the fresh book (the order was pulled during the
    /// disconnect).
    pub fn reconcile_with_book(
        &mut self,
        book: &OrderBook,
        now_ms: i64,
        price_velocity_5s: f64,
    ) -> Vec<IcebergLevel> {
        let mid = book.mid_price();
        let ghost_prices: Vec<Decimal> = self
            .levels
            .iter()
            .filter(|(price, lvl)| {
                lvl.status == IcebergStatus::Active && !book.has_level(**price, lvl.side)
            })
            .map(|(price, _)| *price)
            .collect();

        let mut cancelled = Vec::with_capacity(ghost_prices.len());
        for price in ghost_prices {
            let Some(mut lvl) = self.levels.remove(&price) else { continue };
            self.cancel_level(&mut lvl, now_ms, mid, price_velocity_5s);
            cancelled.push(lvl);
        }
        cancelled
    }

    fn cancel_level(
        &self,
        lvl: &mut IcebergLevel,
        now_ms: i64,
        mid_price: Option<Decimal>,
        price_velocity_5s: f64,
    ) {
        lvl.status = IcebergStatus::Cancelled;
        if let Some(mid) = mid_price
            && !lvl.price.is_zero()
        {
            let distance_pct = ((mid - lvl.price) / lvl.price)
                .abs()
                .to_f64()
                .unwrap_or(0.0)
                * 100.0;
            // Moving toward a bid wall means falling; toward an ask wall,
            // rising.
            let moving_towards_level = match lvl.side {
                BookSide::Bid => price_velocity_5s < 0.0 && mid > lvl.price,
                BookSide::Ask => price_velocity_5s > 0.0 && mid < lvl.price,
            };
            lvl.cancellation_context = Some(CancellationContext {
                mid_price_at_cancel: mid,
                distance_from_level_pct: distance_pct,
                price_velocity_5s,
                moving_towards_level,
                // The visible remainder vanished unfilled; nothing beyond
                // the recorded refills ever executed against the level.
                volume_executed_pct: 0.0,
            });
        }
        lvl.spoofing_probability = spoofing::spoofing_probability(lvl, now_ms);
    }
}
