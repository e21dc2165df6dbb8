//! Per-symbol ingestion engine.
//!
//! One `SymbolEngine` owns every piece of mutable state for its symbol:
//! the order book, the iceberg registry, the cohort and toxicity
//! analyzers, and the pending-refill queue. `run_symbol` drives it as a
//! cooperative task multiplexing the trade stream, the diff stream, and
//! the registry cleanup timer.
//!
//! The detection pipeline itself is strictly synchronous: `on_trade` and
//! `on_diff` never await. The only suspension points are the stream reads
//! and the cleanup timer. Gap or integrity failures drop the book and
//! trigger a full resync from a fresh snapshot; derived state (registry,
//! CVD, VPIN) survives the resync, with ghost levels reconciled away.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berg_common::{
    BookSnapshot, BookSide, Cohort, DepthDiff, IcebergCloseSignal, IcebergRefillSignal,
    MarketSignal, TradeEvent, WhaleTradeSignal,
};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::book::OrderBook;
use crate::cohort::CohortAnalyzer;
use crate::config::{ConfigError, SymbolConfig};
use crate::derivatives::DerivativesCache;
use crate::emitter::SignalEmitter;
use crate::iceberg::adjuster::{adjust_confidence, FlowContext};
use crate::iceberg::detector::IcebergDetector;
use crate::iceberg::registry::{IcebergLevel, IcebergRegistry, IcebergStatus, UpsertOutcome};
use crate::pending::{PendingRefillCheck, PendingRefillQueue};
use crate::sync;
use crate::sync::SyncError;
use crate::toxicity::FlowToxicityAnalyzer;

/// Mid-price history horizon for velocity estimation.
const MID_HISTORY_MS: i64 = 60_000;
/// Window for the cancellation-context price velocity.
const VELOCITY_WINDOW_MS: i64 = 5_000;

/// Failures fetching a REST snapshot. Transient by definition: the
/// resync loop retries with backoff.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Request(String),

    #[error("snapshot response invalid: {0}")]
    Invalid(String),
}

/// Source of full book snapshots for initialization and resync.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<BookSnapshot, SnapshotError>;
}

/// All per-symbol state plus the synchronous detection pipeline.
pub struct SymbolEngine {
    cfg: SymbolConfig,
    book: OrderBook,
    registry: IcebergRegistry,
    detector: IcebergDetector,
    cohorts: CohortAnalyzer,
    toxicity: FlowToxicityAnalyzer,
    pending: PendingRefillQueue,
    emitter: SignalEmitter,
    derivatives: Arc<DerivativesCache>,
    /// (exchange_time_ms, mid) samples for the velocity estimate.
    mid_history: VecDeque<(i64, Decimal)>,
    synced: bool,
}

impl SymbolEngine {
    pub fn new(
        cfg: SymbolConfig,
        emitter: SignalEmitter,
        derivatives: Arc<DerivativesCache>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            book: OrderBook::new(cfg.symbol.clone()),
            registry: IcebergRegistry::new(&cfg),
            detector: IcebergDetector::new(&cfg),
            cohorts: CohortAnalyzer::new(&cfg)?,
            toxicity: FlowToxicityAnalyzer::new(&cfg),
            pending: PendingRefillQueue::new(
                cfg.iceberg_queue_retention_ms,
                cfg.iceberg_race_tolerance_ms,
            ),
            emitter,
            derivatives,
            mid_history: VecDeque::new(),
            synced: false,
            cfg,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.cfg.symbol
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn registry(&self) -> &IcebergRegistry {
        &self.registry
    }

    pub fn cohorts(&self) -> &CohortAnalyzer {
        &self.cohorts
    }

    pub fn cohorts_mut(&mut self) -> &mut CohortAnalyzer {
        &mut self.cohorts
    }

    pub fn toxicity(&self) -> &FlowToxicityAnalyzer {
        &self.toxicity
    }

    pub fn derivatives(&self) -> Option<berg_common::DerivativesSnapshot> {
        self.derivatives.load()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn pending_checks(&self) -> usize {
        self.pending.len()
    }

    /// Rebuild the book from a snapshot plus the diffs buffered while it
    /// was fetched. Derived state survives; levels that no longer exist
    /// on the fresh book are cancelled as ghosts.
    pub fn rebuild(
        &mut self,
        snapshot: &BookSnapshot,
        buffered: &[DepthDiff],
        now_ms: i64,
    ) -> Result<usize, SyncError> {
        self.synced = false;
        let applied = sync::initialize(&mut self.book, snapshot, buffered)?;

        // Baselines captured against the old book are meaningless now.
        self.pending = PendingRefillQueue::new(
            self.cfg.iceberg_queue_retention_ms,
            self.cfg.iceberg_race_tolerance_ms,
        );

        let velocity = self.price_velocity(now_ms);
        let ghosts = self.registry.reconcile_with_book(&self.book, now_ms, velocity);
        for lvl in &ghosts {
            let signal = self.close_signal(lvl, now_ms);
            self.emitter.emit(MarketSignal::IcebergCancelled(signal));
        }
        if !ghosts.is_empty() {
            info!(
                symbol = self.symbol(),
                ghosts = ghosts.len(),
                "ghost icebergs cancelled after resync"
            );
        }

        self.synced = true;
        Ok(applied)
    }

    /// Trade-path pipeline: breaches, cohort/CVD/algo, VPIN, refill
    /// candidate capture. Synchronous, no awaits.
    pub fn on_trade(&mut self, trade: &TradeEvent) {
        if !self.synced {
            return;
        }
        let now_ms = trade.event_time_ms;

        // 1. Levels crossed by this trade die first.
        for lvl in self.registry.check_breaches(trade.price) {
            let signal = self.close_signal(&lvl, now_ms);
            self.emitter.emit(MarketSignal::IcebergBreached(signal));
        }

        // 2. Cohort segmentation, CVD, and the algo window.
        let classification = self.cohorts.on_trade(trade);
        if classification.cohort == Cohort::Whale {
            self.emitter.emit(MarketSignal::WhaleTrade(WhaleTradeSignal {
                symbol: self.cfg.symbol.clone(),
                event_time_ms: now_ms,
                side: classification.side,
                price: trade.price,
                quantity: trade.quantity,
                volume_usd: classification.volume_usd,
            }));
        }
        if let Some(algo) = classification.algo {
            self.emitter.emit(MarketSignal::AlgoDetected(berg_common::AlgoSignal {
                symbol: self.cfg.symbol.clone(),
                event_time_ms: now_ms,
                side: algo.side,
                kind: algo.kind,
                confidence: algo.confidence,
                window_size: algo.window_size,
            }));
        }

        // 3. Flow toxicity.
        self.toxicity.on_trade(trade);

        // 4. Mid-price history for velocity / drift context.
        self.record_mid(now_ms);

        // 5. Park the trade for refill confirmation; GC the queue first.
        self.pending.gc(now_ms);
        if trade.quantity >= self.cfg.min_trade_qty {
            let side = trade.resting_side();
            let visible_before = self.book.volume_at(trade.price, side);
            self.pending.push(PendingRefillCheck {
                trade: trade.clone(),
                visible_before,
                price: trade.price,
                side,
            });
        }
    }

    /// Diff-path pipeline: apply the diff, then test every parked trade
    /// whose level the diff restored.
    pub fn on_diff(&mut self, diff: &DepthDiff) -> Result<(), SyncError> {
        if !self.synced {
            return Ok(());
        }
        if !sync::apply_diff(&mut self.book, diff)? {
            return Ok(()); // stale duplicate
        }

        let diff_time_ms = diff.event_time_ms;
        for candidate in self.pending.take_restored(&self.book, diff_time_ms) {
            let delta_t_ms = diff_time_ms - candidate.trade_time_ms();
            let Some(detection) =
                self.detector
                    .evaluate(&candidate.trade, candidate.visible_before, delta_t_ms)
            else {
                continue;
            };

            let ctx = self.flow_context(detection.price, detection.side);
            let confidence = adjust_confidence(detection.confidence, &ctx);

            let (outcome, lvl) = self.registry.upsert(
                detection.price,
                detection.side,
                detection.hidden_volume,
                confidence,
                diff_time_ms,
            );
            let signal = IcebergRefillSignal {
                symbol: self.cfg.symbol.clone(),
                event_time_ms: diff_time_ms,
                price: detection.price,
                side: detection.side,
                hidden_volume: detection.hidden_volume,
                visible_before: detection.visible_before,
                confidence,
                refill_count: lvl.refill_count,
                delta_t_ms,
            };
            debug!(
                symbol = %self.cfg.symbol,
                price = %detection.price,
                side = %detection.side,
                hidden = %detection.hidden_volume,
                confidence,
                delta_t_ms,
                obi = self.book.weighted_obi(self.cfg.obi_depth, self.cfg.obi_lambda),
                outcome = ?outcome,
                "hidden liquidity refill confirmed"
            );
            match outcome {
                UpsertOutcome::Created => {
                    self.emitter.emit(MarketSignal::IcebergDetected(signal));
                }
                UpsertOutcome::Refilled => {
                    self.emitter.emit(MarketSignal::IcebergRefilled(signal));
                }
            }
        }

        self.cancel_pulled_levels(diff, diff_time_ms);
        self.record_mid(diff_time_ms);
        Ok(())
    }

    /// A zero-quantity update at a tracked level means the visible
    /// remainder is gone. If no recent trade consumed it, the owner
    /// pulled the order: the level is cancelled, not exhausted.
    fn cancel_pulled_levels(&mut self, diff: &DepthDiff, now_ms: i64) {
        let velocity = self.price_velocity(now_ms);
        let mid = self.book.mid_price();
        let sides = [
            (BookSide::Bid, &diff.bids),
            (BookSide::Ask, &diff.asks),
        ];
        for (side, levels) in sides {
            for &(price, qty) in levels.iter() {
                if !qty.is_zero() || self.pending.has_candidate(price, side) {
                    continue;
                }
                if let Some(lvl) = self.registry.cancel_if_pulled(price, side, now_ms, mid, velocity)
                {
                    let signal = self.close_signal(&lvl, now_ms);
                    self.emitter.emit(MarketSignal::IcebergCancelled(signal));
                }
            }
        }
    }

    /// Periodic registry sweep. `now_ms` is wall-clock, injected at the
    /// timer boundary.
    pub fn run_cleanup(&mut self, now_ms: i64) {
        let velocity = self.price_velocity(now_ms);
        let mid = self.book.mid_price();
        for lvl in self.registry.cleanup(now_ms, mid, velocity) {
            let signal = self.close_signal(&lvl, now_ms);
            match lvl.status {
                IcebergStatus::Exhausted => {
                    self.emitter.emit(MarketSignal::IcebergExhausted(signal));
                }
                _ => {
                    self.emitter.emit(MarketSignal::IcebergCancelled(signal));
                }
            }
        }
    }

    /// Flow conditions for the confidence adjuster at a refill.
    fn flow_context(&self, price: Decimal, side: BookSide) -> FlowContext {
        let (whale_pct, _dolphin_pct, minnow_pct) = self.cohorts.cohort_mix();
        let (drift_bps, drift_opposes) = match self.book.mid_price() {
            Some(mid) if !price.is_zero() => {
                let drift = ((mid - price) / price).abs().to_f64().unwrap_or(0.0) * 10_000.0;
                // Price through the wall: mid below a bid level, or above
                // an ask level.
                let opposes = match side {
                    BookSide::Bid => mid < price,
                    BookSide::Ask => mid > price,
                };
                (drift, opposes)
            }
            _ => (0.0, false),
        };
        FlowContext {
            vpin: self.toxicity.current_vpin(),
            whale_pct,
            minnow_pct,
            price_drift_bps: drift_bps,
            drift_opposes,
        }
    }

    fn close_signal(&self, lvl: &IcebergLevel, now_ms: i64) -> IcebergCloseSignal {
        IcebergCloseSignal {
            symbol: self.cfg.symbol.clone(),
            event_time_ms: now_ms,
            price: lvl.price,
            side: lvl.side,
            survival_seconds: lvl.survival_seconds(now_ms),
            total_volume_absorbed: lvl.total_hidden_volume,
            refill_count: lvl.refill_count,
            cancellation_context: lvl.cancellation_context.clone(),
        }
    }

    fn record_mid(&mut self, now_ms: i64) {
        if let Some(mid) = self.book.mid_price() {
            self.mid_history.push_back((now_ms, mid));
            let horizon = now_ms - MID_HISTORY_MS;
            while let Some(&(ts, _)) = self.mid_history.front() {
                if ts < horizon {
                    self.mid_history.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Mid-price change rate over the trailing 5 s window, quote units
    /// per second. Zero when history is too thin.
    fn price_velocity(&self, now_ms: i64) -> f64 {
        let window_start = now_ms - VELOCITY_WINDOW_MS;
        let mut reference: Option<(i64, Decimal)> = None;
        for &(ts, mid) in &self.mid_history {
            if ts >= window_start {
                reference = Some((ts, mid));
                break;
            }
        }
        let (Some((t0, m0)), Some(&(t1, m1))) = (reference, self.mid_history.back()) else {
            return 0.0;
        };
        if t1 <= t0 {
            return 0.0;
        }
        let dt_s = (t1 - t0) as f64 / 1000.0;
        (m1 - m0).to_f64().unwrap_or(0.0) / dt_s
    }
}

/// Drain everything currently queued on a diff channel.
fn drain_diffs(diffs: &mut mpsc::Receiver<DepthDiff>, into: &mut Vec<DepthDiff>) {
    while let Ok(diff) = diffs.try_recv() {
        into.push(diff);
    }
}

/// Fetch a snapshot and splice it with buffered diffs, retrying with
/// exponential backoff. Returns false when shutdown arrived first.
async fn sync_from_snapshot<P: SnapshotProvider>(
    engine: &mut SymbolEngine,
    diffs: &mut mpsc::Receiver<DepthDiff>,
    provider: &P,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    let mut backoff = Duration::from_millis(500);
    loop {
        let mut buffered = Vec::new();
        drain_diffs(diffs, &mut buffered);

        match provider.fetch_snapshot(engine.symbol()).await {
            Ok(snapshot) => {
                // Diffs that arrived during the fetch belong to the splice.
                drain_diffs(diffs, &mut buffered);
                let now_ms = Utc::now().timestamp_millis();
                match engine.rebuild(&snapshot, &buffered, now_ms) {
                    Ok(applied) => {
                        info!(
                            symbol = engine.symbol(),
                            snapshot_id = snapshot.last_update_id,
                            applied,
                            "book synchronized"
                        );
                        return true;
                    }
                    Err(err) => {
                        warn!(symbol = engine.symbol(), %err, "splice failed, refetching");
                    }
                }
            }
            Err(err) => {
                warn!(symbol = engine.symbol(), %err, "snapshot fetch failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.recv() => return false,
        }
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

/// Cooperative loop for one symbol: multiplexes trades, diffs, and the
/// cleanup timer; resyncs on gaps; drains the current event and stops on
/// shutdown. In-flight icebergs stay ACTIVE — their outcome is computed
/// on the next warm start.
pub async fn run_symbol<P: SnapshotProvider>(
    mut engine: SymbolEngine,
    mut trades: mpsc::Receiver<TradeEvent>,
    mut diffs: mpsc::Receiver<DepthDiff>,
    provider: P,
    cleanup_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    if !sync_from_snapshot(&mut engine, &mut diffs, &provider, &mut shutdown).await {
        return;
    }

    let mut cleanup = tokio::time::interval(cleanup_interval);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    cleanup.tick().await;

    loop {
        tokio::select! {
            maybe_diff = diffs.recv() => {
                let Some(diff) = maybe_diff else {
                    info!(symbol = engine.symbol(), "diff stream ended");
                    break;
                };
                if let Err(err) = engine.on_diff(&diff) {
                    warn!(symbol = engine.symbol(), %err, "book invalidated, resyncing");
                    if !sync_from_snapshot(&mut engine, &mut diffs, &provider, &mut shutdown).await {
                        break;
                    }
                }
            }
            maybe_trade = trades.recv() => {
                let Some(trade) = maybe_trade else {
                    info!(symbol = engine.symbol(), "trade stream ended");
                    break;
                };
                engine.on_trade(&trade);
            }
            _ = cleanup.tick() => {
                engine.run_cleanup(Utc::now().timestamp_millis());
            }
            _ = shutdown.recv() => {
                info!(symbol = engine.symbol(), "shutdown requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::signal_channel;
    use rust_decimal_macros::dec;

    fn engine() -> (SymbolEngine, mpsc::Receiver<MarketSignal>) {
        let (emitter, rx) = signal_channel();
        let engine = SymbolEngine::new(
            SymbolConfig::btc(),
            emitter,
            Arc::new(DerivativesCache::new()),
        )
        .unwrap();
        (engine, rx)
    }

    fn snapshot() -> BookSnapshot {
        BookSnapshot {
            last_update_id: 1000,
            bids: vec![(dec!(99990), dec!(1.0)), (dec!(99980), dec!(2.0))],
            asks: vec![(dec!(100000), dec!(0.1)), (dec!(100010), dec!(2.0))],
        }
    }

    fn buy(quantity: Decimal, time_ms: i64) -> TradeEvent {
        TradeEvent {
            price: dec!(100000),
            quantity,
            is_buyer_maker: false,
            event_time_ms: time_ms,
            trade_id: None,
        }
    }

    fn restore_diff(update_id: u64, time_ms: i64) -> DepthDiff {
        DepthDiff {
            first_update_id: update_id,
            final_update_id: update_id,
            event_time_ms: time_ms,
            bids: vec![],
            asks: vec![(dec!(100000), dec!(0.1))],
        }
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let (emitter, _rx) = signal_channel();
        let bad = SymbolConfig {
            whale_threshold_usd: 2_000.0,
            minnow_threshold_usd: 1_000.0,
            ..SymbolConfig::btc()
        };
        assert!(SymbolEngine::new(bad, emitter, Arc::new(DerivativesCache::new())).is_err());
    }

    #[test]
    fn test_trades_ignored_until_synced() {
        let (mut engine, _rx) = engine();
        engine.on_trade(&buy(dec!(0.5), 1_000));
        assert_eq!(engine.pending_checks(), 0);
        assert_eq!(engine.cohorts().cvd().total(), 0.0);
    }

    #[test]
    fn test_fast_refill_end_to_end() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        assert_eq!(engine.pending_checks(), 1);

        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        assert_eq!(engine.pending_checks(), 0);

        let signal = rx.try_recv().unwrap();
        let MarketSignal::IcebergDetected(s) = signal else {
            panic!("expected detection, got {signal}");
        };
        assert_eq!(s.price, dec!(100000));
        assert_eq!(s.side, BookSide::Ask);
        assert_eq!(s.hidden_volume, dec!(0.4));
        assert_eq!(s.visible_before, dec!(0.1));
        assert_eq!(s.delta_t_ms, 18);
        assert_eq!(s.refill_count, 1);
        // No reliable VPIN yet: base confidence passes through.
        assert!((s.confidence - 0.68).abs() < 0.01);

        // Registry now tracks the level.
        assert!(engine.registry().active_at(dec!(100000), BookSide::Ask).is_some());
    }

    #[test]
    fn test_slow_refill_no_event() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 120)).unwrap();

        assert!(rx.try_recv().is_err());
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_second_refill_emits_refilled() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        let _ = rx.try_recv().unwrap();

        engine.on_trade(&buy(dec!(0.5), t0 + 1_000));
        engine.on_diff(&restore_diff(1002, t0 + 1_015)).unwrap();

        let signal = rx.try_recv().unwrap();
        let MarketSignal::IcebergRefilled(s) = signal else {
            panic!("expected refill, got {signal}");
        };
        assert_eq!(s.refill_count, 2);
        let lvl = engine.registry().get(dec!(100000)).unwrap();
        assert_eq!(lvl.total_hidden_volume, dec!(0.8));
    }

    #[test]
    fn test_breach_emits_close_signal() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        let _ = rx.try_recv().unwrap();

        // Trade far through the ask wall (tolerance is 0.05% = 50).
        let breach_trade = TradeEvent {
            price: dec!(100100),
            quantity: dec!(0.2),
            is_buyer_maker: false,
            event_time_ms: t0 + 5_000,
            trade_id: None,
        };
        engine.on_trade(&breach_trade);

        let signal = rx.try_recv().unwrap();
        let MarketSignal::IcebergBreached(s) = signal else {
            panic!("expected breach, got {signal}");
        };
        assert_eq!(s.price, dec!(100000));
        assert_eq!(s.refill_count, 1);
        assert!((s.survival_seconds - 4.982).abs() < 0.01);
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_gap_propagates_for_resync() {
        let (mut engine, _rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let err = engine.on_diff(&restore_diff(1500, 1_700_000_000_000)).unwrap_err();
        assert!(matches!(err, SyncError::Gap { .. }));
    }

    #[test]
    fn test_rebuild_cancels_ghost_levels() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        let _ = rx.try_recv().unwrap();

        // Fresh snapshot without the 100000 ask level: the iceberg is gone.
        let fresh = BookSnapshot {
            last_update_id: 2000,
            bids: vec![(dec!(99990), dec!(1.0))],
            asks: vec![(dec!(100010), dec!(2.0))],
        };
        engine.rebuild(&fresh, &[], t0 + 60_000).unwrap();

        let signal = rx.try_recv().unwrap();
        let MarketSignal::IcebergCancelled(s) = signal else {
            panic!("expected ghost cancellation, got {signal}");
        };
        assert_eq!(s.price, dec!(100000));
        assert!(engine.registry().is_empty());
        assert_eq!(engine.pending_checks(), 0);
    }

    #[test]
    fn test_cleanup_emits_exhausted_after_ttl() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        let _ = rx.try_recv().unwrap();

        engine.run_cleanup(t0 + 4_000_000); // past the 3600s TTL
        let signal = rx.try_recv().unwrap();
        assert!(matches!(signal, MarketSignal::IcebergExhausted(_)));
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_whale_trade_emitted() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        // $200k aggressive buy.
        engine.on_trade(&buy(dec!(2), 1_700_000_000_000));
        let signal = rx.try_recv().unwrap();
        let MarketSignal::WhaleTrade(s) = signal else {
            panic!("expected whale trade, got {signal}");
        };
        assert_eq!(s.volume_usd, 200_000.0);
        assert_eq!(s.side, berg_common::Side::Buy);
    }

    #[test]
    fn test_small_trades_not_parked() {
        let (mut engine, _rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();
        engine.on_trade(&buy(dec!(0.005), 1_700_000_000_000));
        assert_eq!(engine.pending_checks(), 0);
    }

    #[test]
    fn test_pulled_level_cancelled_live() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        let _ = rx.try_recv().unwrap();

        // Long after the refill window, the visible remainder vanishes
        // with no trade at the level: the owner pulled it.
        let pull = DepthDiff {
            first_update_id: 1002,
            final_update_id: 1002,
            event_time_ms: t0 + 30_000,
            bids: vec![],
            asks: vec![(dec!(100000), dec!(0))],
        };
        engine.on_diff(&pull).unwrap();

        let signal = rx.try_recv().unwrap();
        let MarketSignal::IcebergCancelled(s) = signal else {
            panic!("expected cancellation, got {signal}");
        };
        assert_eq!(s.price, dec!(100000));
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_consumed_level_not_cancelled_while_trade_pending() {
        let (mut engine, mut rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();

        let t0 = 1_700_000_000_000;
        engine.on_trade(&buy(dec!(0.5), t0));
        engine.on_diff(&restore_diff(1001, t0 + 18)).unwrap();
        let _ = rx.try_recv().unwrap();

        // Another bite at the level, then a zero-qty diff while the trade
        // is still pending: consumption, not a pull.
        engine.on_trade(&buy(dec!(0.3), t0 + 1_000));
        let consume = DepthDiff {
            first_update_id: 1002,
            final_update_id: 1002,
            event_time_ms: t0 + 1_010,
            bids: vec![],
            asks: vec![(dec!(100000), dec!(0))],
        };
        engine.on_diff(&consume).unwrap();

        assert!(rx.try_recv().is_err());
        assert!(engine.registry().active_at(dec!(100000), BookSide::Ask).is_some());
    }

    #[test]
    fn test_duplicate_diff_ignored() {
        let (mut engine, _rx) = engine();
        engine.rebuild(&snapshot(), &[], 0).unwrap();
        let d = restore_diff(1001, 1_700_000_000_000);
        engine.on_diff(&d).unwrap();
        engine.on_diff(&d).unwrap(); // same ids: rejected silently
        assert_eq!(engine.book().last_update_id(), 1001);
    }
}
