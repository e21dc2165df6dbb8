//! End-to-end pipeline tests: trades and diffs through the full engine,
//! including flow-aware confidence adjustment and gap-triggered resync.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use berg_common::{BookSide, BookSnapshot, DepthDiff, MarketSignal, TradeEvent};
use berg_core::{
    run_symbol, signal_channel, DerivativesCache, SnapshotError, SnapshotProvider, SymbolConfig,
    SymbolEngine,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};

const T0: i64 = 1_700_000_000_000;

fn snapshot() -> BookSnapshot {
    BookSnapshot {
        last_update_id: 1000,
        bids: vec![(dec!(99990), dec!(1.0)), (dec!(99980), dec!(2.0))],
        asks: vec![(dec!(100000), dec!(0.1)), (dec!(100010), dec!(2.0))],
    }
}

fn trade(price: Decimal, quantity: Decimal, is_buyer_maker: bool, time_ms: i64) -> TradeEvent {
    TradeEvent {
        price,
        quantity,
        is_buyer_maker,
        event_time_ms: time_ms,
        trade_id: None,
    }
}

fn restore_ask_diff(update_id: u64, time_ms: i64) -> DepthDiff {
    DepthDiff {
        first_update_id: update_id,
        final_update_id: update_id,
        event_time_ms: time_ms,
        bids: vec![],
        asks: vec![(dec!(100000), dec!(0.1))],
    }
}

fn engine_with_signals(cfg: SymbolConfig) -> (SymbolEngine, mpsc::Receiver<MarketSignal>) {
    let (emitter, rx) = signal_channel();
    let engine = SymbolEngine::new(cfg, emitter, Arc::new(DerivativesCache::new())).unwrap();
    (engine, rx)
}

fn drain(rx: &mut mpsc::Receiver<MarketSignal>) -> Vec<MarketSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

/// VPIN seeding: one-sided minnow sells until the gauge is reliable and
/// reads 1.0, with the recent mix fully minnow.
fn seed_minnow_panic(engine: &mut SymbolEngine, from_ms: i64) {
    // $800 sells at 100000; bucket size shrunk via config in the caller.
    for i in 0..150 {
        engine.on_trade(&trade(dec!(100000), dec!(0.008), true, from_ms + i * 100));
    }
}

#[test]
fn test_panic_absorption_boosts_confidence_end_to_end() {
    let cfg = SymbolConfig {
        vpin_bucket_size_usd: 10_000.0,
        ..SymbolConfig::btc()
    };
    let (mut engine, mut rx) = engine_with_signals(cfg);
    // Thin ask at the level so a dolphin-sized trade can reveal hidden
    // volume without drowning the minnow-dominated recent mix.
    let thin = BookSnapshot {
        last_update_id: 1000,
        bids: vec![(dec!(99990), dec!(1.0))],
        asks: vec![(dec!(100000), dec!(0.01)), (dec!(100010), dec!(2.0))],
    };
    engine.rebuild(&thin, &[], 0).unwrap();

    seed_minnow_panic(&mut engine, T0 - 20_000);
    assert_eq!(engine.toxicity().current_vpin(), Some(1.0));
    let (whale_pct, _, minnow_pct) = engine.cohorts().cohort_mix();
    assert_eq!(whale_pct, 0.0);
    assert_eq!(minnow_pct, 1.0);
    drain(&mut rx);

    // $6k buy against the $1k visible: hidden 0.05, ratio 5/6. The mix
    // stays >80% minnow, the tape reads fully toxic: panic absorption.
    engine.on_trade(&trade(dec!(100000), dec!(0.06), false, T0));
    let restore = DepthDiff {
        first_update_id: 1001,
        final_update_id: 1001,
        event_time_ms: T0 + 18,
        bids: vec![],
        asks: vec![(dec!(100000), dec!(0.01))],
    };
    engine.on_diff(&restore).unwrap();

    let signals = drain(&mut rx);
    assert_eq!(signals.len(), 1);
    let MarketSignal::IcebergDetected(s) = &signals[0] else {
        panic!("expected detection, got {}", signals[0]);
    };
    let (whale_pct, _, minnow_pct) = engine.cohorts().cohort_mix();
    assert!(whale_pct < 0.1);
    assert!(minnow_pct > 0.6);
    // Base = min(5/6, 0.95) · p(18ms), then the +10% panic bonus.
    let ratio = 0.05f64 / 0.06f64;
    let base = ratio * (1.0 / (1.0 + (0.15f64 * (18.0 - 30.0)).exp()));
    assert!((s.confidence - base * 1.10).abs() < 1e-6);
    assert!(s.confidence > base);
}

#[test]
fn test_whale_attack_cuts_confidence_end_to_end() {
    let cfg = SymbolConfig {
        vpin_bucket_size_usd: 10_000.0,
        ..SymbolConfig::btc()
    };
    let (mut engine, mut rx) = engine_with_signals(cfg);
    engine.rebuild(&snapshot(), &[], 0).unwrap();

    // One-sided whale sells: toxic tape with institutions dominating.
    for i in 0..15 {
        engine.on_trade(&trade(dec!(100000), dec!(1.5), true, T0 - 20_000 + i * 1_000));
    }
    assert_eq!(engine.toxicity().current_vpin(), Some(1.0));
    let (whale_pct, _, minnow_pct) = engine.cohorts().cohort_mix();
    assert!(whale_pct > 0.6);
    assert!(minnow_pct < 0.1);
    drain(&mut rx);

    engine.on_trade(&trade(dec!(100000), dec!(0.5), false, T0));
    engine.on_diff(&restore_ask_diff(1001, T0 + 18)).unwrap();

    let signals = drain(&mut rx);
    let detection = signals
        .iter()
        .find_map(|s| match s {
            MarketSignal::IcebergDetected(d) => Some(d),
            _ => None,
        })
        .expect("detection expected");
    // Base ≈ 0.686 with the 25% whale-attack penalty; the mid sits below
    // the ask wall, so no drift penalty applies.
    let base = 0.8 * (1.0 / (1.0 + (0.15f64 * (18.0 - 30.0)).exp()));
    assert!((detection.confidence - base * 0.75).abs() < 1e-9);
}

#[test]
fn test_early_diff_is_not_a_refill() {
    let (mut engine, mut rx) = engine_with_signals(SymbolConfig::btc());
    engine.rebuild(&snapshot(), &[], 0).unwrap();

    // Diff carrying the restore arrives stamped 25ms BEFORE the trade.
    engine.on_trade(&trade(dec!(100000), dec!(0.5), false, T0));
    engine.on_diff(&restore_ask_diff(1001, T0 - 25)).unwrap();

    assert!(drain(&mut rx).is_empty());
    assert!(engine.registry().is_empty());
    // The candidate survives the race window for a later diff.
    assert_eq!(engine.pending_checks(), 1);
}

#[test]
fn test_decayed_confidence_is_the_only_read_path() {
    let (mut engine, mut rx) = engine_with_signals(SymbolConfig::btc());
    engine.rebuild(&snapshot(), &[], 0).unwrap();

    engine.on_trade(&trade(dec!(100000), dec!(0.5), false, T0));
    engine.on_diff(&restore_ask_diff(1001, T0 + 18)).unwrap();
    let signals = drain(&mut rx);
    let MarketSignal::IcebergDetected(s) = &signals[0] else {
        panic!("expected detection");
    };

    // Ten minutes of silence at a 300s half-life quarters the confidence.
    let decayed = engine
        .registry()
        .decayed_confidence(dec!(100000), T0 + 18 + 600_000)
        .unwrap();
    assert!((decayed - s.confidence * 0.25).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Async loop tests with a mock snapshot provider
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct MockProvider {
    snapshot: BookSnapshot,
    fetches: Arc<AtomicUsize>,
}

impl MockProvider {
    fn new(snapshot: BookSnapshot) -> Self {
        Self {
            snapshot,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotProvider for MockProvider {
    async fn fetch_snapshot(&self, _symbol: &str) -> Result<BookSnapshot, SnapshotError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.clone())
    }
}

#[tokio::test]
async fn test_run_symbol_detects_over_channels() {
    let (emitter, mut signals) = signal_channel();
    let engine = SymbolEngine::new(
        SymbolConfig::btc(),
        emitter,
        Arc::new(DerivativesCache::new()),
    )
    .unwrap();
    let provider = MockProvider::new(snapshot());
    let (trade_tx, trade_rx) = mpsc::channel(64);
    let (diff_tx, diff_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let handle = tokio::spawn(run_symbol(
        engine,
        trade_rx,
        diff_rx,
        provider.clone(),
        Duration::from_secs(3600),
        shutdown_rx,
    ));

    // Wait for the initial sync so the trade is processed (and parked)
    // before the restoring diff reaches the engine.
    tokio::time::timeout(Duration::from_secs(2), async {
        while provider.fetch_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    trade_tx
        .send(trade(dec!(100000), dec!(0.5), false, T0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    diff_tx.send(restore_ask_diff(1001, T0 + 18)).await.unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
        .await
        .expect("signal within deadline")
        .expect("channel open");
    let MarketSignal::IcebergDetected(s) = signal else {
        panic!("expected detection, got {signal}");
    };
    assert_eq!(s.side, BookSide::Ask);
    assert_eq!(s.hidden_volume, dec!(0.4));
    assert_eq!(provider.fetch_count(), 1);

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn test_gap_triggers_exactly_one_resync() {
    let (emitter, _signals) = signal_channel();
    let engine = SymbolEngine::new(
        SymbolConfig::btc(),
        emitter,
        Arc::new(DerivativesCache::new()),
    )
    .unwrap();
    let provider = MockProvider::new(snapshot());
    let (_trade_tx, trade_rx) = mpsc::channel::<TradeEvent>(64);
    let (diff_tx, diff_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let handle = tokio::spawn(run_symbol(
        engine,
        trade_rx,
        diff_rx,
        provider.clone(),
        Duration::from_secs(3600),
        shutdown_rx,
    ));

    // Wait for the initial sync.
    tokio::time::timeout(Duration::from_secs(2), async {
        while provider.fetch_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // An in-sequence diff applies cleanly, then a gapped diff forces a
    // single resync.
    diff_tx.send(restore_ask_diff(1001, T0)).await.unwrap();
    diff_tx
        .send(DepthDiff {
            first_update_id: 5_000,
            final_update_id: 5_001,
            event_time_ms: T0 + 100,
            bids: vec![],
            asks: vec![(dec!(100010), dec!(1.0))],
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while provider.fetch_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("resync should refetch the snapshot");
    assert_eq!(provider.fetch_count(), 2);

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}
