//! Fire-and-forget signal emission.
//!
//! The ingestion loop must never block on a slow consumer: signals go
//! through a bounded channel with `try_send`, and backpressure drops the
//! signal rather than the market data. Drops are counted and logged at a
//! throttled cadence so a wedged consumer is visible without log spam.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use berg_common::MarketSignal;
use tokio::sync::mpsc;
use tracing::warn;

/// Default channel capacity for emitted signals.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 1024;

/// Emission counters, shared with stats readers.
#[derive(Debug, Default)]
pub struct EmitterStats {
    pub emitted: AtomicU64,
    pub dropped: AtomicU64,
}

impl EmitterStats {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Non-blocking sender half for detection signals.
#[derive(Debug, Clone)]
pub struct SignalEmitter {
    tx: mpsc::Sender<MarketSignal>,
    stats: Arc<EmitterStats>,
}

/// Log every N dropped signals rather than every drop.
const DROP_LOG_STRIDE: u64 = 100;

impl SignalEmitter {
    /// Emit without blocking. Returns true when the signal was queued.
    pub fn emit(&self, signal: MarketSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_STRIDE == 1 {
                    warn!(dropped, reason = %err, "signal channel saturated, dropping");
                }
                false
            }
        }
    }

    pub fn stats(&self) -> &EmitterStats {
        &self.stats
    }
}

/// Create an emitter and its receiving end with the default capacity.
pub fn signal_channel() -> (SignalEmitter, mpsc::Receiver<MarketSignal>) {
    signal_channel_with_capacity(DEFAULT_SIGNAL_CAPACITY)
}

/// Create an emitter with an explicit channel capacity.
pub fn signal_channel_with_capacity(
    capacity: usize,
) -> (SignalEmitter, mpsc::Receiver<MarketSignal>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        SignalEmitter {
            tx,
            stats: Arc::new(EmitterStats::default()),
        },
        rx,
    )
}
