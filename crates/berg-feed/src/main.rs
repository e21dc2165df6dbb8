//! berg-feed: live iceberg and smart-money detection against Binance.
//!
//! Spawns one detection engine per symbol, each fed by its own combined
//! WebSocket stream, and logs every emitted signal. Signals are also the
//! integration point for downstream persistence or feature extraction —
//! consume the channel instead of the log.
//!
//! Usage:
//!   berg-feed [--symbols BTCUSDT,ETHUSDT] [--cleanup-secs 300]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use berg_core::{
    run_symbol, signal_channel, DerivativesCache, NullDerivativesProvider, SymbolConfig,
    SymbolEngine,
};
use berg_feed::{
    refresh_derivatives, BinanceSnapshotProvider, BinanceStream, BinanceStreamConfig, RestConfig,
};

/// Channel depth between the stream tasks and an engine.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Parser)]
#[command(name = "berg-feed", about = "Live hidden-liquidity detection on Binance spot")]
struct Args {
    /// Comma-separated symbols to watch.
    #[arg(long, default_value = "BTCUSDT")]
    symbols: String,

    /// Registry cleanup interval in seconds.
    #[arg(long, default_value_t = 300)]
    cleanup_secs: u64,

    /// Derivatives cache refresh interval in seconds.
    #[arg(long, default_value_t = 60)]
    derivatives_refresh_secs: u64,

    /// Log filter, e.g. "info" or "berg_core=debug,info".
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).context("invalid log filter")?)
        .init();

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    anyhow::ensure!(!symbols.is_empty(), "no symbols given");
    info!(?symbols, "starting berg-feed");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let derivatives = Arc::new(DerivativesCache::new());
    let mut tasks = Vec::new();

    // Derivatives refresh: single producer, inert until a real provider
    // is wired in.
    tasks.push(tokio::spawn(refresh_derivatives(
        NullDerivativesProvider,
        Arc::clone(&derivatives),
        Duration::from_secs(args.derivatives_refresh_secs),
        shutdown_tx.subscribe(),
    )));

    for symbol in &symbols {
        let cfg = SymbolConfig::for_symbol(symbol);
        cfg.validate()
            .with_context(|| format!("invalid configuration for {symbol}"))?;

        let (trade_tx, trade_rx) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (diff_tx, diff_rx) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (emitter, mut signals) = signal_channel();

        let engine = SymbolEngine::new(cfg, emitter, Arc::clone(&derivatives))
            .with_context(|| format!("engine init failed for {symbol}"))?;
        let provider = BinanceSnapshotProvider::new(RestConfig::default())
            .map_err(|e| anyhow::anyhow!("snapshot client: {e}"))?;

        // Stream task: socket -> channels.
        let stream = BinanceStream::new(BinanceStreamConfig::for_symbol(symbol), trade_tx, diff_tx);
        let stream_shutdown = shutdown_tx.subscribe();
        let stream_symbol = symbol.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = stream.run(stream_shutdown).await {
                error!(symbol = %stream_symbol, error = %e, "stream task failed");
            }
        }));

        // Engine task: channels -> detection pipeline -> signals.
        tasks.push(tokio::spawn(run_symbol(
            engine,
            trade_rx,
            diff_rx,
            provider,
            Duration::from_secs(args.cleanup_secs),
            shutdown_tx.subscribe(),
        )));

        // Signal consumer: log for now; swap for persistence downstream.
        let signal_symbol = symbol.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                info!(symbol = %signal_symbol, kind = signal.kind_str(), "{signal}");
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    for task in tasks {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}
