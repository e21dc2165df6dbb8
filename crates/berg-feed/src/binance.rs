//! Binance combined-stream WebSocket client.
//!
//! Subscribes to `<symbol>@aggTrade` and `<symbol>@depth@100ms` on one
//! combined connection and forwards parsed events into per-kind channels.
//! Reconnects automatically with exponential backoff; after a reconnect
//! the diff update-ID sequence breaks and the consuming engine resyncs on
//! its own via the gap check.

use std::time::Duration;

use berg_common::{DepthDiff, TradeEvent};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, error, info, warn};

/// Binance combined-stream WebSocket base URL.
const BINANCE_STREAM_URL: &str = "wss://stream.binance.com:9443/stream";

/// Errors that can occur on the market-data stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Stream ended unexpectedly")]
    StreamEnded,

    #[error("Consumer channel closed")]
    ConsumerGone,
}

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct BinanceStreamConfig {
    /// Symbol to subscribe, e.g. "btcusdt".
    pub symbol: String,
    /// Combined-stream endpoint.
    pub stream_url: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Initial reconnect delay.
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay.
    pub max_reconnect_delay: Duration,
}

impl Default for BinanceStreamConfig {
    fn default() -> Self {
        Self {
            symbol: "btcusdt".to_string(),
            stream_url: BINANCE_STREAM_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl BinanceStreamConfig {
    pub fn for_symbol(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_lowercase(),
            ..Self::default()
        }
    }

    fn url(&self) -> String {
        format!(
            "{}?streams={sym}@aggTrade/{sym}@depth@100ms",
            self.stream_url,
            sym = self.symbol.to_lowercase()
        )
    }
}

/// Envelope of a combined-stream message.
#[derive(Debug, Deserialize)]
struct StreamEnvelope<'a> {
    stream: &'a str,
    #[serde(borrow)]
    data: &'a serde_json::value::RawValue,
}

/// Aggregated trade payload.
#[derive(Debug, Deserialize)]
struct RawAggTrade {
    /// Price as string.
    #[serde(rename = "p")]
    price: String,
    /// Quantity as string.
    #[serde(rename = "q")]
    quantity: String,
    /// Trade time in milliseconds.
    #[serde(rename = "T")]
    trade_time: i64,
    /// Is buyer the maker?
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    /// Aggregate trade ID.
    #[serde(rename = "a")]
    agg_trade_id: Option<u64>,
}

/// Depth diff payload.
#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    /// Event time in milliseconds.
    #[serde(rename = "E")]
    event_time: i64,
    /// First update ID in this batch.
    #[serde(rename = "U")]
    first_update_id: u64,
    /// Final update ID in this batch.
    #[serde(rename = "u")]
    final_update_id: u64,
    /// Bid levels as [price, qty] string pairs.
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    /// Ask levels as [price, qty] string pairs.
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

/// One parsed stream event.
#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Trade(TradeEvent),
    Diff(DepthDiff),
}

/// Stream client for one symbol.
pub struct BinanceStream {
    config: BinanceStreamConfig,
    trade_tx: mpsc::Sender<TradeEvent>,
    diff_tx: mpsc::Sender<DepthDiff>,
}

impl BinanceStream {
    pub fn new(
        config: BinanceStreamConfig,
        trade_tx: mpsc::Sender<TradeEvent>,
        diff_tx: mpsc::Sender<DepthDiff>,
    ) -> Self {
        Self {
            config,
            trade_tx,
            diff_tx,
        }
    }

    /// Run until shutdown, reconnecting on failure with exponential
    /// backoff.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), StreamError> {
        let mut reconnect_delay = self.config.initial_reconnect_delay;

        loop {
            if shutdown.try_recv().is_ok() {
                info!(symbol = %self.config.symbol, "stream: shutdown signal received");
                return Ok(());
            }

            match self.run_connection(&mut shutdown).await {
                Ok(()) => {
                    info!(symbol = %self.config.symbol, "stream: clean shutdown");
                    return Ok(());
                }
                Err(StreamError::ConsumerGone) => {
                    info!(symbol = %self.config.symbol, "stream: consumers dropped");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        symbol = %self.config.symbol,
                        error = %e,
                        delay_ms = reconnect_delay.as_millis() as u64,
                        "stream error, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = shutdown.recv() => {
                            info!(symbol = %self.config.symbol, "stream: shutdown during reconnect delay");
                            return Ok(());
                        }
                    }
                    reconnect_delay = (reconnect_delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    /// One WebSocket connection lifecycle.
    async fn run_connection(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let url = self.config.url();
        info!(symbol = %self.config.symbol, url = %url, "connecting to Binance stream");

        let connect_result = timeout(self.config.connect_timeout, connect_async(&url)).await;
        let (ws_stream, _response) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(StreamError::Connection(e.to_string())),
            Err(_) => return Err(StreamError::Timeout),
        };
        info!(symbol = %self.config.symbol, "connected");

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match parse_stream_message(&text) {
                                Some(StreamEvent::Trade(trade)) => {
                                    if self.trade_tx.send(trade).await.is_err() {
                                        return Err(StreamError::ConsumerGone);
                                    }
                                }
                                Some(StreamEvent::Diff(diff)) => {
                                    if self.diff_tx.send(diff).await.is_err() {
                                        return Err(StreamError::ConsumerGone);
                                    }
                                }
                                None => {
                                    debug!("ignoring non-market message");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("ping, sending pong");
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server closed connection");
                            return Err(StreamError::StreamEnded);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            return Err(StreamError::WebSocket(e));
                        }
                        None => {
                            warn!("stream ended");
                            return Err(StreamError::StreamEnded);
                        }
                        _ => {}
                    }
                }
                _ = shutdown.recv() => {
                    info!(symbol = %self.config.symbol, "stream: shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}

/// Parse a combined-stream message into a trade or a diff.
///
/// Subscription acknowledgements and unknown streams yield `None`.
fn parse_stream_message(text: &str) -> Option<StreamEvent> {
    let envelope: StreamEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "unparseable stream message");
            return None;
        }
    };

    if envelope.stream.ends_with("@aggTrade") {
        let raw: RawAggTrade = match serde_json::from_str(envelope.data.get()) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bad aggTrade payload");
                return None;
            }
        };
        let price: Decimal = raw.price.parse().ok()?;
        let quantity: Decimal = raw.quantity.parse().ok()?;
        Some(StreamEvent::Trade(TradeEvent {
            price,
            quantity,
            is_buyer_maker: raw.is_buyer_maker,
            event_time_ms: raw.trade_time,
            trade_id: raw.agg_trade_id,
        }))
    } else if envelope.stream.contains("@depth") {
        let raw: RawDepthUpdate = match serde_json::from_str(envelope.data.get()) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "bad depthUpdate payload");
                return None;
            }
        };
        Some(StreamEvent::Diff(DepthDiff {
            first_update_id: raw.first_update_id,
            final_update_id: raw.final_update_id,
            event_time_ms: raw.event_time,
            bids: parse_levels(&raw.bids)?,
            asks: parse_levels(&raw.asks)?,
        }))
    } else {
        None
    }
}

fn parse_levels(raw: &[(String, String)]) -> Option<Vec<(Decimal, Decimal)>> {
    raw.iter()
        .map(|(p, q)| Some((p.parse().ok()?, q.parse().ok()?)))
        .collect()
}
