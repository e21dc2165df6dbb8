//! Market-data boundary for the berg detection core.
//!
//! This crate owns everything that touches the network:
//! - `binance`: combined aggTrade + depth WebSocket streams with
//!   automatic reconnection and exponential backoff
//! - `rest`: REST depth snapshots (the `SnapshotProvider` used for
//!   initialization and gap recovery) and the derivatives cache refresh
//!   task
//!
//! The core never sees a socket: it consumes clean `TradeEvent` /
//! `DepthDiff` values over channels and asks the provider for snapshots.
//! After any reconnect the update-ID sequence breaks, the core detects
//! the gap, and resync happens through the same provider path.

pub mod binance;
pub mod rest;

pub use binance::{BinanceStream, BinanceStreamConfig, StreamError};
pub use rest::{refresh_derivatives, BinanceSnapshotProvider, RestConfig};
