//! REST endpoints: depth snapshots and the derivatives refresh task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berg_common::BookSnapshot;
use berg_core::{DerivativesCache, DerivativesProvider, SnapshotError, SnapshotProvider};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Binance spot REST base URL.
const BINANCE_REST_URL: &str = "https://api.binance.com";
/// Depth levels to request for a snapshot.
const SNAPSHOT_DEPTH: u32 = 1000;

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_REST_URL.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Raw REST depth response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDepthSnapshot {
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// Depth-snapshot provider backed by the Binance REST API.
pub struct BinanceSnapshotProvider {
    config: RestConfig,
    client: reqwest::Client,
}

impl BinanceSnapshotProvider {
    pub fn new(config: RestConfig) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SnapshotError::Request(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SnapshotProvider for BinanceSnapshotProvider {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<BookSnapshot, SnapshotError> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.config.base_url,
            symbol.to_uppercase(),
            SNAPSHOT_DEPTH
        );
        debug!(%url, "fetching depth snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SnapshotError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SnapshotError::Request(format!(
                "status {} from {}",
                response.status(),
                url
            )));
        }
        let raw: RawDepthSnapshot = response
            .json()
            .await
            .map_err(|e| SnapshotError::Invalid(e.to_string()))?;

        Ok(BookSnapshot {
            last_update_id: raw.last_update_id,
            bids: parse_levels(&raw.bids)?,
            asks: parse_levels(&raw.asks)?,
        })
    }
}

fn parse_levels(raw: &[(String, String)]) -> Result<Vec<(Decimal, Decimal)>, SnapshotError> {
    raw.iter()
        .map(|(p, q)| {
            let price: Decimal = p
                .parse()
                .map_err(|_| SnapshotError::Invalid(format!("bad price '{p}'")))?;
            let qty: Decimal = q
                .parse()
                .map_err(|_| SnapshotError::Invalid(format!("bad quantity '{q}'")))?;
            Ok((price, qty))
        })
        .collect()
}

/// Periodically refresh the derivatives cache from `provider`.
///
/// A failed fetch keeps the last cached value; the provider itself is
/// expected to bound its own request time (30 s HTTP timeout at the
/// transport). With the null provider this task idles harmlessly.
pub async fn refresh_derivatives<P: DerivativesProvider>(
    provider: P,
    cache: Arc<DerivativesCache>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                match provider.fetch().await {
                    Some(snapshot) => {
                        cache.store(snapshot);
                        debug!("derivatives cache refreshed");
                    }
                    None => {
                        warn!("derivatives refresh failed, keeping last value");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("derivatives refresh task stopping");
                return;
            }
        }
    }
}
