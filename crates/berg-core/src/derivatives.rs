//! Derivatives market context as an optional capability.
//!
//! The core never talks to Deribit itself. A refresh task (single
//! producer) periodically asks a [`DerivativesProvider`] for a fresh
//! snapshot and stores it in the [`DerivativesCache`]; the ingestion task
//! reads by snapshot load. When no provider is wired in, the
//! [`NullDerivativesProvider`] stands in and the cache simply stays
//! empty — absence is an inert non-signal, not a scattered null-check.

use std::sync::RwLock;

use async_trait::async_trait;
use berg_common::DerivativesSnapshot;

/// Source of derivatives context (futures basis, options skew, dealer
/// gamma). Implementations live at the transport boundary.
#[async_trait]
pub trait DerivativesProvider: Send + Sync {
    /// Fetch a fresh snapshot. `None` on any failure — the cache keeps
    /// the previous value.
    async fn fetch(&self) -> Option<DerivativesSnapshot>;
}

/// Provider used when derivatives context is not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDerivativesProvider;

#[async_trait]
impl DerivativesProvider for NullDerivativesProvider {
    async fn fetch(&self) -> Option<DerivativesSnapshot> {
        None
    }
}

/// Single-producer, many-reader snapshot cache.
#[derive(Debug, Default)]
pub struct DerivativesCache {
    inner: RwLock<Option<DerivativesSnapshot>>,
}

impl DerivativesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest snapshot, if any fetch ever succeeded.
    pub fn load(&self) -> Option<DerivativesSnapshot> {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the cached snapshot. Called only by the refresh task.
    pub fn store(&self, snapshot: DerivativesSnapshot) {
        match self.inner.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }
}
