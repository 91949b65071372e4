//! Window storage backends.
//!
//! A [`WindowStore`] owns the per-key accounting: the ordered log of
//! timestamped hits that the limiter counts against a sliding window. Two
//! variants exist: the bounded [`InMemoryWindowStore`] (the default) and
//! [`SharedWindowStore`], which adapts an external atomic backend for
//! multi-process deployments. The variant is chosen at construction time by
//! the caller; there is no runtime fallback between them.

mod memory;
mod shared;

pub use memory::InMemoryWindowStore;
pub use shared::{AtomicWindowOps, SharedStoreConfig, SharedWindowStore};

use async_trait::async_trait;

use crate::error::StoreError;

/// Outcome of an atomic check-and-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the hit was appended.
    pub admitted: bool,
    /// In-window cost for the key before this attempt.
    pub count: u32,
    /// Oldest in-window timestamp before this attempt, if any.
    pub oldest: Option<u64>,
}

/// Key and entry counts, for observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Distinct keys currently held.
    pub keys: usize,
    /// Total entries across all keys.
    pub entries: usize,
}

/// Trait for window storage backends.
///
/// Timestamps are epoch milliseconds supplied by the caller and are
/// monotonically non-decreasing per key, so entries are appended in
/// chronological order.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Append a hit of the given cost for a key.
    async fn add(&self, key: &str, timestamp: u64, cost: u32) -> Result<(), StoreError>;

    /// Sum of cost over entries with `timestamp >= window_start`.
    ///
    /// Returns 0 for an absent key.
    async fn count(&self, key: &str, window_start: u64) -> Result<u32, StoreError>;

    /// Oldest timestamp at or after `window_start`, if any entry qualifies.
    async fn oldest(&self, key: &str, window_start: u64) -> Result<Option<u64>, StoreError>;

    /// Drop entries older than `window_start`; drop the key entirely once
    /// empty. Called opportunistically whenever a key is read.
    async fn cleanup(&self, key: &str, window_start: u64) -> Result<(), StoreError>;

    /// Drop the whole account for a key.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Current key and entry counts.
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Count the in-window cost for a key and append a hit at `now` only if
    /// `count + cost <= max`. Never appends on denial.
    ///
    /// This read-count-then-conditionally-add must be atomic with respect to
    /// other concurrent callers for the same key; two callers racing for the
    /// last slot must not both be admitted. The default body composes
    /// [`cleanup`](WindowStore::cleanup), [`count`](WindowStore::count),
    /// [`oldest`](WindowStore::oldest) and [`add`](WindowStore::add) as
    /// separate calls and is therefore only correct when the caller
    /// serializes access per key. Backends reachable by multiple threads or
    /// processes must override it with a single atomic operation.
    async fn check_and_add(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        cost: u32,
        max: u32,
    ) -> Result<Admission, StoreError> {
        self.cleanup(key, window_start).await?;
        let count = self.count(key, window_start).await?;
        let oldest = self.oldest(key, window_start).await?;

        if count.saturating_add(cost) > max {
            return Ok(Admission {
                admitted: false,
                count,
                oldest,
            });
        }

        self.add(key, now, cost).await?;
        Ok(Admission {
            admitted: true,
            count,
            oldest,
        })
    }
}
