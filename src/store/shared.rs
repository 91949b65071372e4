//! Shared-backend window store for multi-process deployments.
//!
//! When several processes must share one set of accounts, the accounting has
//! to live in an external store that can execute the check-and-add as a
//! single server-side operation (e.g., a Redis script). This module defines
//! that contract as [`AtomicWindowOps`] and adapts any such client to the
//! [`WindowStore`] interface, adding key namespacing and a per-operation
//! deadline. No network client ships with this crate.
//!
//! Backend failures propagate untouched; whether to fail open or fail closed
//! on a [`StoreError`] is the caller's decision, and silently disabling
//! limiting on error is exactly the behavior this split is meant to prevent.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Admission, StoreStats, WindowStore};
use crate::error::StoreError;

/// Server-side operations a shared backend must provide.
///
/// Every method maps to one backend round trip. `check_and_add` must execute
/// as a single atomic operation on the backend itself: a client that issues
/// `count` and `add` as two unsynchronized round trips will under-count
/// concurrent admission checks and can admit more than `max` entries in a
/// race window.
#[async_trait]
pub trait AtomicWindowOps: Send + Sync {
    /// Atomically count in-window cost for a key and append a hit at `now`
    /// only if `count + cost <= max`.
    async fn check_and_add(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        cost: u32,
        max: u32,
    ) -> Result<Admission, StoreError>;

    /// Append a hit unconditionally.
    async fn add(&self, key: &str, timestamp: u64, cost: u32) -> Result<(), StoreError>;

    /// Sum of cost over entries with `timestamp >= window_start`.
    async fn count(&self, key: &str, window_start: u64) -> Result<u32, StoreError>;

    /// Oldest in-window timestamp, if any.
    async fn oldest(&self, key: &str, window_start: u64) -> Result<Option<u64>, StoreError>;

    /// Drop entries older than `window_start`.
    async fn cleanup(&self, key: &str, window_start: u64) -> Result<(), StoreError>;

    /// Drop the whole account for a key.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Key and entry counts, if the backend can report them.
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Configuration for [`SharedWindowStore`].
#[derive(Debug, Clone)]
pub struct SharedStoreConfig {
    /// Prefix prepended to every key, isolating this limiter's accounts from
    /// other users of the backend.
    pub key_prefix: String,
    /// Deadline for each backend operation.
    pub op_timeout: Duration,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "floodgate".to_string(),
            op_timeout: Duration::from_secs(1),
        }
    }
}

/// Adapts an [`AtomicWindowOps`] client to the [`WindowStore`] interface.
pub struct SharedWindowStore<C> {
    client: C,
    config: SharedStoreConfig,
}

impl<C: AtomicWindowOps> SharedWindowStore<C> {
    /// Wrap a backend client.
    pub fn new(client: C, config: SharedStoreConfig) -> Self {
        Self { client, config }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout = ?self.config.op_timeout, "Shared store operation timed out");
                Err(StoreError::Timeout(self.config.op_timeout))
            }
        }
    }
}

#[async_trait]
impl<C: AtomicWindowOps> WindowStore for SharedWindowStore<C> {
    async fn add(&self, key: &str, timestamp: u64, cost: u32) -> Result<(), StoreError> {
        let key = self.scoped(key);
        self.deadline("add", self.client.add(&key, timestamp, cost))
            .await
    }

    async fn count(&self, key: &str, window_start: u64) -> Result<u32, StoreError> {
        let key = self.scoped(key);
        self.deadline("count", self.client.count(&key, window_start))
            .await
    }

    async fn oldest(&self, key: &str, window_start: u64) -> Result<Option<u64>, StoreError> {
        let key = self.scoped(key);
        self.deadline("oldest", self.client.oldest(&key, window_start))
            .await
    }

    async fn cleanup(&self, key: &str, window_start: u64) -> Result<(), StoreError> {
        let key = self.scoped(key);
        self.deadline("cleanup", self.client.cleanup(&key, window_start))
            .await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let key = self.scoped(key);
        self.deadline("clear", self.client.clear(&key)).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.deadline("stats", self.client.stats()).await
    }

    async fn check_and_add(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        cost: u32,
        max: u32,
    ) -> Result<Admission, StoreError> {
        let key = self.scoped(key);
        self.deadline(
            "check_and_add",
            self.client.check_and_add(&key, window_start, now, cost, max),
        )
        .await
    }
}
