//! Admission decisions over a window store.
//!
//! The [`Limiter`] holds the named limit table and translates sliding-window
//! accounting into allow/deny decisions. It keeps no entry state of its own
//! and takes no locks: it computes window boundaries and delegates to the
//! store, which makes the orchestration reentrant regardless of backend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::{LimitConfig, LimitTable, MemoryStoreConfig};
use crate::error::{FloodgateError, Result};
use crate::store::{InMemoryWindowStore, WindowStore};

/// Outcome of a consume or check.
///
/// A decision is always complete: denial carries the same fields as an
/// allowance, so callers never see an "unknown" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    /// Whether the hit was admitted.
    pub allowed: bool,
    /// The configured maximum for this limit type.
    pub limit: u32,
    /// Cost still available in the current window.
    pub remaining: u32,
    /// Epoch milliseconds at which the window is informationally considered
    /// to reset. The true reset is continuous, since the window slides.
    pub reset_at: u64,
    /// Seconds until a retry can succeed. Only meaningful when denied.
    pub retry_after_secs: u64,
}

impl ConsumeResult {
    /// Reset time as epoch seconds, for `X-RateLimit-Reset`-style headers.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at / 1000
    }

    /// Reset time as a UTC timestamp, for ISO-8601 response bodies.
    pub fn reset_at_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.reset_at as i64).unwrap_or_default()
    }
}

/// Current window occupancy for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStatus {
    /// Cost consumed in the current window.
    pub used: u32,
    /// Cost still available.
    pub remaining: u32,
    /// The configured maximum.
    pub max: u32,
    /// Informational reset time, epoch milliseconds.
    pub reset_at: u64,
}

/// Sliding-window-log rate limiter.
///
/// One limiter serves all configured limit types; each `(key, limit type)`
/// pair accrues its own independent account in the store. A log of exact
/// timestamps (rather than a fixed-bucket counter) means an actor cannot
/// double their effective rate by straddling two bucket boundaries, at the
/// cost of O(window occupancy) space per key, which is why the store bounds
/// both keys and retention.
pub struct Limiter {
    limits: LimitTable,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    /// Create a limiter backed by an in-process store with default bounds.
    ///
    /// Starts the store's background sweep, so this requires a running Tokio
    /// runtime.
    pub fn new(limits: LimitTable) -> Self {
        Self::with_store(
            limits,
            Arc::new(InMemoryWindowStore::new(MemoryStoreConfig::default())),
        )
    }

    /// Create a limiter over an explicit store backend.
    ///
    /// The backend variant is a construction-time decision; there is no
    /// runtime fallback from one backend to another.
    pub fn with_store(limits: LimitTable, store: Arc<dyn WindowStore>) -> Self {
        Self {
            limits,
            store,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the time source. Primarily useful for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the underlying store, e.g. for stats.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Consume one unit of the named limit for a key.
    pub async fn consume(&self, key: &str, limit_type: &str) -> Result<ConsumeResult> {
        self.consume_cost(key, limit_type, 1).await
    }

    /// Consume `cost` units of the named limit for a key.
    ///
    /// Denials never mutate the account: there is no partial consumption,
    /// and `cost > max` always denies regardless of current occupancy.
    pub async fn consume_cost(
        &self,
        key: &str,
        limit_type: &str,
        cost: u32,
    ) -> Result<ConsumeResult> {
        let limit = self.limit(limit_type)?;
        if cost == 0 {
            return Err(FloodgateError::Config(
                "consume cost must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now_millis();
        let window_millis = limit.window_millis();
        let window_start = now.saturating_sub(window_millis);
        let account = account_key(key, limit_type);

        let admission = self
            .store
            .check_and_add(&account, window_start, now, cost, limit.max)
            .await?;

        if admission.admitted {
            let remaining = limit
                .max
                .saturating_sub(admission.count)
                .saturating_sub(cost);
            trace!(
                key = %key,
                limit_type = %limit_type,
                cost,
                remaining,
                "Hit admitted"
            );
            Ok(ConsumeResult {
                allowed: true,
                limit: limit.max,
                remaining,
                reset_at: now + window_millis,
                retry_after_secs: 0,
            })
        } else {
            let result = self.denial(&limit, now, admission.count, admission.oldest);
            debug!(
                key = %key,
                limit_type = %limit_type,
                count = admission.count,
                max = limit.max,
                retry_after_secs = result.retry_after_secs,
                "Rate limit exceeded"
            );
            Ok(result)
        }
    }

    /// Read-only projection of the current state: would a cost-1 consume
    /// succeed right now? Never consumes.
    pub async fn check(&self, key: &str, limit_type: &str) -> Result<ConsumeResult> {
        let (limit, now, count, oldest) = self.read_window(key, limit_type).await?;

        if count < limit.max {
            Ok(ConsumeResult {
                allowed: true,
                limit: limit.max,
                remaining: limit.max - count,
                reset_at: now + limit.window_millis(),
                retry_after_secs: 0,
            })
        } else {
            Ok(self.denial(&limit, now, count, oldest))
        }
    }

    /// Clear the account for a `(key, limit type)` pair; a fresh window
    /// begins afterwards.
    pub async fn reset(&self, key: &str, limit_type: &str) -> Result<()> {
        // Unknown limit types are still programming errors here.
        self.limit(limit_type)?;
        self.store.clear(&account_key(key, limit_type)).await?;
        debug!(key = %key, limit_type = %limit_type, "Account reset");
        Ok(())
    }

    /// Current occupancy reshaped for display.
    pub async fn status(&self, key: &str, limit_type: &str) -> Result<UsageStatus> {
        let (limit, now, count, _oldest) = self.read_window(key, limit_type).await?;
        Ok(UsageStatus {
            used: count,
            remaining: limit.max.saturating_sub(count),
            max: limit.max,
            reset_at: now + limit.window_millis(),
        })
    }

    fn limit(&self, limit_type: &str) -> Result<LimitConfig> {
        self.limits
            .get(limit_type)
            .copied()
            .ok_or_else(|| FloodgateError::UnknownLimitType(limit_type.to_string()))
    }

    /// Shared read path for `check` and `status`: opportunistic cleanup, then
    /// count and oldest for the scoped account.
    async fn read_window(
        &self,
        key: &str,
        limit_type: &str,
    ) -> Result<(LimitConfig, u64, u32, Option<u64>)> {
        let limit = self.limit(limit_type)?;
        let now = self.clock.now_millis();
        let window_start = now.saturating_sub(limit.window_millis());
        let account = account_key(key, limit_type);

        self.store.cleanup(&account, window_start).await?;
        let count = self.store.count(&account, window_start).await?;
        let oldest = self.store.oldest(&account, window_start).await?;
        Ok((limit, now, count, oldest))
    }

    /// Build the denial result. Retry-after is driven by the oldest in-window
    /// entry; with no such entry (possible when `cost > max`), the full
    /// window length is the safe fallback.
    fn denial(
        &self,
        limit: &LimitConfig,
        now: u64,
        count: u32,
        oldest: Option<u64>,
    ) -> ConsumeResult {
        let retry_after_secs = match oldest {
            Some(oldest) => (oldest + limit.window_millis())
                .saturating_sub(now)
                .div_ceil(1000),
            None => limit.window_secs,
        };
        ConsumeResult {
            allowed: false,
            limit: limit.max,
            remaining: limit.max.saturating_sub(count),
            reset_at: now + retry_after_secs * 1000,
            retry_after_secs,
        }
    }
}

/// Accounts are scoped per `(key, limit type)` pair, so named limits are
/// fully independent counters over the same identity key.
fn account_key(key: &str, limit_type: &str) -> String {
    format!("{}:{}", limit_type, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: u64 = 1_000_000;

    fn test_limiter() -> (Limiter, Arc<ManualClock>) {
        let mut table = LimitTable::default();
        table.insert("bulk", LimitConfig { max: 5, window_secs: 60 });
        let clock = Arc::new(ManualClock::starting_at(T0));
        let store = Arc::new(InMemoryWindowStore::new(MemoryStoreConfig::default()));
        let limiter = Limiter::with_store(table, store).with_clock(clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_single_post_then_denied() {
        let (limiter, clock) = test_limiter();

        let result = limiter.consume("agentA", "posts").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.limit, 1);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reset_at, T0 + 1_800_000);

        clock.advance_secs(10);
        let result = limiter.consume("agentA", "posts").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after_secs, 1790);
        assert_eq!(result.reset_at, clock.now_millis() + 1790 * 1000);
    }

    #[tokio::test]
    async fn test_requests_exhaust_at_limit() {
        let (limiter, clock) = test_limiter();

        for i in 0..100u32 {
            let result = limiter.consume("agentA", "requests").await.unwrap();
            assert!(result.allowed, "request {} should be allowed", i + 1);
            assert_eq!(result.remaining, 99 - i);
            clock.advance_millis(10);
        }

        let result = limiter.consume("agentA", "requests").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_entries_age_out_after_window() {
        let (limiter, clock) = test_limiter();

        for _ in 0..5 {
            assert!(limiter.consume("k", "bulk").await.unwrap().allowed);
        }
        assert!(!limiter.consume("k", "bulk").await.unwrap().allowed);

        clock.advance_secs(61);
        let result = limiter.consume("k", "bulk").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_cost_above_max_always_denies_without_mutation() {
        let (limiter, _clock) = test_limiter();

        // Fresh account: nothing in the window, full window as fallback.
        let result = limiter.consume_cost("k", "bulk", 6).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after_secs, 60);

        let account = account_key("k", "bulk");
        assert_eq!(limiter.store().count(&account, 0).await.unwrap(), 0);

        // Partially occupied account: still denied, still untouched.
        limiter.consume_cost("k", "bulk", 2).await.unwrap();
        let result = limiter.consume_cost("k", "bulk", 6).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 3);
        assert_eq!(limiter.store().count(&account, 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_multi_cost_consume() {
        let (limiter, _clock) = test_limiter();

        let result = limiter.consume_cost("k", "bulk", 3).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);

        let result = limiter.consume_cost("k", "bulk", 3).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 2);

        let result = limiter.consume_cost("k", "bulk", 2).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_zero_cost_rejected() {
        let (limiter, _clock) = test_limiter();
        let err = limiter.consume_cost("k", "bulk", 0).await.unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_limit_type_errors_everywhere() {
        let (limiter, _clock) = test_limiter();

        for result in [
            limiter.consume("k", "uploads").await.err(),
            limiter.check("k", "uploads").await.err(),
            limiter.status("k", "uploads").await.err(),
        ] {
            assert!(matches!(
                result,
                Some(FloodgateError::UnknownLimitType(ref t)) if t == "uploads"
            ));
        }
        assert!(matches!(
            limiter.reset("k", "uploads").await,
            Err(FloodgateError::UnknownLimitType(_))
        ));
    }

    #[tokio::test]
    async fn test_check_never_consumes() {
        let (limiter, _clock) = test_limiter();

        limiter.consume("k", "bulk").await.unwrap();
        for _ in 0..10 {
            let result = limiter.check("k", "bulk").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, 4);
        }

        let status = limiter.status("k", "bulk").await.unwrap();
        assert_eq!(status.used, 1);
    }

    #[tokio::test]
    async fn test_check_reports_denial_with_retry() {
        let (limiter, clock) = test_limiter();

        limiter.consume("agentA", "posts").await.unwrap();
        clock.advance_secs(100);

        let result = limiter.check("agentA", "posts").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after_secs, 1700);
    }

    #[tokio::test]
    async fn test_status_shape() {
        let (limiter, clock) = test_limiter();

        limiter.consume_cost("k", "bulk", 2).await.unwrap();
        let status = limiter.status("k", "bulk").await.unwrap();
        assert_eq!(
            status,
            UsageStatus {
                used: 2,
                remaining: 3,
                max: 5,
                reset_at: clock.now_millis() + 60_000,
            }
        );
    }

    #[tokio::test]
    async fn test_reset_then_full_consume_succeeds() {
        let (limiter, _clock) = test_limiter();

        for _ in 0..5 {
            limiter.consume("k", "bulk").await.unwrap();
        }
        assert!(!limiter.consume("k", "bulk").await.unwrap().allowed);

        limiter.reset("k", "bulk").await.unwrap();
        let result = limiter.consume_cost("k", "bulk", 5).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_limit_types_are_independent() {
        let (limiter, _clock) = test_limiter();

        limiter.consume("agentA", "posts").await.unwrap();
        assert!(!limiter.consume("agentA", "posts").await.unwrap().allowed);

        // Same key, different limit type: unaffected.
        let result = limiter.consume("agentA", "votes").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 29);

        // Different key, same limit type: unaffected.
        assert!(limiter.consume("agentB", "posts").await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_consumes_never_over_admit() {
        let (limiter, _clock) = test_limiter();
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.consume("k", "bulk").await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_reset_at_conversions() {
        let result = ConsumeResult {
            allowed: true,
            limit: 10,
            remaining: 9,
            reset_at: 1_700_000_000_500,
            retry_after_secs: 0,
        };
        assert_eq!(result.reset_at_secs(), 1_700_000_000);
        assert_eq!(result.reset_at_utc().timestamp_millis(), 1_700_000_000_500);
    }
}
