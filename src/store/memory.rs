//! Bounded in-process window store.
//!
//! Holds all accounts for a single process under two competing constraints:
//! correctness of the windowed count, and a hard cap on total memory no
//! matter how many distinct keys an adversary can generate (e.g., spoofed
//! network addresses). Capacity is enforced by evicting the oldest-created
//! key; staleness is handled lazily on read and by a background sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{Admission, StoreStats, WindowStore};
use crate::clock::{Clock, SystemClock};
use crate::config::MemoryStoreConfig;
use crate::error::StoreError;

/// Keys processed per lock acquisition during a sweep pass.
const SWEEP_CHUNK: usize = 256;

/// One hit record.
#[derive(Debug, Clone, Copy)]
struct Entry {
    timestamp: u64,
    cost: u32,
}

/// The ordered hit log for one key.
///
/// Entries are appended in timestamp order, so expiry always trims from the
/// front.
#[derive(Debug)]
struct Account {
    entries: VecDeque<Entry>,
    /// Creation sequence number, used to validate ledger pairs on eviction.
    created_seq: u64,
}

impl Account {
    fn new(created_seq: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            created_seq,
        }
    }

    /// Drop entries older than the cutoff.
    fn prune(&mut self, cutoff: u64) {
        while self
            .entries
            .front()
            .map_or(false, |e| e.timestamp < cutoff)
        {
            self.entries.pop_front();
        }
    }

    /// Sum of cost over entries at or after `window_start`.
    fn count_since(&self, window_start: u64) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.timestamp >= window_start)
            .fold(0u32, |acc, e| acc.saturating_add(e.cost))
    }

    /// Oldest timestamp at or after `window_start`.
    fn oldest_since(&self, window_start: u64) -> Option<u64> {
        self.entries
            .iter()
            .map(|e| e.timestamp)
            .find(|&t| t >= window_start)
    }
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<String, Account>,
    /// FIFO creation ledger: `(seq, key)` pairs in insertion order. Pairs
    /// whose key was since removed or re-created are stale and skipped.
    creation_order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl State {
    /// Get the account for a key, creating it if absent. Creating a key while
    /// at capacity first evicts the oldest-created key.
    fn account_mut_or_insert(&mut self, key: &str, max_keys: usize) -> &mut Account {
        if !self.accounts.contains_key(key) {
            if self.accounts.len() >= max_keys {
                self.evict_oldest();
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.creation_order.push_back((seq, key.to_string()));
            self.accounts.insert(key.to_string(), Account::new(seq));
            self.maybe_compact();
        }
        self.accounts
            .get_mut(key)
            .expect("account inserted above")
    }

    /// Evict exactly one key: the oldest by creation, not by last activity.
    /// A live, frequently-hit key is deliberately not protected here; see the
    /// type-level docs on [`InMemoryWindowStore`].
    fn evict_oldest(&mut self) {
        while let Some((seq, key)) = self.creation_order.pop_front() {
            let matches = self
                .accounts
                .get(&key)
                .map_or(false, |a| a.created_seq == seq);
            if matches {
                self.accounts.remove(&key);
                debug!(key = %key, "Evicted oldest-created key at capacity");
                return;
            }
            // Stale pair: the key was cleaned up, cleared, or re-created.
        }
    }

    /// Trim stale ledger pairs once they outnumber live keys.
    fn maybe_compact(&mut self) {
        if self.creation_order.len() > self.accounts.len() * 2 + 64 {
            let accounts = &self.accounts;
            self.creation_order
                .retain(|(seq, key)| accounts.get(key).map_or(false, |a| a.created_seq == *seq));
        }
    }

    /// Prune a key against the cutoff, removing it entirely once empty.
    /// Returns `(count, oldest)` for entries at or after the cutoff.
    fn prune_and_read(&mut self, key: &str, window_start: u64) -> (u32, Option<u64>) {
        let (count, oldest, emptied) = match self.accounts.get_mut(key) {
            Some(account) => {
                account.prune(window_start);
                (
                    account.count_since(window_start),
                    account.oldest_since(window_start),
                    account.entries.is_empty(),
                )
            }
            None => (0, None, false),
        };
        if emptied {
            self.accounts.remove(key);
        }
        (count, oldest)
    }
}

/// The default, bounded, in-process window store.
///
/// All operations are short critical sections over one mutex; the combined
/// count-then-add runs under a single lock acquisition, so concurrent callers
/// for the same key observe a strict total order.
///
/// Eviction at `max_keys` is FIFO by key creation, not LRU by last activity.
/// An adversary creating many short-lived keys ahead of one long-lived
/// legitimate key can eventually push the legitimate key out purely because
/// it was created earlier. This is a known fairness weakness of the policy,
/// kept because switching to LRU changes observable eviction order.
///
/// Construction starts the background retention sweep and therefore requires
/// a running Tokio runtime. The sweep is stopped by [`shutdown`] or when the
/// store is dropped.
///
/// [`shutdown`]: InMemoryWindowStore::shutdown
pub struct InMemoryWindowStore {
    state: Arc<Mutex<State>>,
    max_keys: usize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryWindowStore {
    /// Create a store with the given configuration and start its sweep.
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a store with an explicit time source.
    pub fn with_clock(config: MemoryStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let sweeper = Self::spawn_sweeper(
            Arc::downgrade(&state),
            clock,
            config.sweep_interval(),
            config.retention_millis(),
        );
        Self {
            state,
            max_keys: config.max_keys,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    fn spawn_sweeper(
        state: Weak<Mutex<State>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        retention_millis: u64,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // pass runs one full interval after construction.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let state = match state.upgrade() {
                    Some(state) => state,
                    // Store dropped; nothing left to sweep.
                    None => break,
                };
                let cutoff = clock.now_millis().saturating_sub(retention_millis);
                Self::sweep_pass(&state, cutoff).await;
            }
        })
    }

    /// One retention pass over all keys, in bounded chunks so request
    /// handling is never stalled behind a full O(total entries) scan.
    async fn sweep_pass(state: &Arc<Mutex<State>>, cutoff: u64) {
        let keys: Vec<String> = state.lock().accounts.keys().cloned().collect();
        let mut removed_entries = 0usize;
        let mut removed_keys = 0usize;

        for chunk in keys.chunks(SWEEP_CHUNK) {
            {
                let mut state = state.lock();
                for key in chunk {
                    let emptied = match state.accounts.get_mut(key) {
                        Some(account) => {
                            let before = account.entries.len();
                            account.prune(cutoff);
                            removed_entries += before - account.entries.len();
                            account.entries.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        state.accounts.remove(key);
                        removed_keys += 1;
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        if removed_entries > 0 || removed_keys > 0 {
            debug!(removed_entries, removed_keys, "Retention sweep completed");
        }
    }

    /// Stop the background sweep. Idempotent; also runs on drop, so a
    /// short-lived store (e.g., in a test) never leaks its task.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for InMemoryWindowStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn add(&self, key: &str, timestamp: u64, cost: u32) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let account = state.account_mut_or_insert(key, self.max_keys);
        account.entries.push_back(Entry { timestamp, cost });
        trace!(key = %key, timestamp, cost, "Recorded hit");
        Ok(())
    }

    async fn count(&self, key: &str, window_start: u64) -> Result<u32, StoreError> {
        let state = self.state.lock();
        Ok(state
            .accounts
            .get(key)
            .map_or(0, |a| a.count_since(window_start)))
    }

    async fn oldest(&self, key: &str, window_start: u64) -> Result<Option<u64>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .accounts
            .get(key)
            .and_then(|a| a.oldest_since(window_start)))
    }

    async fn cleanup(&self, key: &str, window_start: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.prune_and_read(key, window_start);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.accounts.remove(key);
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.lock();
        Ok(StoreStats {
            keys: state.accounts.len(),
            entries: state.accounts.values().map(|a| a.entries.len()).sum(),
        })
    }

    /// Single-lock override: prune, count, decide, and append without
    /// releasing the mutex, making the check-and-add atomic across the
    /// multi-threaded runtime.
    async fn check_and_add(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        cost: u32,
        max: u32,
    ) -> Result<Admission, StoreError> {
        let mut state = self.state.lock();
        let (count, oldest) = state.prune_and_read(key, window_start);

        if count.saturating_add(cost) > max {
            trace!(key = %key, count, cost, max, "Hit denied");
            return Ok(Admission {
                admitted: false,
                count,
                oldest,
            });
        }

        let account = state.account_mut_or_insert(key, self.max_keys);
        account.entries.push_back(Entry {
            timestamp: now,
            cost,
        });
        trace!(key = %key, count, cost, max, "Hit admitted");
        Ok(Admission {
            admitted: true,
            count,
            oldest,
        })
    }
}
