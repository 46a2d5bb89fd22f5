//! Windowed counting backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Counts occurrences of a key within a rolling window.
///
/// One call is one atomic read-modify-return step: a key with no live
/// entry is created at 1, a live entry still at or below `limit` is
/// incremented, and anything past that is returned unchanged. The count
/// therefore saturates at `limit + 1`, and a caller admits a request iff
/// the returned count is `<= limit` — which yields exactly `limit`
/// admissions per window under any concurrent interleaving.
#[async_trait]
pub trait Counter: Send + Sync {
    async fn count(&self, key: &str, limit: u64, window: Duration) -> Result<u64>;
}

/// A single key's window state.
#[derive(Debug, Clone)]
struct CounterEntry {
    count: u64,
    reset_at: Instant,
}

/// In-process counter backend.
///
/// Entries live in a concurrent map keyed by the derived request key;
/// the map's per-key entry guard is the critical section, so two calls
/// for the same key can never interleave their read and increment.
pub struct LocalCounter {
    entries: DashMap<String, CounterEntry>,
}

impl LocalCounter {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Drop entries whose window has passed. Expired entries are also
    /// replaced lazily on access; this sweep only bounds memory for keys
    /// that never return.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.reset_at);
    }

    /// Number of live and expired-but-unswept entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for LocalCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Counter for LocalCounter {
    async fn count(&self, key: &str, limit: u64, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                reset_at: now + window,
            });

        if now >= entry.reset_at {
            // Stale window: start a fresh one instead of incrementing it.
            entry.count = 1;
            entry.reset_at = now + window;
        } else if entry.count <= limit {
            entry.count += 1;
        }

        Ok(entry.count)
    }
}

/// Periodically sweep a counter's expired entries.
pub fn spawn_purge_task(
    counter: Arc<LocalCounter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            counter.purge_expired();
        }
    })
}
