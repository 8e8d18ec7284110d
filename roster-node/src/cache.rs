//! Time-bounded read caches in front of the shared store.
//!
//! Entries expire a fixed time after they were written. `get` never serves an
//! expired entry; `cleanup` drops them in bulk on a timer so lookups don't
//! have to scan.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use roster_store::StoreError;
use scc::hash_map::Entry;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

type LoadResult<V> = Result<Option<V>, StoreError>;

struct CacheEntry<V> {
    value: V,
    written_at: Instant,
}

/// A load already running for some key. Followers wait on `done`.
struct Flight<V> {
    id: u64,
    done: watch::Receiver<Option<LoadResult<V>>>,
}

enum Role<V> {
    Leader(u64, watch::Sender<Option<LoadResult<V>>>),
    Follower(watch::Receiver<Option<LoadResult<V>>>),
}

pub struct ExpiringCache<V> {
    name: &'static str,
    expiry: Duration,
    entries: scc::HashMap<String, CacheEntry<V>>,
    in_flight: Mutex<HashMap<String, Flight<V>>>,
    next_flight: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> ExpiringCache<V> {
    pub fn new(name: &'static str, expiry: Duration) -> Self {
        Self {
            name,
            expiry,
            entries: scc::HashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    /// Cached value for `key`, loading it on a miss.
    ///
    /// Concurrent misses for one key share a single call to `load`. Absent
    /// values and failures are returned but never cached.
    pub async fn get<F, Fut>(&self, key: &str, load: F) -> LoadResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LoadResult<V>>,
    {
        let (id, done) = loop {
            if let Some(value) = self.peek(key).await {
                return Ok(Some(value));
            }
            match self.join_flight(key) {
                Role::Leader(id, done) => break (id, done),
                Role::Follower(mut rx) => {
                    let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
                    if let Some(result) = outcome {
                        return result;
                    }
                    // The leader was cancelled; try again.
                }
            }
        };

        let _guard = FlightGuard {
            in_flight: &self.in_flight,
            key,
            id,
        };

        let result = load().await;
        if let Ok(Some(value)) = &result {
            self.fill(key, id, value.clone()).await;
        }
        let _ = done.send(Some(result.clone()));
        result
    }

    /// Fresh cached value without touching the store.
    pub async fn peek(&self, key: &str) -> Option<V> {
        self.entries
            .read_async(key, |_, entry| {
                (entry.written_at.elapsed() < self.expiry).then(|| entry.value.clone())
            })
            .await
            .flatten()
    }

    /// Store `value`, returning the previous value if it had not expired.
    pub async fn put(&self, key: &str, value: V) -> Option<V> {
        let fresh = CacheEntry {
            value,
            written_at: Instant::now(),
        };
        match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let previous = std::mem::replace(occupied.get_mut(), fresh);
                (previous.written_at.elapsed() < self.expiry).then_some(previous.value)
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(fresh);
                None
            }
        }
    }

    /// Drop the entry for `key`. A load already running for it will not be
    /// cached, and the next miss starts a new one.
    pub async fn invalidate(&self, key: &str) {
        self.flights().remove(key);
        let _ = self.entries.remove_async(key).await;
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let before = self.entries.len();
        let expiry = self.expiry;
        self.entries
            .retain_async(|_, entry| entry.written_at.elapsed() < expiry)
            .await;
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(cache = self.name, removed, "evicted expired entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a loaded value unless a `put` or an `invalidate` landed while
    /// we were loading; either makes what we read stale.
    ///
    /// The flight check runs under the entry lock and `invalidate` retires
    /// the flight before removing the entry, so the two cannot interleave.
    async fn fill(&self, key: &str, flight: u64, value: V) {
        let fresh = CacheEntry {
            value,
            written_at: Instant::now(),
        };
        match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let expired = occupied.get().written_at.elapsed() >= self.expiry;
                if expired && self.is_current(key, flight) {
                    *occupied.get_mut() = fresh;
                }
            }
            Entry::Vacant(vacant) => {
                if self.is_current(key, flight) {
                    vacant.insert_entry(fresh);
                }
            }
        }
    }

    fn is_current(&self, key: &str, flight: u64) -> bool {
        self.flights().get(key).is_some_and(|f| f.id == flight)
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<String, Flight<V>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_flight(&self, key: &str) -> Role<V> {
        let mut flights = self.flights();
        if let Some(flight) = flights.get(key) {
            if flight.done.has_changed().is_ok() {
                return Role::Follower(flight.done.clone());
            }
        }
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_string(), Flight { id, done: rx });
        Role::Leader(id, tx)
    }
}

/// Clears a flight when its leader finishes or is dropped mid-load.
struct FlightGuard<'a, V> {
    in_flight: &'a Mutex<HashMap<String, Flight<V>>>,
    key: &'a str,
    id: u64,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        let mut flights = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if flights.get(self.key).is_some_and(|f| f.id == self.id) {
            flights.remove(self.key);
        }
    }
}

/// The four per-field caches kept for remote players.
pub struct PlayerCaches {
    pub server: ExpiringCache<String>,
    pub proxy: ExpiringCache<String>,
    pub ip: ExpiringCache<IpAddr>,
    pub last_online: ExpiringCache<i64>,
}

impl PlayerCaches {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            server: ExpiringCache::new("server", config.server_ttl),
            proxy: ExpiringCache::new("proxy", config.proxy_ttl),
            ip: ExpiringCache::new("ip", config.ip_ttl),
            last_online: ExpiringCache::new("last_online", config.last_online_ttl),
        }
    }

    /// Forget everything cached about `player`.
    pub async fn invalidate(&self, player: &str) {
        self.server.invalidate(player).await;
        self.proxy.invalidate(player).await;
        self.ip.invalidate(player).await;
        self.last_online.invalidate(player).await;
    }

    pub async fn cleanup(&self) -> usize {
        self.server.cleanup().await
            + self.proxy.cleanup().await
            + self.ip.cleanup().await
            + self.last_online.cleanup().await
    }
}
