//! In-process store with the same semantics as the Redis client.
//!
//! Clones share state, so several nodes handed clones of one `MemoryStore`
//! behave like a fleet sharing one Redis server. [`MemoryStore::connection`]
//! gives a node its own handle that can be closed without affecting others.
//! The clock can be frozen and the store can be taken offline to exercise
//! liveness and failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::{ChannelMessage, Result, Store, StoreError, Subscription, WriteBatch, WriteOp};

const UNSET_CLOCK: i64 = i64::MIN;

#[derive(Default)]
struct Data {
  hashes: HashMap<String, HashMap<String, String>>,
  sets: HashMap<String, HashSet<String>>,
}

struct Inner {
  data: Mutex<Data>,
  events: broadcast::Sender<ChannelMessage>,
  clock: AtomicI64,
  offline: AtomicBool,
  hget_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryStore {
  inner: Arc<Inner>,
  closed: Arc<AtomicBool>,
}

impl MemoryStore {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(1024);
    Self {
      inner: Arc::new(Inner {
        data: Mutex::new(Data::default()),
        events,
        clock: AtomicI64::new(UNSET_CLOCK),
        offline: AtomicBool::new(false),
        hget_calls: AtomicUsize::new(0),
      }),
      closed: Arc::new(AtomicBool::new(false)),
    }
  }

  /// A new handle onto the same data whose `close` only affects itself.
  pub fn connection(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      closed: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Freeze the store clock at `seconds`.
  pub fn set_time(&self, seconds: i64) {
    self.inner.clock.store(seconds, Ordering::SeqCst);
  }

  /// Move a frozen clock forward. Freezes it at wall time first if needed.
  pub fn advance(&self, seconds: i64) {
    let now = self.now();
    self.set_time(now + seconds);
  }

  /// Simulate losing (or regaining) the connection to the store.
  pub fn set_offline(&self, offline: bool) {
    self.inner.offline.store(offline, Ordering::SeqCst);
  }

  /// Number of `hget` round trips served so far.
  pub fn hget_calls(&self) -> usize {
    self.inner.hget_calls.load(Ordering::SeqCst)
  }

  fn now(&self) -> i64 {
    match self.inner.clock.load(Ordering::SeqCst) {
      UNSET_CLOCK => SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default(),
      frozen => frozen,
    }
  }

  fn check(&self) -> Result<()> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(StoreError::Closed);
    }
    if self.inner.offline.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
    }
    Ok(())
  }

  fn data(&self) -> MutexGuard<'_, Data> {
    self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn send(&self, channel: String, payload: String) {
    // No subscribers is not an error for pub/sub.
    let _ = self.inner.events.send(ChannelMessage { channel, payload });
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn ping(&self) -> Result<()> {
    self.check()
  }

  async fn time(&self) -> Result<i64> {
    self.check()?;
    Ok(self.now())
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    self.check()?;
    self.inner.hget_calls.fetch_add(1, Ordering::SeqCst);
    Ok(self.data().hashes.get(key).and_then(|h| h.get(field)).cloned())
  }

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
    self.check()?;
    Ok(self.data().hashes.get(key).cloned().unwrap_or_default())
  }

  async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
    self.check()?;
    Ok(self.data().sets.get(key).cloned().unwrap_or_default())
  }

  async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
    self.check()?;
    Ok(self.data().sets.get(key).is_some_and(|s| s.contains(member)))
  }

  async fn sunion(&self, keys: &[String]) -> Result<HashSet<String>> {
    self.check()?;
    let data = self.data();
    Ok(
      keys
        .iter()
        .filter_map(|k| data.sets.get(k))
        .flatten()
        .cloned()
        .collect(),
    )
  }

  async fn scard(&self, key: &str) -> Result<usize> {
    self.check()?;
    Ok(self.data().sets.get(key).map_or(0, HashSet::len))
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<()> {
    self.check()?;
    self.send(channel.to_string(), message.to_string());
    Ok(())
  }

  async fn apply(&self, batch: WriteBatch) -> Result<()> {
    self.check()?;

    let mut published = Vec::new();
    {
      let mut data = self.data();
      for op in batch.into_ops() {
        match op {
          WriteOp::SetAdd { key, member } => {
            data.sets.entry(key).or_default().insert(member);
          }
          WriteOp::SetRemove { key, member } => {
            if let Some(set) = data.sets.get_mut(&key) {
              set.remove(&member);
              if set.is_empty() {
                data.sets.remove(&key);
              }
            }
          }
          WriteOp::HashSet { key, fields } => {
            data.hashes.entry(key).or_default().extend(fields);
          }
          WriteOp::HashDelete { key, fields } => {
            if let Some(hash) = data.hashes.get_mut(&key) {
              for field in &fields {
                hash.remove(field);
              }
              if hash.is_empty() {
                data.hashes.remove(&key);
              }
            }
          }
          WriteOp::Delete { key } => {
            data.sets.remove(&key);
            data.hashes.remove(&key);
          }
          WriteOp::Publish { channel, message } => published.push((channel, message)),
        }
      }
    }

    for (channel, message) in published {
      self.send(channel, message);
    }
    Ok(())
  }

  async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
    self.check()?;
    let wanted: HashSet<String> = channels.iter().cloned().collect();
    let rx = self.inner.events.subscribe();

    let stream = stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
      loop {
        match rx.recv().await {
          Ok(msg) if wanted.contains(&msg.channel) => return Some((msg, (rx, wanted))),
          Ok(_) => continue,
          Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "in-memory subscriber fell behind");
          }
          Err(RecvError::Closed) => return None,
        }
      }
    });

    Ok(stream.boxed())
  }

  async fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::keys;

  #[tokio::test]
  async fn test_batch_applies_sets_and_hashes() {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    batch
      .sadd(keys::users_online("a"), "alice")
      .sadd(keys::users_online("b"), "bob")
      .hset_multiple(
        keys::player("alice"),
        [
          ("proxy".to_string(), "a".to_string()),
          ("online".to_string(), "0".to_string()),
        ],
      );
    store.apply(batch).await.unwrap();

    assert!(store.sismember(&keys::users_online("a"), "alice").await.unwrap());
    assert_eq!(store.scard(&keys::users_online("b")).await.unwrap(), 1);
    assert_eq!(
      store.hget(&keys::player("alice"), "proxy").await.unwrap().as_deref(),
      Some("a")
    );

    let all = store
      .sunion(&[keys::users_online("a"), keys::users_online("b")])
      .await
      .unwrap();
    assert_eq!(all.len(), 2);
    assert!(store.sunion(&[]).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_delete_and_field_removal() {
    let store = MemoryStore::new();
    store.hset(&keys::player("bob"), "ip", "10.0.0.1").await.unwrap();
    store.hset(&keys::player("bob"), "online", "0").await.unwrap();

    let mut batch = WriteBatch::new();
    batch
      .hdel(keys::player("bob"), ["ip"])
      .sadd(keys::users_online("a"), "bob");
    store.apply(batch).await.unwrap();
    assert_eq!(store.hget(&keys::player("bob"), "ip").await.unwrap(), None);

    let mut batch = WriteBatch::new();
    batch.del(keys::users_online("a"));
    store.apply(batch).await.unwrap();
    assert!(store.smembers(&keys::users_online("a")).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_subscription_filters_channels() {
    let store = MemoryStore::new();
    let mut sub = store
      .subscribe(&["roster-data".to_string()])
      .await
      .unwrap();

    store.publish("roster-other", "ignored").await.unwrap();
    let mut batch = WriteBatch::new();
    batch.publish("roster-data", "hello");
    store.apply(batch).await.unwrap();

    let msg = sub.next().await.unwrap();
    assert_eq!(msg.channel, "roster-data");
    assert_eq!(msg.payload, "hello");
  }

  #[tokio::test]
  async fn test_frozen_clock() {
    let store = MemoryStore::new();
    store.set_time(1_700_000_000);
    store.advance(35);
    assert_eq!(store.time().await.unwrap(), 1_700_000_035);
  }

  #[tokio::test]
  async fn test_offline_and_closed_fail_with_connectivity_errors() {
    let store = MemoryStore::new();
    store.set_offline(true);
    let err = store.hget("player:x", "server").await.unwrap_err();
    assert!(err.is_connectivity());
    let unreadable = StoreError::Malformed {
      key: "player:x".to_string(),
      value: "??".to_string(),
    };
    assert!(!unreadable.is_connectivity());

    store.set_offline(false);
    assert!(store.ping().await.is_ok());

    let other = store.connection();
    store.close().await;
    assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    assert!(other.ping().await.is_ok());
  }
}
