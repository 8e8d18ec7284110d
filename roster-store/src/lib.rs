//! Shared state store client.
//!
//! Every node in the fleet coordinates through one networked key/value store
//! with hashes, sets and pub/sub channels. [`Store`] is that contract;
//! [`RedisStore`] talks to a real server and [`MemoryStore`] keeps the same
//! semantics in process for tests and single-node runs.

mod batch;
mod error;
pub mod keys;
mod memory;
mod redis_store;

pub use batch::{WriteBatch, WriteOp};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
  pub channel: String,
  pub payload: String,
}

/// Messages from every subscribed channel. Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, ChannelMessage>;

/// Operations the synchronization layer needs from the shared store.
///
/// Every method can fail with a connectivity error. Callers must read that
/// as "shared state unknown right now", never as "no data".
#[async_trait]
pub trait Store: Send + Sync + 'static {
  /// Check the store is reachable.
  async fn ping(&self) -> Result<()>;

  /// Current time in whole seconds according to the store's clock.
  async fn time(&self) -> Result<i64>;

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

  async fn smembers(&self, key: &str) -> Result<HashSet<String>>;

  async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

  /// Union of several sets. An empty key list yields an empty set.
  async fn sunion(&self, keys: &[String]) -> Result<HashSet<String>>;

  async fn scard(&self, key: &str) -> Result<usize>;

  async fn publish(&self, channel: &str, message: &str) -> Result<()>;

  /// Apply every write in the batch as one atomic pipeline.
  async fn apply(&self, batch: WriteBatch) -> Result<()>;

  /// Open a subscription on the given channels.
  async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;

  /// Refuse all further operations. Idempotent.
  async fn close(&self);

  async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
    let mut batch = WriteBatch::new();
    batch.hset(key, field, value);
    self.apply(batch).await
  }
}
