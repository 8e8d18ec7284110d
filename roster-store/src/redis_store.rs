use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::{ChannelMessage, Result, Store, StoreError, Subscription, WriteBatch, WriteOp};

/// Redis-backed [`Store`].
///
/// Commands share one multiplexed connection manager; a semaphore caps how
/// many of them may be checked out at once. Subscriptions get a dedicated
/// connection each.
#[derive(Clone)]
pub struct RedisStore {
  client: redis::Client,
  conn: ConnectionManager,
  permits: Arc<Semaphore>,
}

impl RedisStore {
  /// Connect and verify the server answers.
  pub async fn connect(url: &str, max_connections: usize) -> Result<Self> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client.clone()).await?;
    let store = Self {
      client,
      conn,
      permits: Arc::new(Semaphore::new(max_connections.max(1))),
    };
    store.ping().await?;
    info!(max_connections, "connected to redis");
    Ok(store)
  }

  async fn checkout(&self) -> Result<(OwnedSemaphorePermit, ConnectionManager)> {
    let permit = self
      .permits
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| StoreError::Closed)?;
    Ok((permit, self.conn.clone()))
  }
}

#[async_trait]
impl Store for RedisStore {
  async fn ping(&self) -> Result<()> {
    let (_permit, mut conn) = self.checkout().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn time(&self) -> Result<i64> {
    let (_permit, mut conn) = self.checkout().await?;
    let (seconds, _micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
    Ok(seconds)
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    let (_permit, mut conn) = self.checkout().await?;
    let value: Option<String> = conn.hget(key, field).await?;
    Ok(value)
  }

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
    let (_permit, mut conn) = self.checkout().await?;
    let map: HashMap<String, String> = conn.hgetall(key).await?;
    Ok(map)
  }

  async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
    let (_permit, mut conn) = self.checkout().await?;
    let members: HashSet<String> = conn.smembers(key).await?;
    Ok(members)
  }

  async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
    let (_permit, mut conn) = self.checkout().await?;
    let present: bool = conn.sismember(key, member).await?;
    Ok(present)
  }

  async fn sunion(&self, keys: &[String]) -> Result<HashSet<String>> {
    if keys.is_empty() {
      return Ok(HashSet::new());
    }
    let (_permit, mut conn) = self.checkout().await?;
    let members: HashSet<String> = conn.sunion(keys.to_vec()).await?;
    Ok(members)
  }

  async fn scard(&self, key: &str) -> Result<usize> {
    let (_permit, mut conn) = self.checkout().await?;
    let count: usize = conn.scard(key).await?;
    Ok(count)
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<()> {
    let (_permit, mut conn) = self.checkout().await?;
    let _: i64 = conn.publish(channel, message).await?;
    Ok(())
  }

  async fn apply(&self, batch: WriteBatch) -> Result<()> {
    if batch.is_empty() {
      return Ok(());
    }

    let len = batch.len();
    let mut pipe = redis::pipe();
    pipe.atomic();
    for op in batch.into_ops() {
      match op {
        WriteOp::SetAdd { key, member } => {
          pipe.sadd(key, member).ignore();
        }
        WriteOp::SetRemove { key, member } => {
          pipe.srem(key, member).ignore();
        }
        WriteOp::HashSet { key, fields } => {
          pipe.hset_multiple(key, &fields).ignore();
        }
        WriteOp::HashDelete { key, fields } => {
          pipe.hdel(key, fields).ignore();
        }
        WriteOp::Delete { key } => {
          pipe.del(key).ignore();
        }
        WriteOp::Publish { channel, message } => {
          pipe.publish(channel, message).ignore();
        }
      }
    }

    let (_permit, mut conn) = self.checkout().await?;
    let _: () = pipe.query_async(&mut conn).await?;
    debug!(ops = len, "applied write batch");
    Ok(())
  }

  async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
    if self.permits.is_closed() {
      return Err(StoreError::Closed);
    }

    let mut pubsub = self.client.get_async_pubsub().await?;
    for channel in channels {
      pubsub.subscribe(channel.as_str()).await?;
    }
    debug!(?channels, "subscribed");

    let stream = pubsub.into_on_message().filter_map(|msg| async move {
      match msg.get_payload::<String>() {
        Ok(payload) => Some(ChannelMessage {
          channel: msg.get_channel_name().to_string(),
          payload,
        }),
        Err(err) => {
          warn!(channel = msg.get_channel_name(), %err, "dropping non-text pubsub payload");
          None
        }
      }
    });

    Ok(stream.boxed())
  }

  async fn close(&self) {
    self.permits.close();
    info!("redis client closed");
  }
}
