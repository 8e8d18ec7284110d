use std::net::IpAddr;

use roster_store::{WriteBatch, keys, keys::field};

use crate::protocol::{Channels, Envelope, Event};

/// Queues the shared-store writes for player records owned by one node.
///
/// Writes are only queued, never sent; callers decide how to group them into
/// batches. Any publish is queued after the writes it announces.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    node_id: String,
    channels: Channels,
}

impl RecordWriter {
    pub fn new(node_id: &str, channels: Channels) -> Self {
        Self {
            node_id: node_id.to_string(),
            channels,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Attach `player` to this node and (re)write its record.
    ///
    /// With `announce` a JOIN envelope follows the writes.
    pub fn register(
        &self,
        batch: &mut WriteBatch,
        player: &str,
        address: IpAddr,
        server: Option<&str>,
        announce: bool,
    ) {
        let mut fields = vec![
            (field::PROXY.to_string(), self.node_id.clone()),
            (field::IP.to_string(), address.to_string()),
            (field::ONLINE.to_string(), "0".to_string()),
        ];
        if let Some(server) = server {
            fields.push((field::SERVER.to_string(), server.to_string()));
        }
        batch
            .sadd(keys::users_online(&self.node_id), player)
            .hset_multiple(keys::player(player), fields);
        if announce {
            self.announce(batch, player, Event::Join { address });
        }
    }

    /// Detach `player` from `owner` and mark it offline at `timestamp`
    /// (unix millis), then announce the LEAVE.
    ///
    /// `server`, `ip` and `proxy` become absent; `online` keeps the
    /// last-seen stamp.
    pub fn clean_up(&self, batch: &mut WriteBatch, owner: &str, player: &str, timestamp: i64) {
        let record = keys::player(player);
        batch
            .srem(keys::users_online(owner), player)
            .hdel(record.clone(), [field::SERVER, field::IP, field::PROXY])
            .hset(record, field::ONLINE, timestamp.to_string());
        self.announce(batch, player, Event::Leave { timestamp });
    }

    /// Record a backend switch, then announce it.
    pub fn switch_server(&self, batch: &mut WriteBatch, player: &str, server: &str) {
        batch.hset(keys::player(player), field::SERVER, server);
        self.announce(
            batch,
            player,
            Event::ServerChange {
                server: server.to_string(),
            },
        );
    }

    fn announce(&self, batch: &mut WriteBatch, player: &str, event: Event) {
        let envelope = Envelope::new(self.node_id.as_str(), player, event);
        batch.publish(self.channels.data.as_str(), envelope.encode());
    }
}
