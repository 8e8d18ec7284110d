//! Per-player lookups and the cache side of the event protocol.
//!
//! A live local session always wins. Otherwise the answer comes from the
//! field cache, loading from the store on a miss. Store failures surface as
//! errors; "unknown" is `None` (or `-1` for last-seen).

use std::net::IpAddr;
use std::sync::Arc;

use roster_store::{Store, StoreError, keys, keys::field};
use tracing::{debug, warn};

use crate::cache::PlayerCaches;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::notify::{NetworkEvent, Notifier};
use crate::protocol::{Envelope, Event};
use crate::session::LocalSessions;

/// Last-seen value for a player the store has never recorded.
pub const NEVER_SEEN: i64 = -1;

pub struct PlayerData {
    node_id: String,
    store: Arc<dyn Store>,
    sessions: Arc<dyn LocalSessions>,
    caches: PlayerCaches,
    notifier: Notifier,
}

impl PlayerData {
    pub fn new(
        node_id: &str,
        store: Arc<dyn Store>,
        sessions: Arc<dyn LocalSessions>,
        cache: &CacheConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            store,
            sessions,
            caches: PlayerCaches::new(cache),
            notifier,
        }
    }

    /// Backend server the player is on.
    pub async fn server_of(&self, player: &str) -> Result<Option<String>> {
        if let Some(session) = self.sessions.session(player).await {
            return Ok(session.server);
        }
        let value = self
            .caches
            .server
            .get(player, || self.load_field(player, field::SERVER))
            .await?;
        Ok(value)
    }

    /// Node the player is attached to.
    pub async fn proxy_of(&self, player: &str) -> Result<Option<String>> {
        if self.sessions.session(player).await.is_some() {
            return Ok(Some(self.node_id.clone()));
        }
        let value = self
            .caches
            .proxy
            .get(player, || self.load_field(player, field::PROXY))
            .await?;
        Ok(value)
    }

    pub async fn ip_of(&self, player: &str) -> Result<Option<IpAddr>> {
        if let Some(session) = self.sessions.session(player).await {
            return Ok(Some(session.address));
        }
        let value = self
            .caches
            .ip
            .get(player, || async {
                let raw = self.load_field(player, field::IP).await?;
                Ok::<_, StoreError>(raw.and_then(|raw| match raw.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => unreadable(player, raw),
                }))
            })
            .await?;
        Ok(value)
    }

    /// Unix millis the player was last seen, `0` while online anywhere and
    /// [`NEVER_SEEN`] when no node has recorded the player.
    pub async fn last_online(&self, player: &str) -> Result<i64> {
        if self.sessions.session(player).await.is_some() {
            return Ok(0);
        }
        let value = self
            .caches
            .last_online
            .get(player, || async {
                let raw = self.load_field(player, field::ONLINE).await?;
                Ok::<_, StoreError>(raw.and_then(|raw| match raw.parse::<i64>() {
                    Ok(stamp) => Some(stamp),
                    Err(_) => unreadable(player, raw),
                }))
            })
            .await?;
        Ok(value.unwrap_or(NEVER_SEEN))
    }

    /// Forget everything cached about `player`.
    pub async fn invalidate(&self, player: &str) {
        self.caches.invalidate(player).await;
    }

    /// Evict expired cache entries. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        self.caches.cleanup().await
    }

    /// Apply an envelope received on the data channel.
    ///
    /// Returns false for envelopes this node published itself; its own
    /// state was updated before they were sent. When envelopes for one
    /// player arrive out of order, the last one received wins per field.
    pub async fn apply(&self, envelope: &Envelope) -> bool {
        if envelope.source == self.node_id {
            return false;
        }
        let player = envelope.target.as_str();
        match &envelope.event {
            Event::Join { address } => {
                self.caches.proxy.put(player, envelope.source.clone()).await;
                self.caches.last_online.put(player, 0).await;
                self.caches.ip.put(player, *address).await;
                self.notifier.raise(NetworkEvent::Joined {
                    player: player.to_string(),
                });
            }
            Event::Leave { timestamp } => {
                let previous_server = self.caches.server.peek(player).await;
                self.caches.invalidate(player).await;
                self.caches.last_online.put(player, *timestamp).await;
                self.notifier.raise(NetworkEvent::Left {
                    player: player.to_string(),
                    previous_server,
                });
            }
            Event::ServerChange { server } => {
                let previous = self.caches.server.put(player, server.clone()).await;
                if previous.as_deref() == Some(server.as_str()) {
                    debug!(player, server = %server, "server change already applied");
                } else {
                    self.notifier.raise(NetworkEvent::ChangedServer {
                        player: player.to_string(),
                        previous,
                        server: server.clone(),
                    });
                }
            }
        }
        true
    }

    async fn load_field(
        &self,
        player: &str,
        name: &str,
    ) -> std::result::Result<Option<String>, StoreError> {
        self.store.hget(&keys::player(player), name).await
    }
}

/// A field we cannot parse is treated as absent.
fn unreadable<T>(player: &str, value: String) -> Option<T> {
    let err = StoreError::Malformed {
        key: keys::player(player),
        value,
    };
    warn!(player, %err, "ignoring unreadable player field");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{EventKind, Priority, Subscribers};
    use crate::session::SessionTable;
    use roster_store::{MemoryStore, WriteBatch};
    use tokio::sync::mpsc;

    struct Fixture {
        store: MemoryStore,
        sessions: Arc<SessionTable>,
        data: PlayerData,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let sessions = Arc::new(SessionTable::new());
        let (tx, events) = mpsc::unbounded_channel();
        let mut subscribers = Subscribers::new();
        for kind in [EventKind::Joined, EventKind::Left, EventKind::ChangedServer] {
            let tx = tx.clone();
            subscribers.subscribe(kind, Priority::Normal, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        let (notifier, _) = Notifier::spawn(subscribers);
        let data = PlayerData::new(
            "b1",
            Arc::new(store.clone()),
            sessions.clone(),
            &CacheConfig::default(),
            notifier,
        );
        Fixture {
            store,
            sessions,
            data,
            events,
        }
    }

    fn from_b2(player: &str, event: Event) -> Envelope {
        Envelope::new("b2", player, event)
    }

    #[tokio::test]
    async fn test_unseen_player_is_unknown() {
        let f = fixture();
        assert_eq!(f.data.server_of("nobody").await.unwrap(), None);
        assert_eq!(f.data.proxy_of("nobody").await.unwrap(), None);
        assert_eq!(f.data.ip_of("nobody").await.unwrap(), None);
        assert_eq!(f.data.last_online("nobody").await.unwrap(), NEVER_SEEN);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_unknown() {
        let f = fixture();
        f.store.set_offline(true);
        assert!(f.data.server_of("alice").await.is_err());
        assert!(f.data.last_online("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_local_session_wins_over_cache() {
        let f = fixture();
        f.sessions.connect("alice", "10.0.0.1".parse().unwrap()).await;
        f.sessions.switch_server("alice", "lobby").await;
        f.data
            .apply(&from_b2(
                "alice",
                Event::ServerChange {
                    server: "survival".to_string(),
                },
            ))
            .await;

        assert_eq!(f.data.server_of("alice").await.unwrap().as_deref(), Some("lobby"));
        assert_eq!(f.data.proxy_of("alice").await.unwrap().as_deref(), Some("b1"));
        assert_eq!(f.data.last_online("alice").await.unwrap(), 0);
        assert_eq!(f.store.hget_calls(), 0);
    }

    #[tokio::test]
    async fn test_loaded_fields_are_cached() {
        let f = fixture();
        let mut batch = WriteBatch::new();
        batch.hset_multiple(
            keys::player("bob"),
            [
                ("server".to_string(), "lobby".to_string()),
                ("ip".to_string(), "not-an-ip".to_string()),
                ("online".to_string(), "1700000000000".to_string()),
            ],
        );
        f.store.apply(batch).await.unwrap();

        assert_eq!(f.data.server_of("bob").await.unwrap().as_deref(), Some("lobby"));
        assert_eq!(f.data.server_of("bob").await.unwrap().as_deref(), Some("lobby"));
        assert_eq!(f.data.ip_of("bob").await.unwrap(), None);
        assert_eq!(f.data.last_online("bob").await.unwrap(), 1_700_000_000_000);
        // server once, ip once, online once
        assert_eq!(f.store.hget_calls(), 3);
    }

    #[tokio::test]
    async fn test_own_envelopes_are_ignored() {
        let f = fixture();
        let own = Envelope::new(
            "b1",
            "alice",
            Event::ServerChange {
                server: "lobby".to_string(),
            },
        );
        assert!(!f.data.apply(&own).await);
        assert_eq!(f.data.caches.server.peek("alice").await, None);
    }

    #[tokio::test]
    async fn test_join_and_leave_update_caches() {
        let mut f = fixture();
        let address: IpAddr = "10.0.0.9".parse().unwrap();

        assert!(f.data.apply(&from_b2("carol", Event::Join { address })).await);
        assert_eq!(f.data.proxy_of("carol").await.unwrap().as_deref(), Some("b2"));
        assert_eq!(f.data.ip_of("carol").await.unwrap(), Some(address));
        assert_eq!(f.data.last_online("carol").await.unwrap(), 0);

        f.data
            .apply(&from_b2(
                "carol",
                Event::ServerChange {
                    server: "lobby".to_string(),
                },
            ))
            .await;
        f.data
            .apply(&from_b2("carol", Event::Leave { timestamp: 42 }))
            .await;

        assert_eq!(f.data.caches.proxy.peek("carol").await, None);
        assert_eq!(f.data.caches.server.peek("carol").await, None);
        assert_eq!(f.data.caches.last_online.peek("carol").await, Some(42));
        assert_eq!(f.store.hget_calls(), 0);

        assert!(matches!(f.events.recv().await, Some(NetworkEvent::Joined { .. })));
        assert!(matches!(
            f.events.recv().await,
            Some(NetworkEvent::ChangedServer { previous: None, .. })
        ));
        assert_eq!(
            f.events.recv().await,
            Some(NetworkEvent::Left {
                player: "carol".to_string(),
                previous_server: Some("lobby".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_replayed_server_change_is_a_no_op() {
        let mut f = fixture();
        let change = from_b2(
            "dave",
            Event::ServerChange {
                server: "creative".to_string(),
            },
        );
        f.data.apply(&change).await;
        f.data.apply(&change).await;
        f.data
            .apply(&from_b2(
                "dave",
                Event::ServerChange {
                    server: "lobby".to_string(),
                },
            ))
            .await;

        assert_eq!(
            f.events.recv().await,
            Some(NetworkEvent::ChangedServer {
                player: "dave".to_string(),
                previous: None,
                server: "creative".to_string(),
            })
        );
        // the replay raised nothing
        assert_eq!(
            f.events.recv().await,
            Some(NetworkEvent::ChangedServer {
                player: "dave".to_string(),
                previous: Some("creative".to_string()),
                server: "lobby".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_reordered_join_and_leave_last_received_wins() {
        let f = fixture();
        let join = from_b2(
            "erin",
            Event::Join {
                address: "10.0.0.2".parse().unwrap(),
            },
        );
        let leave = from_b2("erin", Event::Leave { timestamp: 99 });

        f.data.apply(&join).await;
        f.data.apply(&leave).await;
        assert_eq!(f.data.last_online("erin").await.unwrap(), 99);

        f.data.apply(&leave).await;
        f.data.apply(&join).await;
        assert_eq!(f.data.last_online("erin").await.unwrap(), 0);
    }
}
