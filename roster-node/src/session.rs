use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use scc::HashMap;

/// A player connected to this node right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSession {
    pub address: IpAddr,
    /// Backend server, once the player has been routed to one.
    pub server: Option<String>,
}

/// The proxy runtime's view of its own connections. Always authoritative
/// for the players it knows about.
#[async_trait]
pub trait LocalSessions: Send + Sync + 'static {
    async fn session(&self, player: &str) -> Option<LocalSession>;

    /// Every player connected to this node.
    async fn players(&self) -> HashSet<String>;
}

/// Receives administrative commands sent over the command channels.
pub trait CommandSink: Send + Sync + 'static {
    /// `command` has already had its leading `/` removed.
    fn dispatch(&self, command: &str);
}

/// Command sink for hosts without a console: logs and drops.
pub struct LogCommands;

impl CommandSink for LogCommands {
    fn dispatch(&self, command: &str) {
        tracing::info!(command, "received command via pubsub (no console attached)");
    }
}

/// In-memory session registry fed by the proxy runtime.
pub struct SessionTable {
    sessions: HashMap<String, LocalSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Record a connection. Replaces any previous session for the name.
    pub async fn connect(&self, player: &str, address: IpAddr) {
        let session = LocalSession {
            address,
            server: None,
        };
        if let Err((key, session)) = self.sessions.insert_async(player.to_string(), session).await {
            let _ = self
                .sessions
                .update_async(&key, |_, existing| *existing = session)
                .await;
        }
    }

    /// Record a move to another backend. Returns false when the player is
    /// not connected here.
    pub async fn switch_server(&self, player: &str, server: &str) -> bool {
        self.sessions
            .update_async(player, |_, session| {
                session.server = Some(server.to_string());
            })
            .await
            .is_some()
    }

    /// Forget a connection. Returns the session that was removed.
    pub async fn disconnect(&self, player: &str) -> Option<LocalSession> {
        self.sessions.remove_async(player).await.map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalSessions for SessionTable {
    async fn session(&self, player: &str) -> Option<LocalSession> {
        self.sessions.read_async(player, |_, s| s.clone()).await
    }

    async fn players(&self) -> HashSet<String> {
        let mut players = HashSet::with_capacity(self.sessions.len());
        self.sessions
            .iter_async(|name, _| {
                players.insert(name.clone());
                true
            })
            .await;
        players
    }
}
