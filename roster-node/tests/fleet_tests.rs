//! Several nodes sharing one in-memory store.

use roster_node::config::NodeConfig;
use roster_node::error::NodeError;
use roster_node::notify::{EventKind, NetworkEvent, Priority, Subscribers};
use roster_node::session::{CommandSink, SessionTable};
use roster_node::{LoginDecision, Node, NodeContext};
use roster_store::{MemoryStore, Store, keys};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HOUR: Duration = Duration::from_secs(3600);

struct Recorder(mpsc::UnboundedSender<String>);

impl CommandSink for Recorder {
    fn dispatch(&self, command: &str) {
        let _ = self.0.send(command.to_string());
    }
}

struct TestNode {
    node: Node,
    sessions: Arc<SessionTable>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    /// Raw channel messages, kept apart from player events.
    messages: mpsc::UnboundedReceiver<NetworkEvent>,
    commands: mpsc::UnboundedReceiver<String>,
}

/// Periodic jobs are pushed out of the way; tests drive them by hand.
fn quiet_config(id: &str) -> NodeConfig {
    let mut config = NodeConfig::new(id);
    config.heartbeat_interval = HOUR;
    config.sweep_interval = HOUR;
    config.cache_cleanup_interval = HOUR;
    config
}

async fn try_start(store: &MemoryStore, config: NodeConfig) -> Result<TestNode, NodeError> {
    let (event_tx, events) = mpsc::unbounded_channel();
    let mut subscribers = Subscribers::new();
    for kind in [EventKind::Joined, EventKind::Left, EventKind::ChangedServer] {
        let tx = event_tx.clone();
        subscribers.subscribe(kind, Priority::Normal, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    let (message_tx, messages) = mpsc::unbounded_channel();
    subscribers.subscribe(EventKind::Message, Priority::Normal, move |event| {
        let _ = message_tx.send(event.clone());
    });
    let (command_tx, commands) = mpsc::unbounded_channel();
    let sessions = Arc::new(SessionTable::new());

    let node = Node::start(NodeContext {
        config,
        store: Arc::new(store.connection()),
        sessions: sessions.clone(),
        commands: Arc::new(Recorder(command_tx)),
        subscribers,
    })
    .await?;
    Ok(TestNode {
        node,
        sessions,
        events,
        messages,
        commands,
    })
}

async fn start(store: &MemoryStore, id: &str) -> TestNode {
    try_start(store, quiet_config(id))
        .await
        .expect("node should start")
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Log a player in on `t` the way the proxy runtime would.
async fn join(t: &TestNode, player: &str, address: &str) {
    let decision = t.node.on_login(player, ip(address)).await.unwrap();
    assert_eq!(decision, LoginDecision::Allowed);
    t.sessions.connect(player, ip(address)).await;
    t.node.on_post_login(player, ip(address)).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_join_switch_leave_propagate() {
    let store = MemoryStore::new();
    let a = start(&store, "a").await;
    let mut b = start(&store, "b").await;

    join(&a, "alice", "10.0.0.1").await;
    assert_eq!(
        next(&mut b.events).await,
        NetworkEvent::Joined {
            player: "alice".to_string()
        }
    );
    let reads = store.hget_calls();
    assert_eq!(b.node.proxy_of("alice").await.unwrap().as_deref(), Some("a"));
    assert_eq!(b.node.ip_of("alice").await.unwrap(), Some(ip("10.0.0.1")));
    assert_eq!(b.node.last_online("alice").await.unwrap(), 0);
    assert_eq!(store.hget_calls(), reads);

    a.sessions.switch_server("alice", "lobby").await;
    a.node.on_server_switch("alice", "lobby").await.unwrap().unwrap();
    assert_eq!(
        next(&mut b.events).await,
        NetworkEvent::ChangedServer {
            player: "alice".to_string(),
            previous: None,
            server: "lobby".to_string(),
        }
    );
    assert_eq!(b.node.server_of("alice").await.unwrap().as_deref(), Some("lobby"));

    a.sessions.disconnect("alice").await;
    a.node.on_disconnect("alice").await.unwrap().unwrap();
    assert_eq!(
        next(&mut b.events).await,
        NetworkEvent::Left {
            player: "alice".to_string(),
            previous_server: Some("lobby".to_string()),
        }
    );
    assert!(b.node.last_online("alice").await.unwrap() > 0);
    assert_eq!(b.node.proxy_of("alice").await.unwrap(), None);
}

#[tokio::test]
async fn test_own_events_do_not_notify() {
    let store = MemoryStore::new();
    let mut a = start(&store, "a").await;

    join(&a, "alice", "10.0.0.1").await;

    let nothing = tokio::time::timeout(Duration::from_millis(200), a.events.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_login_denied_on_second_proxy() {
    let store = MemoryStore::new();
    let a = start(&store, "a").await;
    let b = start(&store, "b").await;

    join(&a, "alice", "10.0.0.1").await;

    let decision = b.node.on_login("alice", ip("10.0.0.2")).await.unwrap();
    assert_eq!(decision, LoginDecision::Denied);
    assert!(
        !store
            .sismember(&keys::users_online("b"), "alice")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_fleet_queries() {
    let store = MemoryStore::new();
    let a = start(&store, "a").await;
    let b = start(&store, "b").await;
    a.node.heartbeat().await;

    join(&a, "alice", "10.0.0.1").await;
    join(&b, "bob", "10.0.0.2").await;
    a.sessions.switch_server("alice", "lobby").await;
    a.node.on_server_switch("alice", "lobby").await.unwrap().unwrap();
    a.node.heartbeat().await;

    assert_eq!(a.node.active_node_ids(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(a.node.player_count(), 2);
    assert_eq!(a.node.players().await.len(), 2);
    assert!(a.node.players_on_proxy("b").await.unwrap().contains("bob"));
    assert!(matches!(
        a.node.players_on_proxy("c").await,
        Err(NodeError::UnknownProxy(_))
    ));

    let lobby = a.node.players_on_server("lobby").await.unwrap();
    assert_eq!(lobby.len(), 1);
    assert!(lobby.contains("alice"));
}

#[tokio::test]
async fn test_commands_reach_target_proxy() {
    let store = MemoryStore::new();
    let a = start(&store, "a").await;
    let mut b = start(&store, "b").await;
    a.node.heartbeat().await;

    a.node.send_proxy_command("b", "/alert hello").await.unwrap();
    assert_eq!(next(&mut b.commands).await, "alert hello");

    a.node.send_proxy_command("allservers", "glist").await.unwrap();
    assert_eq!(next(&mut b.commands).await, "glist");

    assert!(matches!(
        a.node.send_proxy_command("nope", "glist").await,
        Err(NodeError::UnknownProxy(_))
    ));
}

#[tokio::test]
async fn test_blank_and_malformed_messages_are_dropped() {
    let store = MemoryStore::new();
    let mut a = start(&store, "a").await;

    store.publish("redisbungee-a", "   ").await.unwrap();
    store.publish("redisbungee-data", "{not json").await.unwrap();
    store
        .publish(
            "redisbungee-data",
            r#"{"source":"z","action":"TELEPORT","target":"x","payload":{}}"#,
        )
        .await
        .unwrap();
    store.publish("redisbungee-a", "glist").await.unwrap();

    // The listener survived and kept order
    assert_eq!(next(&mut a.commands).await, "glist");
}

fn message(channel: &str, payload: &str) -> NetworkEvent {
    NetworkEvent::Message {
        channel: channel.to_string(),
        payload: payload.to_string(),
    }
}

#[tokio::test]
async fn test_registered_channels_round_trip() {
    let store = MemoryStore::new();
    let a = start(&store, "a").await;
    let mut b = start(&store, "b").await;

    b.node.register_channels(&["lobby-chat"]).await.unwrap();
    a.node.send_channel_message("lobby-chat", "hello").await.unwrap();
    assert_eq!(next(&mut b.messages).await, message("lobby-chat", "hello"));

    // Fixed channels are raised as messages too
    a.node.send_proxy_command("allservers", "glist").await.unwrap();
    assert_eq!(
        next(&mut b.messages).await,
        message("redisbungee-allservers", "glist")
    );

    b.node.unregister_channels(&["lobby-chat"]);
    a.node.send_channel_message("lobby-chat", "anyone?").await.unwrap();
    a.node.send_channel_message("redisbungee-allservers", "marker").await.unwrap();
    assert_eq!(
        next(&mut b.messages).await,
        message("redisbungee-allservers", "marker")
    );
}

#[tokio::test]
async fn test_registering_a_fixed_channel_does_not_duplicate() {
    let store = MemoryStore::new();
    let mut a = start(&store, "a").await;

    a.node
        .register_channels(&["redisbungee-allservers", "trade"])
        .await
        .unwrap();
    store.publish("redisbungee-allservers", "glist").await.unwrap();
    assert_eq!(
        next(&mut a.messages).await,
        message("redisbungee-allservers", "glist")
    );
    store.publish("trade", "offer").await.unwrap();
    assert_eq!(next(&mut a.messages).await, message("trade", "offer"));
    let nothing = tokio::time::timeout(Duration::from_millis(200), a.messages.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_lagged_proxy_is_reclaimed() {
    let store = MemoryStore::new();
    store.set_time(1_700_000_000);
    let c = start(&store, "c").await;
    let b = start(&store, "b").await;
    join(&c, "carol", "10.0.0.3").await;

    // c stops beating for 35 seconds
    store.advance(35);
    b.node.heartbeat().await;
    assert_eq!(b.node.active_node_ids(), vec!["b".to_string()]);

    let report = b.node.sweep().await.unwrap();
    assert_eq!(report.lagged_nodes, 1);
    assert_eq!(report.orphans_reclaimed, 1);

    assert!(store.smembers(&keys::users_online("c")).await.unwrap().is_empty());
    let record = store.hgetall(&keys::player("carol")).await.unwrap();
    assert!(!record.contains_key("proxy"));
    assert!(!record.contains_key("ip"));
    assert_eq!(store.hget(keys::HEARTBEATS, "c").await.unwrap(), None);
}

#[tokio::test]
async fn test_shutdown_removes_node_from_fleet() {
    let store = MemoryStore::new();
    let a = start(&store, "a").await;
    let mut b = start(&store, "b").await;

    join(&a, "alice", "10.0.0.1").await;
    assert!(matches!(next(&mut b.events).await, NetworkEvent::Joined { .. }));

    a.node.shutdown().await;

    assert!(matches!(next(&mut b.events).await, NetworkEvent::Left { .. }));
    assert_eq!(store.hget(keys::HEARTBEATS, "a").await.unwrap(), None);
    assert!(store.smembers(&keys::users_online("a")).await.unwrap().is_empty());

    // a's store handle is closed, b's is not
    assert!(a.node.proxy_of("zed").await.is_err());
    assert_eq!(b.node.proxy_of("zed").await.unwrap(), None);
}

#[tokio::test]
async fn test_duplicate_node_id_is_refused() {
    let store = MemoryStore::new();
    let _a = start(&store, "a").await;

    let result = try_start(&store, quiet_config("a")).await;
    assert!(matches!(result, Err(NodeError::Impostor(_))));
}

#[tokio::test]
async fn test_crash_marker_allows_restart_once() {
    let store = MemoryStore::new();
    let _a = start(&store, "a").await;

    let marker = std::env::temp_dir().join(format!("roster-crash-{}", std::process::id()));
    std::fs::write(&marker, b"").unwrap();
    let mut config = quiet_config("a");
    config.crash_marker = Some(marker.clone());

    assert!(try_start(&store, config.clone()).await.is_ok());
    assert!(!marker.exists());

    assert!(matches!(
        try_start(&store, config).await,
        Err(NodeError::Impostor(_))
    ));
}

#[tokio::test]
async fn test_unreachable_store_fails_startup() {
    let store = MemoryStore::new();
    store.set_offline(true);

    let result = try_start(&store, quiet_config("a")).await;
    assert!(matches!(result, Err(NodeError::Config(_))));
}
