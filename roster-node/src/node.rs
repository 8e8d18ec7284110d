//! The node handle: startup, lifecycle hooks, fleet queries and shutdown.
//!
//! Everything a node needs is passed in once through [`NodeContext`]; the
//! returned [`Node`] is a cheap clone handed to whatever drives it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use roster_store::{ChannelMessage, Store, Subscription, WriteBatch, keys};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::data::PlayerData;
use crate::error::{NodeError, Result};
use crate::helpers::{command_body, now_millis};
use crate::liveness::LivenessTracker;
use crate::notify::{NetworkEvent, Notifier, Subscribers};
use crate::protocol::{ALL_SERVERS, Channels, Envelope, Event};
use crate::records::RecordWriter;
use crate::session::{CommandSink, LocalSessions};
use crate::sweep::{SweepReport, Sweeper};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Collaborators supplied by the host.
pub struct NodeContext {
    pub config: NodeConfig,
    pub store: Arc<dyn Store>,
    pub sessions: Arc<dyn LocalSessions>,
    pub commands: Arc<dyn CommandSink>,
    pub subscribers: Subscribers,
}

/// Outcome of the login admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginDecision {
    Allowed,
    /// The player is already attached to an active node.
    Denied,
}

/// Fleet view refreshed by every heartbeat.
#[derive(Debug, Default)]
struct Snapshot {
    active: BTreeSet<String>,
    player_count: usize,
}

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    /// Listeners for channels registered by the host, by channel name.
    extra: HashMap<String, JoinHandle<()>>,
    jobs: Vec<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
}

struct Shared {
    config: NodeConfig,
    store: Arc<dyn Store>,
    sessions: Arc<dyn LocalSessions>,
    commands: Arc<dyn CommandSink>,
    channels: Channels,
    writer: RecordWriter,
    data: Arc<PlayerData>,
    notifier: Notifier,
    liveness: LivenessTracker,
    sweeper: Sweeper,
    snapshot: RwLock<Snapshot>,
    tasks: Mutex<Tasks>,
}

#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    /// Join the fleet.
    ///
    /// Fails when the store is unreachable or another live instance already
    /// uses this node id. On success the heartbeat has been written and the
    /// subscription is open.
    pub async fn start(ctx: NodeContext) -> Result<Self> {
        let NodeContext {
            config,
            store,
            sessions,
            commands,
            subscribers,
        } = ctx;
        let node_id = config.node_id.clone();

        store
            .ping()
            .await
            .map_err(|e| NodeError::Config(format!("store unreachable: {e}")))?;
        check_impostor(store.as_ref(), &config).await?;

        let channels = Channels::new(&config.channel_prefix, &node_id);
        let subscription = store.subscribe(&channels.subscribed()).await?;

        let (notifier, notifier_task) = Notifier::spawn(subscribers);
        let data = Arc::new(PlayerData::new(
            &node_id,
            Arc::clone(&store),
            Arc::clone(&sessions),
            &config.cache,
            notifier.clone(),
        ));
        let writer = RecordWriter::new(&node_id, channels.clone());
        let liveness = LivenessTracker::new(
            Arc::clone(&store),
            &node_id,
            config.liveness_threshold,
            config.lag_warning_every,
        );
        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&data),
            writer.clone(),
            config.liveness_threshold,
        );

        let node = Self {
            shared: Arc::new(Shared {
                config,
                store,
                sessions,
                commands,
                channels,
                writer,
                data,
                notifier,
                liveness,
                sweeper,
                snapshot: RwLock::new(Snapshot::default()),
                tasks: Mutex::new(Tasks::default()),
            }),
        };

        if let Err(err) = node.shared.liveness.beat().await {
            notifier_task.abort();
            return Err(err);
        }
        node.refresh_snapshot().await;

        let listener = tokio::spawn(listen(
            node.clone(),
            node.shared.channels.subscribed(),
            subscription,
        ));
        let jobs = node.spawn_jobs();
        {
            let mut tasks = node.tasks();
            tasks.listener = Some(listener);
            tasks.jobs = jobs;
            tasks.notifier = Some(notifier_task);
        }

        info!(node = %node_id, "joined the fleet");
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.shared.config.node_id
    }

    pub fn channels(&self) -> &Channels {
        &self.shared.channels
    }

    /// Leave the fleet cleanly.
    ///
    /// Stops the listener, then the periodic jobs, then removes this node's
    /// heartbeat and players from the store, then closes the store.
    pub async fn shutdown(&self) {
        let (listener, extra, jobs, notifier) = {
            let mut tasks = self.tasks();
            (
                tasks.listener.take(),
                std::mem::take(&mut tasks.extra),
                std::mem::take(&mut tasks.jobs),
                tasks.notifier.take(),
            )
        };
        if let Some(listener) = listener {
            listener.abort();
        }
        for listener in extra.into_values() {
            listener.abort();
        }
        for job in jobs {
            job.abort();
        }

        if let Err(err) = self.leave_fleet().await {
            error!(%err, "unable to remove this proxy from the shared store");
        }
        self.shared.store.close().await;
        if let Some(notifier) = notifier {
            notifier.abort();
        }
        info!(node = %self.node_id(), "left the fleet");
    }

    /// Also listen on `channels`. Every non-blank message on them is raised
    /// as [`NetworkEvent::Message`]. Channels already listened on are
    /// skipped.
    pub async fn register_channels(&self, channels: &[&str]) -> Result<()> {
        let fixed = self.shared.channels.subscribed();
        for &channel in channels {
            let heard =
                fixed.iter().any(|c| c == channel) || self.tasks().extra.contains_key(channel);
            if heard {
                continue;
            }
            let names = vec![channel.to_string()];
            let subscription = self.shared.store.subscribe(&names).await?;
            let listener = tokio::spawn(listen(self.clone(), names, subscription));
            if let Some(previous) = self.tasks().extra.insert(channel.to_string(), listener) {
                previous.abort();
            }
            debug!(channel, "listening on extra channel");
        }
        Ok(())
    }

    /// Stop listening on channels added with [`Node::register_channels`].
    pub fn unregister_channels(&self, channels: &[&str]) {
        let mut tasks = self.tasks();
        for &channel in channels {
            if let Some(listener) = tasks.extra.remove(channel) {
                listener.abort();
                debug!(channel, "stopped listening on extra channel");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle hooks
    // ---------------------------------------------------------------------

    /// Admission check for a connecting player.
    ///
    /// Denies the login when the player already sits in an active node's
    /// set. Otherwise writes the player record; nothing is published until
    /// [`Node::on_post_login`].
    pub async fn on_login(&self, player: &str, address: IpAddr) -> Result<LoginDecision> {
        let active = self.active_node_ids();
        for node in &active {
            if self
                .shared
                .store
                .sismember(&keys::users_online(node), player)
                .await?
            {
                info!(player, node = %node, "denying login, already online");
                return Ok(LoginDecision::Denied);
            }
        }

        let mut batch = WriteBatch::new();
        self.shared
            .writer
            .register(&mut batch, player, address, None, false);
        self.shared.store.apply(batch).await?;
        Ok(LoginDecision::Allowed)
    }

    /// Announce a completed login to the fleet.
    pub fn on_post_login(&self, player: &str, address: IpAddr) -> JoinHandle<Result<()>> {
        let node = self.clone();
        let player = player.to_string();
        tokio::spawn(async move {
            node.shared.data.invalidate(&player).await;
            let envelope = Envelope::new(node.node_id(), player.as_str(), Event::Join { address });
            node.shared
                .store
                .publish(&node.shared.channels.data, &envelope.encode())
                .await
                .map_err(|err| {
                    error!(player = %player, %err, "unable to announce join");
                    NodeError::from(err)
                })
        })
    }

    /// Whether `player` is in this node's set in the shared store.
    pub async fn holds_player(&self, player: &str) -> Result<bool> {
        Ok(self
            .shared
            .store
            .sismember(&keys::users_online(self.node_id()), player)
            .await?)
    }

    pub fn on_disconnect(&self, player: &str) -> JoinHandle<Result<()>> {
        let node = self.clone();
        let player = player.to_string();
        tokio::spawn(async move {
            node.shared.data.invalidate(&player).await;
            let mut batch = WriteBatch::new();
            node.shared
                .writer
                .clean_up(&mut batch, node.node_id(), &player, now_millis());
            node.shared.store.apply(batch).await.map_err(|err| {
                error!(player = %player, %err, "unable to record disconnect");
                NodeError::from(err)
            })
        })
    }

    /// Record a backend switch. The write lands before the announcement.
    pub fn on_server_switch(&self, player: &str, server: &str) -> JoinHandle<Result<()>> {
        let node = self.clone();
        let player = player.to_string();
        let server = server.to_string();
        tokio::spawn(async move {
            let mut batch = WriteBatch::new();
            node.shared.writer.switch_server(&mut batch, &player, &server);
            node.shared.store.apply(batch).await.map_err(|err| {
                error!(player = %player, %err, "unable to record server switch");
                NodeError::from(err)
            })
        })
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Active node ids as of the last heartbeat.
    pub fn active_node_ids(&self) -> Vec<String> {
        self.snapshot().active.iter().cloned().collect()
    }

    /// Fleet player count as of the last heartbeat.
    pub fn player_count(&self) -> usize {
        self.snapshot().player_count
    }

    /// Every player on an active node. Degrades to local players when the
    /// store is unreachable.
    pub async fn players(&self) -> HashSet<String> {
        let sets: Vec<String> = self
            .active_node_ids()
            .iter()
            .map(|id| keys::users_online(id))
            .collect();
        match self.shared.store.sunion(&sets).await {
            Ok(players) => players,
            Err(err) => {
                error!(%err, "unable to get fleet players, falling back to local players");
                self.shared.sessions.players().await
            }
        }
    }

    pub async fn players_on_proxy(&self, node_id: &str) -> Result<HashSet<String>> {
        let known = self.snapshot().active.contains(node_id);
        if !known {
            return Err(NodeError::UnknownProxy(node_id.to_string()));
        }
        Ok(self
            .shared
            .store
            .smembers(&keys::users_online(node_id))
            .await?)
    }

    /// Backend server -> players on it, for every player whose server is
    /// known.
    pub async fn server_to_players(&self) -> Result<HashMap<String, HashSet<String>>> {
        let mut servers: HashMap<String, HashSet<String>> = HashMap::new();
        for player in self.players().await {
            if let Some(server) = self.shared.data.server_of(&player).await? {
                servers.entry(server).or_default().insert(player);
            }
        }
        Ok(servers)
    }

    pub async fn players_on_server(&self, server: &str) -> Result<HashSet<String>> {
        Ok(self
            .server_to_players()
            .await?
            .remove(server)
            .unwrap_or_default())
    }

    pub async fn server_of(&self, player: &str) -> Result<Option<String>> {
        self.shared.data.server_of(player).await
    }

    pub async fn proxy_of(&self, player: &str) -> Result<Option<String>> {
        self.shared.data.proxy_of(player).await
    }

    pub async fn ip_of(&self, player: &str) -> Result<Option<IpAddr>> {
        self.shared.data.ip_of(player).await
    }

    /// See [`PlayerData::last_online`].
    pub async fn last_online(&self, player: &str) -> Result<i64> {
        self.shared.data.last_online(player).await
    }

    /// Send an administrative command to one active node, or to every node
    /// with [`ALL_SERVERS`].
    pub async fn send_proxy_command(&self, target: &str, command: &str) -> Result<()> {
        let known = target == ALL_SERVERS || self.snapshot().active.contains(target);
        if !known {
            return Err(NodeError::UnknownProxy(target.to_string()));
        }
        self.send_channel_message(&self.shared.channels.command(target), command)
            .await
    }

    pub async fn send_channel_message(&self, channel: &str, message: &str) -> Result<()> {
        self.shared.store.publish(channel, message).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Periodic work
    // ---------------------------------------------------------------------

    /// Write a heartbeat and refresh the fleet snapshot.
    pub async fn heartbeat(&self) {
        if let Err(err) = self.shared.liveness.beat().await {
            error!(%err, "unable to update heartbeat");
        }
        self.refresh_snapshot().await;
    }

    /// Run one integrity check now.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.shared.sweeper.run().await
    }

    async fn refresh_snapshot(&self) {
        let active = self.shared.liveness.active_nodes().await;
        let mut count = 0;
        let mut failed = false;
        for node in &active {
            match self.shared.store.scard(&keys::users_online(node)).await {
                Ok(n) => count += n,
                Err(err) => {
                    error!(%err, "unable to count fleet players");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            count = self.shared.sessions.players().await.len();
        }

        let mut snapshot = self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        snapshot.active = active;
        snapshot.player_count = count;
    }

    fn spawn_jobs(&self) -> Vec<JoinHandle<()>> {
        let config = &self.shared.config;
        vec![
            self.every(config.heartbeat_interval, |node| async move {
                node.heartbeat().await;
            }),
            self.every(config.cache_cleanup_interval, |node| async move {
                node.shared.data.cleanup().await;
            }),
            self.every(config.sweep_interval, |node| async move {
                if let Err(err) = node.sweep().await {
                    error!(%err, "integrity check aborted");
                }
            }),
        ]
    }

    /// Run `job` every `period`, first after one full period.
    fn every<F, Fut>(&self, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Node) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job(node.clone()).await;
            }
        })
    }

    async fn leave_fleet(&self) -> Result<()> {
        let node_id = self.node_id();
        let players = self
            .shared
            .store
            .smembers(&keys::users_online(node_id))
            .await?;
        let stamp = now_millis();
        let mut batch = WriteBatch::new();
        batch.hdel(keys::HEARTBEATS, [node_id]);
        for player in &players {
            self.shared
                .writer
                .clean_up(&mut batch, node_id, player, stamp);
        }
        self.shared.store.apply(batch).await?;
        debug!(players = players.len(), "cleaned up own players");
        Ok(())
    }

    async fn handle_message(&self, message: ChannelMessage) {
        let payload = message.payload.trim();
        if payload.is_empty() {
            return;
        }
        self.shared.notifier.raise(NetworkEvent::Message {
            channel: message.channel.clone(),
            payload: message.payload.clone(),
        });
        let channels = &self.shared.channels;
        if channels.is_command(&message.channel) {
            let command = command_body(payload);
            info!(command, channel = %message.channel, "invoking command via pubsub");
            self.shared.commands.dispatch(command);
        } else if message.channel == channels.data {
            match Envelope::decode(payload) {
                Ok(envelope) => {
                    self.shared.data.apply(&envelope).await;
                }
                Err(err) => warn!(%err, "dropping malformed envelope"),
            }
        }
    }

    fn snapshot(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Refuse to start while another live instance holds our node id, unless a
/// crash marker says the previous holder was us.
async fn check_impostor(store: &dyn Store, config: &NodeConfig) -> Result<()> {
    let now = store.time().await?;
    let Some(stamp) = store.hget(keys::HEARTBEATS, &config.node_id).await? else {
        return Ok(());
    };
    let Ok(stamp) = stamp.parse::<i64>() else {
        return Ok(());
    };
    if now - stamp >= config.impostor_window {
        return Ok(());
    }

    if let Some(marker) = &config.crash_marker {
        if tokio::fs::try_exists(marker).await.unwrap_or(false) {
            warn!(
                node = %config.node_id,
                "recent heartbeat for this node id, but restarting after a crash"
            );
            if let Err(err) = tokio::fs::remove_file(marker).await {
                warn!(%err, path = %marker.display(), "unable to remove crash marker");
            }
            return Ok(());
        }
    }
    Err(NodeError::Impostor(config.node_id.clone()))
}

/// Hold a subscription on `channels` until aborted, processing messages in
/// the order received. Resubscribes after a delay if the stream ends.
async fn listen(node: Node, channels: Vec<String>, subscription: Subscription) {
    let mut subscription = Some(subscription);
    loop {
        let stream = match subscription.take() {
            Some(stream) => Some(stream),
            None => match node.shared.store.subscribe(&channels).await {
                Ok(stream) => {
                    info!(?channels, "pubsub subscription restored");
                    Some(stream)
                }
                Err(err) => {
                    error!(%err, ?channels, "unable to subscribe to pubsub channels");
                    None
                }
            },
        };
        if let Some(mut stream) = stream {
            while let Some(message) = stream.next().await {
                node.handle_message(message).await;
            }
            warn!(?channels, "pubsub subscription ended");
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
