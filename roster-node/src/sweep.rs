//! Periodic integrity check between local sessions, this node's player set
//! and the rest of the fleet.
//!
//! One run:
//! 1. reclaims the players of every lagged node (never this one),
//! 2. drops members of our set that are no longer connected here, either
//!    because they moved to another active node or because a cleanup was
//!    lost,
//! 3. re-registers local players missing from our set.
//!
//! Every write of a run goes out in a single batch. A store failure aborts
//! the run; the next scheduled run starts over.

use std::collections::HashSet;
use std::sync::Arc;

use roster_store::{Store, WriteBatch, keys};
use tracing::{debug, info, warn};

use crate::data::PlayerData;
use crate::error::Result;
use crate::helpers::now_millis;
use crate::liveness::classify;
use crate::records::RecordWriter;
use crate::session::LocalSessions;

/// What one sweep repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub lagged_nodes: usize,
    /// Players cleaned up on behalf of lagged nodes.
    pub orphans_reclaimed: usize,
    /// Stale members of our set found on another active node.
    pub migrated: usize,
    /// Stale members of our set found nowhere.
    pub vanished: usize,
    /// Local players that were missing from our set.
    pub reregistered: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Sweeper {
    store: Arc<dyn Store>,
    sessions: Arc<dyn LocalSessions>,
    data: Arc<PlayerData>,
    writer: RecordWriter,
    threshold: i64,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<dyn LocalSessions>,
        data: Arc<PlayerData>,
        writer: RecordWriter,
        threshold: i64,
    ) -> Self {
        Self {
            store,
            sessions,
            data,
            writer,
            threshold,
        }
    }

    pub async fn run(&self) -> Result<SweepReport> {
        let node_id = self.writer.node_id().to_string();
        let now = self.store.time().await?;
        let heartbeats = self.store.hgetall(keys::HEARTBEATS).await?;
        let liveness = classify(&heartbeats, now, self.threshold);

        let mut report = SweepReport::default();
        let mut batch = WriteBatch::new();
        let mut cleaned = Vec::new();
        let stamp = now_millis();

        let other_active: Vec<String> = liveness
            .active
            .iter()
            .filter(|id| **id != node_id)
            .map(|id| keys::users_online(id))
            .collect();
        let mut elsewhere: Option<HashSet<String>> = None;

        for (lagged, behind) in &liveness.lagged {
            if *lagged == node_id {
                continue;
            }
            report.lagged_nodes += 1;
            let set = keys::users_online(lagged);
            let members = self.store.smembers(&set).await?;
            warn!(
                node = %lagged,
                behind_secs = behind,
                players = members.len(),
                "reclaiming players of lagged proxy"
            );

            let fleet = self.fleet(&mut elsewhere, &other_active).await?;
            for player in &members {
                if fleet.contains(player) {
                    // Already reconnected elsewhere; only its old membership goes.
                    report.migrated += 1;
                    continue;
                }
                self.writer.clean_up(&mut batch, lagged, player, stamp);
                cleaned.push(player.clone());
                report.orphans_reclaimed += 1;
            }
            batch.del(set).hdel(keys::HEARTBEATS, [lagged.as_str()]);
        }

        let own_set = keys::users_online(&node_id);
        let recorded = self.store.smembers(&own_set).await?;
        let local = self.sessions.players().await;

        let mut stale: Vec<&String> = recorded.difference(&local).collect();
        stale.sort();
        if !stale.is_empty() {
            let fleet = self.fleet(&mut elsewhere, &other_active).await?;
            for player in stale {
                if fleet.contains(player) {
                    debug!(player = %player, "player moved to another proxy");
                    batch.srem(own_set.as_str(), player.as_str());
                    report.migrated += 1;
                } else {
                    warn!(
                        player = %player,
                        "player recorded here but connected nowhere; cleaning up"
                    );
                    self.writer.clean_up(&mut batch, &node_id, player, stamp);
                    cleaned.push(player.clone());
                    report.vanished += 1;
                }
            }
        }

        let mut missing: Vec<&String> = local.difference(&recorded).collect();
        missing.sort();
        for player in missing {
            // Gone between the two snapshots: the disconnect path handles it.
            let Some(session) = self.sessions.session(player).await else {
                continue;
            };
            warn!(player = %player, "local player missing from shared set; re-registering");
            self.writer.register(
                &mut batch,
                player,
                session.address,
                session.server.as_deref(),
                true,
            );
            report.reregistered += 1;
        }

        if !batch.is_empty() {
            self.store.apply(batch).await?;
        }
        for player in &cleaned {
            self.data.invalidate(player).await;
        }

        if report.is_empty() {
            debug!("integrity check found nothing to repair");
        } else {
            info!(?report, "integrity check repaired shared state");
        }
        Ok(report)
    }

    /// Union of the other active nodes' sets, read at most once per run.
    async fn fleet<'a>(
        &self,
        cached: &'a mut Option<HashSet<String>>,
        other_active: &[String],
    ) -> Result<&'a HashSet<String>> {
        if cached.is_none() {
            *cached = Some(self.store.sunion(other_active).await?);
        }
        Ok(cached.get_or_insert_with(HashSet::new))
    }
}
