//! Heartbeats and the active/lagged node split.
//!
//! All timestamps here are in the store's clock, so nodes with drifting
//! local clocks still agree on who is alive.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use roster_store::{Store, keys};
use tracing::{debug, error, warn};

use crate::error::Result;

/// Nodes split by heartbeat age at one instant of store time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    pub now: i64,
    pub active: BTreeSet<String>,
    /// Lagged node id -> seconds since its last heartbeat.
    pub lagged: HashMap<String, i64>,
}

/// Split a heartbeat table into active and lagged nodes.
///
/// A node is active while `now - stamp <= threshold`. Entries that do not
/// parse as integers land in neither set.
pub fn classify(heartbeats: &HashMap<String, String>, now: i64, threshold: i64) -> Liveness {
    let mut liveness = Liveness {
        now,
        ..Liveness::default()
    };
    for (node, stamp) in heartbeats {
        let Ok(stamp) = stamp.parse::<i64>() else {
            debug!(node = %node, stamp = %stamp, "ignoring unparseable heartbeat");
            continue;
        };
        let behind = now - stamp;
        if behind <= threshold {
            liveness.active.insert(node.clone());
        } else {
            liveness.lagged.insert(node.clone(), behind);
        }
    }
    liveness
}

/// Rate-limits lag warnings: `arm` is true on the first call and then on
/// every `every`th call.
#[derive(Debug)]
pub struct WarningGate {
    countdown: AtomicI32,
    every: i32,
}

impl WarningGate {
    pub fn new(every: i32) -> Self {
        Self {
            countdown: AtomicI32::new(0),
            every: every.max(1),
        }
    }

    pub fn arm(&self) -> bool {
        let left = self.countdown.fetch_sub(1, Ordering::SeqCst) - 1;
        if left <= 0 {
            self.countdown.store(self.every, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

pub struct LivenessTracker {
    store: Arc<dyn Store>,
    node_id: String,
    threshold: i64,
    gate: WarningGate,
}

impl LivenessTracker {
    pub fn new(store: Arc<dyn Store>, node_id: &str, threshold: i64, warn_every: i32) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            threshold,
            gate: WarningGate::new(warn_every),
        }
    }

    /// Stamp this node's heartbeat with the store's current time.
    pub async fn beat(&self) -> Result<i64> {
        let now = self.store.time().await?;
        self.store
            .hset(keys::HEARTBEATS, &self.node_id, &now.to_string())
            .await?;
        Ok(now)
    }

    /// Read the heartbeat table and classify it against store time.
    pub async fn check(&self) -> Result<Liveness> {
        let now = self.store.time().await?;
        let heartbeats = self.store.hgetall(keys::HEARTBEATS).await?;
        Ok(classify(&heartbeats, now, self.threshold))
    }

    /// Active node ids for everyday queries.
    ///
    /// Logs lagging nodes every Nth call. When the store is unreachable this
    /// degrades to just this node.
    pub async fn active_nodes(&self) -> BTreeSet<String> {
        match self.check().await {
            Ok(liveness) => {
                if !liveness.lagged.is_empty() && self.gate.arm() {
                    for (node, behind) in &liveness.lagged {
                        warn!(
                            node = %node,
                            behind_secs = behind,
                            "proxy is lagging behind (clock not synchronized or node down?)"
                        );
                    }
                }
                liveness.active
            }
            Err(err) => {
                error!(%err, "unable to fetch active proxy ids");
                BTreeSet::from([self.node_id.clone()])
            }
        }
    }
}
