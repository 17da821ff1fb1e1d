//! Cluster membership and replication settings as seen by one node.
//!
//! The directory is owned by the node process and shared between the
//! dispatcher and the [`crate::replication::ReplicationManager`]. Every call
//! is atomic on its own; a caller that reads two fields in a row must
//! tolerate a CLUSTER_UPDATE landing between the reads. Use
//! [`ClusterDirectory::snapshot`] when a consistent view of several fields
//! is needed.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Address book entry for a cluster member. Identity is `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How many follower acknowledgments a leader waits for before answering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// Answer as soon as the fan-out is issued.
    #[default]
    Async,
    /// Wait for `rf - 1` followers.
    Sync,
    /// Wait for `min(k, rf - 1)` followers.
    #[serde(alias = "semi_sync")]
    SemiSync,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMode::Async => write!(f, "async"),
            ReplicationMode::Sync => write!(f, "sync"),
            ReplicationMode::SemiSync => write!(f, "semi-sync"),
        }
    }
}

/// Complete cluster-wide configuration. Replaced wholesale, never merged.
///
/// `rf <= nodes.len()` is not enforced here; the write path reports
/// NOT_ENOUGH_REPLICAS when it does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Known nodes in insertion order. Node ids are unique.
    pub nodes: Vec<NodeInfo>,
    pub leader_node_id: Option<String>,
    pub replication_mode: ReplicationMode,
    pub rf: usize,
    pub semi_sync_acks: usize,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            leader_node_id: None,
            replication_mode: ReplicationMode::Async,
            rf: 1,
            semi_sync_acks: 1,
            delay_min_ms: 0,
            delay_max_ms: 0,
        }
    }
}

impl ClusterConfig {
    /// Builds a config whose node list has duplicate ids collapsed: the last
    /// entry for an id wins but keeps the position of the first one.
    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        let mut config = Self::default();
        for node in nodes {
            upsert(&mut config.nodes, node);
        }
        config
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|node| node.node_id == node_id)
    }

    pub fn is_leader(&self, node_id: &str) -> bool {
        self.leader_node_id.as_deref() == Some(node_id)
    }

    /// Followers a write must reach besides the leader's own copy.
    pub fn followers_required(&self) -> usize {
        self.rf.saturating_sub(1)
    }
}

fn upsert(nodes: &mut Vec<NodeInfo>, node: NodeInfo) {
    match nodes.iter_mut().find(|existing| existing.node_id == node.node_id) {
        Some(existing) => *existing = node,
        None => nodes.push(node),
    }
}

/// Thread-safe holder of the node's [`ClusterConfig`].
///
/// All state sits behind one lock and is only handed out by value, so a
/// [`replace`](Self::replace) is observed either completely or not at all.
#[derive(Debug, Default)]
pub struct ClusterDirectory {
    inner: RwLock<ClusterConfig>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ClusterConfig {
        self.inner.read().clone()
    }

    /// Atomically supersedes nodes, leader, mode, rf, k and delay range.
    pub fn replace(&self, config: ClusterConfig) {
        *self.inner.write() = config;
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.read().nodes.clone()
    }

    pub fn node(&self, node_id: &str) -> Option<NodeInfo> {
        self.inner.read().node(node_id).cloned()
    }

    pub fn upsert_node(&self, node: NodeInfo) {
        upsert(&mut self.inner.write().nodes, node);
    }

    pub fn remove_node(&self, node_id: &str) -> Option<NodeInfo> {
        let mut inner = self.inner.write();
        let index = inner.nodes.iter().position(|node| node.node_id == node_id)?;
        Some(inner.nodes.remove(index))
    }

    pub fn leader_id(&self) -> Option<String> {
        self.inner.read().leader_node_id.clone()
    }

    pub fn set_leader_id(&self, leader: Option<String>) {
        self.inner.write().leader_node_id = leader;
    }

    pub fn replication_mode(&self) -> ReplicationMode {
        self.inner.read().replication_mode
    }

    pub fn set_replication_mode(&self, mode: ReplicationMode) {
        self.inner.write().replication_mode = mode;
    }

    pub fn rf(&self) -> usize {
        self.inner.read().rf
    }

    pub fn set_rf(&self, rf: usize) {
        self.inner.write().rf = rf;
    }

    pub fn semi_sync_acks(&self) -> usize {
        self.inner.read().semi_sync_acks
    }

    pub fn set_semi_sync_acks(&self, k: usize) {
        self.inner.write().semi_sync_acks = k;
    }

    /// Inclusive artificial follower-apply delay range in milliseconds.
    pub fn delay_range_ms(&self) -> (u64, u64) {
        let inner = self.inner.read();
        (inner.delay_min_ms, inner.delay_max_ms)
    }

    pub fn set_delay_range_ms(&self, min: u64, max: u64) {
        let mut inner = self.inner.write();
        inner.delay_min_ms = min;
        inner.delay_max_ms = max;
    }
}
