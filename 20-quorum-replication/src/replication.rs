//! Leader-side replication: sequencing, fan-out, quorum waits and retries.
//!
//! # Write path
//!
//! 1. The leader checks it is the configured leader (NOT_LEADER otherwise,
//!    nothing mutated).
//! 2. It takes the next sequence number and applies the write to its own
//!    store, so the leader's copy is always current before replication.
//! 3. It checks that `rf` is satisfiable with the known followers
//!    (NOT_ENOUGH_REPLICAS otherwise, nothing sent).
//! 4. It records an [`Operation`] and sends one REPL_PUT / REPL_DELETE to
//!    every follower.
//! 5. Depending on the mode it answers at once (`async`) or waits for
//!    `rf - 1` (`sync`) or `min(k, rf - 1)` (`semi-sync`) acknowledgments,
//!    up to the request timeout.
//!
//! # Background pass
//!
//! [`ReplicationManager::run_background`] re-sends pending operations to
//! followers that have not acknowledged yet and drops operations that are
//! expired or satisfied. Satisfaction is judged against the *current* `rf`,
//! so lowering `rf` can retire an operation that never met the quorum its
//! writer waited for.
//!
//! Retries go out through a bounded stream rather than one task per message.
//!
//! Waiters never poll: each operation publishes its ack count on a
//! `tokio::sync::watch` channel that the writer awaits.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use futures::{StreamExt, future, stream};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior, timeout};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client;
use crate::config::ReplicationTimings;
use crate::directory::{ClusterDirectory, NodeInfo, ReplicationMode};
use crate::error::WriteError;
use crate::protocol::Request;
use crate::store::ReplicatedStore;

/// Upper bound on concurrent sends during one retry pass.
pub const MAX_RETRY_SENDS_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    Put { value: String },
    Delete,
}

/// A client write accepted by the leader and still being replicated.
#[derive(Debug)]
pub struct Operation {
    id: Uuid,
    kind: WriteKind,
    key: String,
    seq: u64,
    created_at: Instant,
    targets: Vec<NodeInfo>,
    acked: Mutex<HashSet<String>>,
    ack_count: watch::Sender<usize>,
}

impl Operation {
    fn new(key: String, kind: WriteKind, seq: u64, targets: Vec<NodeInfo>) -> Self {
        let (ack_count, _) = watch::channel(0);
        Self {
            id: Uuid::new_v4(),
            kind,
            key,
            seq,
            created_at: Instant::now(),
            targets,
            acked: Mutex::new(HashSet::new()),
            ack_count,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn acked_count(&self) -> usize {
        *self.ack_count.borrow()
    }

    /// Records an ack from `node_id`. Only the operation's targets count,
    /// each at most once. Returns whether the count grew.
    pub fn record_ack(&self, node_id: &str) -> bool {
        if !self.targets.iter().any(|target| target.node_id == node_id) {
            return false;
        }
        let mut acked = self.acked.lock();
        if !acked.insert(node_id.to_string()) {
            return false;
        }
        self.ack_count.send_replace(acked.len());
        true
    }

    fn unacked_targets(&self) -> Vec<NodeInfo> {
        let acked = self.acked.lock();
        self.targets
            .iter()
            .filter(|target| !acked.contains(&target.node_id))
            .cloned()
            .collect()
    }

    fn is_satisfied(&self, followers_required: usize) -> bool {
        self.acked_count() >= followers_required
    }

    fn is_expired(&self, ttl: std::time::Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    /// The replication message for this operation, as sent by `origin`.
    pub fn message(&self, origin: &str) -> Request {
        match &self.kind {
            WriteKind::Put { value } => Request::ReplPut {
                operation_id: self.id.to_string(),
                origin_node_id: origin.to_string(),
                key: self.key.clone(),
                value: value.clone(),
                seq: self.seq,
                operation_type: Some("PUT".to_string()),
            },
            WriteKind::Delete => Request::ReplDelete {
                operation_id: self.id.to_string(),
                origin_node_id: origin.to_string(),
                key: self.key.clone(),
                seq: self.seq,
                operation_type: Some("DELETE".to_string()),
            },
        }
    }

    async fn wait_for_acks(&self, required: usize, limit: std::time::Duration) -> bool {
        if required == 0 {
            return true;
        }
        let mut acks = self.ack_count.subscribe();
        let reached = matches!(
            timeout(limit, acks.wait_for(|count| *count >= required)).await,
            Ok(Ok(_))
        );
        reached
    }
}

pub struct ReplicationManager {
    node_id: String,
    directory: Arc<ClusterDirectory>,
    store: Arc<ReplicatedStore>,
    operations: DashMap<Uuid, Arc<Operation>>,
    sequence: AtomicU64,
    timings: ReplicationTimings,
}

impl ReplicationManager {
    pub fn new(
        node_id: impl Into<String>,
        directory: Arc<ClusterDirectory>,
        store: Arc<ReplicatedStore>,
        timings: ReplicationTimings,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            directory,
            store,
            operations: DashMap::new(),
            sequence: AtomicU64::new(0),
            timings,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Next sequence number for a local write. Starts at 1 and only grows.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub async fn put(&self, key: &str, value: String) -> Result<(), WriteError> {
        self.write(key, WriteKind::Put { value }).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), WriteError> {
        self.write(key, WriteKind::Delete).await
    }

    async fn write(&self, key: &str, kind: WriteKind) -> Result<(), WriteError> {
        let cluster = self.directory.snapshot();
        if !cluster.is_leader(&self.node_id) {
            return Err(WriteError::NotLeader {
                leader: cluster.leader_node_id,
            });
        }

        let seq = self.next_sequence();
        match &kind {
            WriteKind::Put { value } => self.store.apply_put(key, value.clone(), seq),
            WriteKind::Delete => self.store.apply_delete(key, seq),
        };

        let followers: Vec<NodeInfo> = cluster
            .nodes
            .iter()
            .filter(|node| node.node_id != self.node_id)
            .cloned()
            .collect();
        let followers_required = cluster.followers_required();
        if cluster.rf > cluster.nodes.len() || followers_required > followers.len() {
            info!(
                node = %self.node_id,
                key,
                rf = cluster.rf,
                nodes = cluster.nodes.len(),
                "not enough replicas configured"
            );
            return Err(WriteError::NotEnoughReplicas);
        }

        let operation = Arc::new(Operation::new(key.to_string(), kind, seq, followers));
        self.operations
            .insert(operation.id(), Arc::clone(&operation));
        info!(
            node = %self.node_id,
            op_id = %operation.id(),
            key,
            seq,
            rf = cluster.rf,
            mode = %cluster.replication_mode,
            "replicating write"
        );
        self.fan_out(&operation);

        let required = match cluster.replication_mode {
            ReplicationMode::Async => 0,
            ReplicationMode::Sync => followers_required,
            ReplicationMode::SemiSync => cluster.semi_sync_acks.min(followers_required),
        };
        if operation
            .wait_for_acks(required, self.timings.request_timeout)
            .await
        {
            Ok(())
        } else {
            info!(
                node = %self.node_id,
                op_id = %operation.id(),
                required,
                acked = operation.acked_count(),
                "write did not reach its quorum in time"
            );
            Err(WriteError::NotEnoughReplicas)
        }
    }

    // One task per follower so an unreachable peer never delays the writer.
    fn fan_out(&self, operation: &Operation) {
        let message = operation.message(&self.node_id);
        let limit = self.timings.request_timeout;
        for target in &operation.targets {
            let addr = target.addr();
            let message = message.clone();
            tokio::spawn(async move {
                client::send_one_way(&addr, &message, limit).await;
            });
        }
    }

    /// Records an acknowledgment. Acks for unknown or retired operations are dropped.
    pub fn on_ack(&self, operation_id: &str, from_node_id: &str) -> bool {
        let Ok(id) = Uuid::parse_str(operation_id) else {
            debug!(node = %self.node_id, operation_id, "ack with malformed operation id");
            return false;
        };
        let Some(operation) = self.operations.get(&id).map(|entry| Arc::clone(entry.value()))
        else {
            debug!(
                node = %self.node_id,
                op_id = %id,
                from = from_node_id,
                "ack for unknown operation"
            );
            return false;
        };
        let counted = operation.record_ack(from_node_id);
        debug!(
            node = %self.node_id,
            op_id = %id,
            from = from_node_id,
            acked = operation.acked_count(),
            "ack received"
        );
        counted
    }

    pub fn pending_operations(&self) -> Vec<Arc<Operation>> {
        self.operations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Drops operations that are expired or satisfied under the live `rf`.
    /// Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let followers_required = self.directory.snapshot().followers_required();
        let ttl = self.timings.dedup_ttl;
        let before = self.operations.len();
        self.operations.retain(|_, operation| {
            !operation.is_expired(ttl) && !operation.is_satisfied(followers_required)
        });
        before.saturating_sub(self.operations.len())
    }

    /// Re-sends every pending operation to its unacknowledged followers.
    ///
    /// Messages are collected first so no map guard is held across I/O, and
    /// at most [`MAX_RETRY_SENDS_IN_FLIGHT`] sends run at once so a silent
    /// follower cannot pin one socket per pending operation.
    /// Returns the number of messages sent.
    pub async fn retry_pending(&self) -> usize {
        self.cleanup();
        let resend: Vec<(String, Request)> = self
            .operations
            .iter()
            .flat_map(|entry| {
                let operation = entry.value();
                let message = operation.message(&self.node_id);
                operation
                    .unacked_targets()
                    .into_iter()
                    .map(move |target| (target.addr(), message.clone()))
            })
            .collect();
        if resend.is_empty() {
            return 0;
        }

        let limit = self.timings.request_timeout;
        let attempted = resend.len();
        let delivered = stream::iter(resend)
            .map(|(addr, message)| async move {
                client::send_one_way(&addr, &message, limit).await
            })
            .buffer_unordered(MAX_RETRY_SENDS_IN_FLIGHT)
            .filter(|ok| future::ready(*ok))
            .count()
            .await;
        debug!(
            node = %self.node_id,
            attempted,
            delivered,
            "retried pending replication"
        );
        attempted
    }

    /// Runs the retry and cleanup timers until `shutdown` flips to `true`.
    pub async fn run_background(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = time::Instant::now();
        let mut retry = time::interval_at(
            start + self.timings.retry_interval,
            self.timings.retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = time::interval_at(
            start + self.timings.operation_cleanup_interval,
            self.timings.operation_cleanup_interval,
        );
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = retry.tick() => {
                    self.retry_pending().await;
                }
                _ = cleanup.tick() => {
                    let dropped = self.cleanup();
                    if dropped > 0 {
                        debug!(node = %self.node_id, dropped, "retired replication operations");
                    }
                }
            }
        }
        debug!(node = %self.node_id, "replication background task stopped");
    }
}
