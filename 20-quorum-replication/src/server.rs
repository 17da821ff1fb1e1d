use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    time::{self, MissedTickBehavior, timeout},
};
use tracing::{debug, info, warn};

use crate::client;
use crate::config::NodeConfig;
use crate::dedup::DedupCache;
use crate::directory::ClusterDirectory;
use crate::error::WriteError;
use crate::protocol::{
    ClusterUpdate, MAX_LINE_BYTES, Request, Response, decode_request, is_valid_key,
    read_line_bounded, write_message,
};
use crate::replication::ReplicationManager;
use crate::store::ReplicatedStore;

/// A storage node: accepts one request per connection and owns the
/// background replication and dedup sweeps.
pub struct Node {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl Node {
    pub fn new(listener: TcpListener, config: NodeConfig) -> Self {
        Self {
            listener,
            state: Arc::new(NodeState::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn node_id(&self) -> &str {
        &self.state.config.node_id
    }

    pub fn store(&self) -> Arc<ReplicatedStore> {
        Arc::clone(&self.state.store)
    }

    pub fn directory(&self) -> Arc<ClusterDirectory> {
        Arc::clone(&self.state.directory)
    }

    pub fn dedup(&self) -> Arc<DedupCache> {
        Arc::clone(&self.state.dedup)
    }

    pub fn replication(&self) -> Arc<ReplicationManager> {
        Arc::clone(&self.state.replication)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Node { listener, state } = self;
        tokio::pin!(shutdown);

        let (stop, stopped) = watch::channel(false);
        let replication =
            tokio::spawn(Arc::clone(&state.replication).run_background(stopped.clone()));
        let dedup = tokio::spawn(run_dedup_cleanup(Arc::clone(&state), stopped));

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = %state.config.node_id, "node shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        let _ = stop.send(true);
        for (name, task) in [("replication", replication), ("dedup", dedup)] {
            if let Err(err) = task.await {
                warn!(
                    node = %state.config.node_id,
                    task = name,
                    error = ?err,
                    "background task failed"
                );
            }
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<NodeState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<NodeState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, state: Arc<NodeState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let read = read_line_bounded(&mut reader, MAX_LINE_BYTES);
    let Some(line) = timeout(state.config.timings.request_timeout, read)
        .await
        .context("timed out waiting for a request line")??
    else {
        return Ok(());
    };
    if let Some(response) = state.dispatch(&line).await {
        write_message(&mut writer, &response).await?;
    }
    Ok(())
}

async fn run_dedup_cleanup(state: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
    let period = state.config.timings.dedup_cleanup_interval;
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let purged = state.dedup.cleanup();
                if purged > 0 {
                    debug!(node = %state.config.node_id, purged, "purged dedup entries");
                }
            }
        }
    }
}

enum ReplicatedWrite {
    Put { value: String, seq: u64 },
    Delete { seq: u64 },
}

struct NodeState {
    config: NodeConfig,
    directory: Arc<ClusterDirectory>,
    store: Arc<ReplicatedStore>,
    dedup: Arc<DedupCache>,
    replication: Arc<ReplicationManager>,
}

impl NodeState {
    fn new(config: NodeConfig) -> Self {
        let directory = Arc::new(ClusterDirectory::new());
        let store = Arc::new(ReplicatedStore::new());
        let replication = Arc::new(ReplicationManager::new(
            config.node_id.clone(),
            Arc::clone(&directory),
            Arc::clone(&store),
            config.timings.clone(),
        ));
        Self {
            dedup: Arc::new(DedupCache::new(config.timings.dedup_ttl)),
            config,
            directory,
            store,
            replication,
        }
    }

    /// Handles one request line. `None` means nothing is written back.
    async fn dispatch(&self, line: &str) -> Option<Response> {
        let request = match decode_request(line) {
            Ok(request) => request,
            Err(reply) => {
                debug!(
                    node = %self.config.node_id,
                    error = ?reply.as_ref().and_then(|r| r.error_message.as_deref()),
                    "rejected request"
                );
                return reply;
            }
        };

        match request {
            Request::ClientPut {
                request_id,
                key,
                value,
                ..
            } => {
                if !is_valid_key(&key) {
                    return Some(Response::bad_request(
                        Some(&request_id),
                        "Invalid key or value",
                    ));
                }
                let outcome = self.replication.put(&key, value).await;
                Some(write_response(&request_id, outcome))
            }
            Request::ClientDelete {
                request_id, key, ..
            } => {
                if !is_valid_key(&key) {
                    return Some(Response::bad_request(Some(&request_id), "Invalid key"));
                }
                let outcome = self.replication.delete(&key).await;
                Some(write_response(&request_id, outcome))
            }
            Request::ClientGet {
                request_id, key, ..
            } => {
                if !is_valid_key(&key) {
                    return Some(Response::bad_request(Some(&request_id), "Invalid key"));
                }
                let value = self
                    .store
                    .get(&key)
                    .and_then(|entry| entry.visible_value().map(str::to_string));
                Some(Response::lookup(Some(&request_id), value))
            }
            Request::ClientDump { request_id, .. } => {
                Some(Response::dump(Some(&request_id), self.store.dump()))
            }
            Request::ClusterUpdate(update) => Some(self.apply_cluster_update(update)),
            Request::ReplPut {
                operation_id,
                origin_node_id,
                key,
                value,
                seq,
                ..
            } => {
                let write = ReplicatedWrite::Put { value, seq };
                self.apply_replicated(&operation_id, &origin_node_id, &key, write)
                    .await;
                None
            }
            Request::ReplDelete {
                operation_id,
                origin_node_id,
                key,
                seq,
                ..
            } => {
                let write = ReplicatedWrite::Delete { seq };
                self.apply_replicated(&operation_id, &origin_node_id, &key, write)
                    .await;
                None
            }
            Request::ReplAck {
                operation_id,
                from_node_id,
            } => {
                self.replication.on_ack(&operation_id, &from_node_id);
                None
            }
        }
    }

    fn apply_cluster_update(&self, update: ClusterUpdate) -> Response {
        let request_id = update.request_id.clone();
        match update.into_config() {
            Ok(config) => {
                info!(
                    node = %self.config.node_id,
                    nodes = config.nodes.len(),
                    leader = ?config.leader_node_id,
                    mode = %config.replication_mode,
                    rf = config.rf,
                    semi_sync_acks = config.semi_sync_acks,
                    "cluster configuration updated"
                );
                self.directory.replace(config);
                Response::ok(request_id.as_deref())
            }
            Err(message) => Response::bad_request(request_id.as_deref(), message),
        }
    }

    /// Follower side of replication. A redelivery is acknowledged only once
    /// the first copy has landed in the store; while that copy is still
    /// waiting out its delay the redelivery is dropped and a later retry
    /// collects the ack.
    async fn apply_replicated(
        &self,
        operation_id: &str,
        origin: &str,
        key: &str,
        write: ReplicatedWrite,
    ) {
        let node = &self.config.node_id;
        if operation_id.trim().is_empty() || !is_valid_key(key) {
            debug!(node = %node, operation_id, key, "dropping malformed replication message");
            return;
        }

        if self.dedup.seen_or_add(operation_id) {
            if !self.dedup.is_applied(operation_id) {
                debug!(node = %node, op_id = operation_id, key, "duplicate still applying");
                return;
            }
            debug!(node = %node, op_id = operation_id, key, "duplicate replication message");
        } else {
            self.replication_delay().await;
            let applied = match write {
                ReplicatedWrite::Put { value, seq } => self.store.apply_put(key, value, seq),
                ReplicatedWrite::Delete { seq } => self.store.apply_delete(key, seq),
            };
            self.dedup.mark_applied(operation_id);
            debug!(node = %node, op_id = operation_id, key, applied, "applied replication message");
        }

        self.send_ack(operation_id, origin).await;
    }

    async fn replication_delay(&self) {
        let (min, max) = self.directory.delay_range_ms();
        if max == 0 {
            return;
        }
        let millis = rand::thread_rng().gen_range(min.min(max)..=max);
        if millis > 0 {
            time::sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn send_ack(&self, operation_id: &str, origin: &str) {
        let Some(origin_node) = self.directory.node(origin) else {
            debug!(
                node = %self.config.node_id,
                op_id = operation_id,
                origin,
                "no address for origin, ack dropped"
            );
            return;
        };
        let ack = Request::ReplAck {
            operation_id: operation_id.to_string(),
            from_node_id: self.config.node_id.clone(),
        };
        let limit = self.config.timings.request_timeout;
        client::send_one_way(&origin_node.addr(), &ack, limit).await;
    }
}

fn write_response(request_id: &str, outcome: Result<(), WriteError>) -> Response {
    match outcome {
        Ok(()) => Response::ok(Some(request_id)),
        Err(err) => {
            let response = Response::error(Some(request_id), err.code(), err.to_string());
            match err {
                WriteError::NotLeader { leader } => response.with_leader(leader),
                WriteError::NotEnoughReplicas => response,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::directory::{ClusterConfig, NodeInfo, ReplicationMode};
    use crate::protocol::{ErrorCode, Status, read_message};

    fn state(node_id: &str) -> NodeState {
        NodeState::new(NodeConfig::new(node_id))
    }

    fn single_node_leader(node_id: &str) -> NodeState {
        let state = state(node_id);
        let mut config =
            ClusterConfig::with_nodes(vec![NodeInfo::new(node_id, "127.0.0.1", 1)]);
        config.leader_node_id = Some(node_id.to_string());
        state.directory.replace(config);
        state
    }

    async fn send(state: &NodeState, request: serde_json::Value) -> Option<Response> {
        state.dispatch(&request.to_string()).await
    }

    fn client_put(key: &str, value: &str) -> serde_json::Value {
        json!({
            "type": "CLIENT_PUT",
            "requestId": "p",
            "clientId": "c",
            "key": key,
            "value": value
        })
    }

    fn client_get(key: &str) -> serde_json::Value {
        json!({"type": "CLIENT_GET", "requestId": "g", "clientId": "c", "key": key})
    }

    fn repl_put(op: &str, key: &str, value: &str, seq: u64) -> serde_json::Value {
        json!({
            "type": "REPL_PUT",
            "operationId": op,
            "originNodeId": "a",
            "key": key,
            "value": value,
            "seq": seq
        })
    }

    #[tokio::test]
    async fn malformed_lines_are_bad_requests() {
        let state = state("a");
        let response = state.dispatch("not json").await.expect("response");
        assert_eq!(response.error_code, Some(ErrorCode::BadRequest));
        assert_eq!(response.error_message.as_deref(), Some("Invalid JSON"));

        let mut bad_key = client_put("bad key", "v");
        bad_key["requestId"] = json!("r1");
        let response = send(&state, bad_key).await.expect("response");
        assert_eq!(response.request_id.as_deref(), Some("r1"));
        assert_eq!(response.error_message.as_deref(), Some("Invalid key or value"));

        let response = send(&state, client_get("")).await.expect("response");
        assert_eq!(response.error_message.as_deref(), Some("Invalid key"));
    }

    #[tokio::test]
    async fn put_on_follower_reports_leader_and_leaves_store_alone() {
        let state = state("b");
        let mut config = ClusterConfig::with_nodes(vec![
            NodeInfo::new("a", "127.0.0.1", 1),
            NodeInfo::new("b", "127.0.0.1", 2),
        ]);
        config.leader_node_id = Some("a".into());
        state.directory.replace(config);

        let response = send(&state, client_put("k", "v")).await.expect("response");
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error_code, Some(ErrorCode::NotLeader));
        assert_eq!(response.leader_node_id.as_deref(), Some("a"));
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn leader_serves_put_get_delete_and_dump() {
        let state = single_node_leader("a");
        for (key, value) in [("b", "2"), ("a", "1")] {
            let response = send(&state, client_put(key, value)).await.expect("response");
            assert!(response.is_ok());
        }

        let get = send(&state, client_get("a")).await.expect("response");
        assert_eq!((get.found, get.text_value()), (Some(true), Some("1")));

        let delete = json!({
            "type": "CLIENT_DELETE",
            "requestId": "d",
            "clientId": "c",
            "key": "a"
        });
        assert!(send(&state, delete).await.expect("response").is_ok());

        let get = send(&state, client_get("a")).await.expect("response");
        assert_eq!(get.status, Status::Ok);
        assert_eq!(get.found, Some(false));

        let dump = json!({"type": "CLIENT_DUMP", "requestId": "du", "clientId": "c"});
        let dump = send(&state, dump).await.expect("response");
        let entries: Vec<_> = dump
            .map_value()
            .expect("map")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(entries, vec![("b".to_string(), "2".to_string())]);
    }

    #[tokio::test]
    async fn cluster_update_replaces_directory() {
        let state = state("a");
        let response = send(
            &state,
            json!({
                "type": "CLUSTER_UPDATE",
                "requestId": "u1",
                "nodes": [{"nodeId": "a", "host": "127.0.0.1", "port": 7001}],
                "leaderNodeId": "a",
                "replicationMode": "sync",
                "rf": 1,
                "semiSyncAcks": 1,
                "delayMinMs": 0,
                "delayMaxMs": 0
            }),
        )
        .await
        .expect("response");
        assert!(response.is_ok());
        assert_eq!(response.request_id.as_deref(), Some("u1"));
        assert_eq!(state.directory.leader_id().as_deref(), Some("a"));
        assert_eq!(state.directory.replication_mode(), ReplicationMode::Sync);

        let rejected = send(
            &state,
            json!({"type": "CLUSTER_UPDATE", "nodes": [], "replicationMode": "async", "rf": 0}),
        )
        .await
        .expect("response");
        assert_eq!(rejected.error_code, Some(ErrorCode::BadRequest));
        assert_eq!(state.directory.nodes().len(), 1);
    }

    #[tokio::test]
    async fn replicated_writes_apply_once_and_never_answer() {
        let state = state("b");
        assert!(send(&state, repl_put("op-1", "k", "v1", 3)).await.is_none());
        assert_eq!(state.store.get("k").and_then(|e| e.value).as_deref(), Some("v1"));
        assert!(state.dedup.is_applied("op-1"));

        // Same operation id with different contents must not be applied again.
        assert!(send(&state, repl_put("op-1", "k", "v2", 4)).await.is_none());
        assert_eq!(state.store.get("k").map(|e| e.seq), Some(3));

        let delete = json!({
            "type": "REPL_DELETE",
            "operationId": "op-2",
            "originNodeId": "a",
            "key": "k",
            "seq": 5
        });
        assert!(send(&state, delete).await.is_none());
        assert!(state.store.get("k").map(|e| e.tombstone).unwrap_or(false));
    }

    #[tokio::test]
    async fn malformed_replication_messages_are_dropped() {
        let state = state("b");
        assert!(send(&state, repl_put(" ", "k", "v", 1)).await.is_none());
        assert!(send(&state, repl_put("op", "a b", "v", 1)).await.is_none());

        let missing_value = json!({
            "type": "REPL_PUT",
            "operationId": "op",
            "originNodeId": "a",
            "key": "k",
            "seq": 1
        });
        assert!(send(&state, missing_value).await.is_none());
        assert!(send(&state, json!({"type": "REPL_ACK"})).await.is_none());

        assert!(state.store.is_empty());
        assert!(state.dedup.is_empty());
    }

    #[tokio::test]
    async fn acks_are_routed_to_replication() {
        let state = state("a");
        let ack = json!({
            "type": "REPL_ACK",
            "operationId": "00000000-0000-0000-0000-000000000000",
            "fromNodeId": "b"
        });
        assert!(send(&state, ack).await.is_none());
        assert_eq!(state.replication.pending_count(), 0);
    }

    #[tokio::test]
    async fn redelivery_during_a_delayed_apply_is_not_acked() {
        let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let origin_port = origin.local_addr().expect("addr").port();
        let state = Arc::new(state("b"));
        state.directory.replace(ClusterConfig::with_nodes(vec![
            NodeInfo::new("a", "127.0.0.1", origin_port),
            NodeInfo::new("b", "127.0.0.1", 1),
        ]));
        state.directory.set_delay_range_ms(300, 300);

        let line = repl_put("op-1", "k", "v", 1).to_string();
        let first = {
            let state = Arc::clone(&state);
            let line = line.clone();
            tokio::spawn(async move { state.dispatch(&line).await })
        };
        time::sleep(Duration::from_millis(50)).await;

        assert!(state.dispatch(&line).await.is_none());
        assert!(state.store.get("k").is_none(), "first copy is still delayed");
        assert!(
            timeout(Duration::from_millis(100), origin.accept()).await.is_err(),
            "no ack may leave before the write is stored"
        );

        assert!(first.await.expect("apply task").is_none());
        assert_eq!(state.store.get("k").and_then(|e| e.value).as_deref(), Some("v"));

        // The first copy acks once applied, and later redeliveries ack again.
        state.dispatch(&line).await;
        for _ in 0..2 {
            let (stream, _) = timeout(Duration::from_secs(2), origin.accept())
                .await
                .expect("ack in time")
                .expect("accept");
            let mut reader = BufReader::new(stream);
            let ack = read_message::<_, Request>(&mut reader)
                .await
                .expect("read ack")
                .expect("an ack line");
            assert_eq!(
                ack,
                Request::ReplAck {
                    operation_id: "op-1".into(),
                    from_node_id: "b".into(),
                }
            );
        }
    }
}
