//! Node identity and replication timing knobs.

use std::time::Duration;

/// Connect/read timeout for every outbound call, and the ack wait for
/// `sync`/`semi-sync` writes.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// How often unacknowledged replication messages are re-sent.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// How long an operation id is remembered, both by the dedup cache on
/// followers and by the leader's pending operation table.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

/// Period of the slow sweeps that purge expired dedup entries and operations.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Timeouts and intervals used by a node's replication machinery.
///
/// The defaults are the production values; tests shrink them so a failing
/// quorum is observed in milliseconds instead of seconds.
#[derive(Debug, Clone)]
pub struct ReplicationTimings {
    pub request_timeout: Duration,
    pub retry_interval: Duration,
    pub operation_cleanup_interval: Duration,
    pub dedup_ttl: Duration,
    pub dedup_cleanup_interval: Duration,
}

impl Default for ReplicationTimings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            operation_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Configuration for spawning a node.
///
/// The listening socket is bound by the caller and handed to
/// [`crate::server::Node::new`] separately, so tests can bind port 0.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id; must match its entry in the cluster snapshot pushed by the operator.
    pub node_id: String,
    pub timings: ReplicationTimings,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timings: ReplicationTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ReplicationTimings) -> Self {
        self.timings = timings;
        self
    }
}
