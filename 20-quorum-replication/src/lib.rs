//! Leader/follower replicated key-value store with tunable quorum.
//!
//! Every node runs the same process. An external operator pushes the
//! cluster layout (members, leader, replication mode, replication factor)
//! to each node with a CLUSTER_UPDATE; there is no election. Clients write
//! to the leader and may read from any node.
//!
//! # Architecture
//!
//! - One Tokio task per inbound connection. Each connection carries a
//!   single JSON line and at most one response line.
//! - Two long-lived background tasks per node: the replication retry and
//!   cleanup pass, and the dedup cache sweep. Both stop when the node shuts
//!   down.
//! - All tasks share the cluster directory, the store, the dedup cache and
//!   the leader's pending operation table.
//!
//! Replication is best effort with retries: the leader applies locally,
//! fans out to every follower, and depending on the mode waits for none,
//! all, or `k` of the required acknowledgments. Followers make redelivery
//! harmless by remembering operation ids, and the store resolves
//! reordering by keeping the highest sequence number per key.
//!
//! # Modules
//!
//! - [`directory`]: cluster membership and replication settings
//! - [`store`]: last-writer-wins map with tombstones
//! - [`dedup`]: operation ids seen recently
//! - [`replication`]: the leader write path and retries
//! - [`server`]: listener, dispatcher and follower apply path
//! - [`protocol`]: JSON line messages and framing
//! - [`client`]: one-shot outbound requests
//! - [`config`]: node id and timings
//! - [`error`]: write path failures

pub mod client;
pub mod config;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod store;
