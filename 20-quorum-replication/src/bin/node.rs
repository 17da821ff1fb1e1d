//! Runs one storage node until ctrl-c.
//!
//! A freshly started node knows no peers and no leader; push the layout to
//! every node with a CLUSTER_UPDATE before sending writes.
//!
//! ```bash
//! cargo run --bin node -- --id a --port 7001
//! cargo run --bin node -- --id b --port 7002
//! cargo run --bin node -- --id c --port 7003
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::{info, warn};

use quorum_replication::config::{NodeConfig, ReplicationTimings};
use quorum_replication::server::Node;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value store node")]
struct Args {
    /// Node id; must match this node's entry in the cluster layout
    #[arg(long)]
    id: String,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1", value_hint = ValueHint::Hostname)]
    host: String,

    #[arg(long)]
    port: u16,

    /// Timeout for outbound calls and for sync/semi-sync acknowledgment waits
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Interval between re-sends of unacknowledged replication messages
    #[arg(long)]
    retry_interval_ms: Option<u64>,
}

impl Args {
    fn timings(&self) -> ReplicationTimings {
        let mut timings = ReplicationTimings::default();
        if let Some(ms) = self.request_timeout_ms {
            timings.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry_interval_ms {
            timings.retry_interval = Duration::from_millis(ms);
        }
        timings
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    let node = Node::new(listener, NodeConfig::new(args.id.clone()).with_timings(args.timings()));
    let addr = node.local_addr()?;
    info!(node = %args.id, %addr, "node listening");

    if let Err(err) = node.run_until_ctrl_c().await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
