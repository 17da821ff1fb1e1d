//! Outbound side of the protocol: one connection per message.
//!
//! Nodes use [`send_one_way`] for replication fan-out and acknowledgments;
//! operator tooling and tests use [`send_request`] / [`request_node`]. A
//! failed or slow peer never surfaces as an `Err` here: requests turn into
//! a TIMEOUT response and one-way sends report `false`. The replication
//! retry loop covers what gets lost.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::directory::ClusterConfig;
use crate::protocol::{ErrorCode, Request, Response, read_message, write_message};

/// Sends `request` and waits for its single response line.
///
/// Connect, write and read each get `limit`; any failure is reported as a
/// TIMEOUT error response carrying the request id.
pub async fn send_request(addr: &str, request: &Request, limit: Duration) -> Response {
    match exchange(addr, request, limit).await {
        Ok(response) => response,
        Err(err) => {
            debug!(%addr, error = ?err, "request failed");
            Response::error(request.request_id(), ErrorCode::Timeout, err.to_string())
        }
    }
}

/// Resolves `node_id` against `cluster` and sends `request` to it.
pub async fn request_node(
    cluster: &ClusterConfig,
    node_id: &str,
    request: &Request,
    limit: Duration,
) -> Response {
    match cluster.node(node_id) {
        Some(node) => send_request(&node.addr(), request, limit).await,
        None => Response::error(
            request.request_id(),
            ErrorCode::UnknownNode,
            format!("unknown node '{node_id}'"),
        ),
    }
}

/// Writes `message` and closes the connection without reading anything back.
///
/// Returns whether the line was handed to the peer.
pub async fn send_one_way(addr: &str, message: &Request, limit: Duration) -> bool {
    match deliver(addr, message, limit).await {
        Ok(()) => true,
        Err(err) => {
            debug!(%addr, error = ?err, "one-way send dropped");
            false
        }
    }
}

async fn connect(addr: &str, limit: Duration) -> Result<TcpStream> {
    timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("connect to {addr} timed out"))?
        .with_context(|| format!("failed to connect to {addr}"))
}

async fn exchange(addr: &str, request: &Request, limit: Duration) -> Result<Response> {
    let stream = connect(addr, limit).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    timeout(limit, write_message(&mut writer, request))
        .await
        .map_err(|_| anyhow!("write to {addr} timed out"))?
        .context("failed to write request")?;

    timeout(limit, read_message::<_, Response>(&mut reader))
        .await
        .map_err(|_| anyhow!("read from {addr} timed out"))?
        .context("failed to read response")?
        .ok_or_else(|| anyhow!("{addr} closed the connection without a response"))
}

async fn deliver(addr: &str, message: &Request, limit: Duration) -> Result<()> {
    let mut stream = connect(addr, limit).await?;
    timeout(limit, async {
        write_message(&mut stream, message).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| anyhow!("write to {addr} timed out"))?
    .context("failed to write message")
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::directory::NodeInfo;
    use crate::protocol::read_line;

    fn get(request_id: &str) -> Request {
        Request::ClientGet {
            request_id: request_id.into(),
            client_id: "test".into(),
            key: "k".into(),
        }
    }

    async fn closed_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn unreachable_peer_yields_timeout_response() {
        let addr = closed_addr().await;
        let response = send_request(&addr, &get("r1"), Duration::from_millis(200)).await;
        assert_eq!(response.error_code, Some(ErrorCode::Timeout));
        assert_eq!(response.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn silent_peer_yields_timeout_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let response = send_request(&addr, &get("r2"), Duration::from_millis(100)).await;
        assert_eq!(response.error_code, Some(ErrorCode::Timeout));
        server.abort();
    }

    #[tokio::test]
    async fn unknown_node_is_reported_without_connecting() {
        let cluster = ClusterConfig::with_nodes(vec![NodeInfo::new("a", "127.0.0.1", 1)]);
        let response = request_node(&cluster, "zz", &get("r3"), Duration::from_millis(100)).await;
        assert_eq!(response.error_code, Some(ErrorCode::UnknownNode));
        assert_eq!(response.request_id.as_deref(), Some("r3"));
    }

    #[tokio::test]
    async fn one_way_send_delivers_a_single_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut reader = BufReader::new(stream);
            read_line(&mut reader).await.expect("read")
        });

        let ack = Request::ReplAck {
            operation_id: "op".into(),
            from_node_id: "b".into(),
        };
        assert!(send_one_way(&addr, &ack, Duration::from_millis(500)).await);
        let line = server.await.expect("server task").expect("a line");
        assert!(line.contains("REPL_ACK"));

        assert!(!send_one_way(&closed_addr().await, &ack, Duration::from_millis(200)).await);
    }
}
