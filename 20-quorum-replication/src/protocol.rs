//! JSON line protocol spoken between clients, operators and nodes.
//!
//! Every connection carries one request line. Client and cluster-update
//! requests get exactly one response line back; replication messages
//! (REPL_PUT, REPL_DELETE, REPL_ACK) are one-way.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::directory::{ClusterConfig, NodeInfo, ReplicationMode};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest request line a node accepts.
pub const MAX_LINE_BYTES: u64 = 1024 * 1024;

const KNOWN_TYPES: &[&str] = &[
    "CLIENT_PUT",
    "CLIENT_GET",
    "CLIENT_DELETE",
    "CLIENT_DUMP",
    "CLUSTER_UPDATE",
    "REPL_PUT",
    "REPL_DELETE",
    "REPL_ACK",
];

const ONE_WAY_TYPES: &[&str] = &["REPL_PUT", "REPL_DELETE", "REPL_ACK"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    ClientPut {
        request_id: String,
        client_id: String,
        key: String,
        value: String,
    },
    ClientGet {
        request_id: String,
        client_id: String,
        key: String,
    },
    ClientDelete {
        request_id: String,
        client_id: String,
        key: String,
    },
    ClientDump {
        request_id: String,
        client_id: String,
    },
    ClusterUpdate(ClusterUpdate),
    ReplPut {
        operation_id: String,
        origin_node_id: String,
        key: String,
        value: String,
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_type: Option<String>,
    },
    ReplDelete {
        operation_id: String,
        origin_node_id: String,
        key: String,
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_type: Option<String>,
    },
    ReplAck {
        operation_id: String,
        from_node_id: String,
    },
}

impl Request {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Request::ClientPut { request_id, .. }
            | Request::ClientGet { request_id, .. }
            | Request::ClientDelete { request_id, .. }
            | Request::ClientDump { request_id, .. } => Some(request_id),
            Request::ClusterUpdate(update) => update.request_id.as_deref(),
            Request::ReplPut { .. } | Request::ReplDelete { .. } | Request::ReplAck { .. } => None,
        }
    }
}

/// Authoritative cluster snapshot pushed by the operator tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub nodes: Vec<NodeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_node_id: Option<String>,
    pub replication_mode: ReplicationMode,
    #[serde(default = "default_one")]
    pub rf: usize,
    #[serde(default = "default_one")]
    pub semi_sync_acks: usize,
    #[serde(default)]
    pub delay_min_ms: u64,
    #[serde(default)]
    pub delay_max_ms: u64,
}

fn default_one() -> usize {
    1
}

impl ClusterUpdate {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            request_id: None,
            client_id: None,
            nodes: config.nodes.clone(),
            leader_node_id: config.leader_node_id.clone(),
            replication_mode: config.replication_mode,
            rf: config.rf,
            semi_sync_acks: config.semi_sync_acks,
            delay_min_ms: config.delay_min_ms,
            delay_max_ms: config.delay_max_ms,
        }
    }

    /// Converts the message into a directory snapshot, rejecting values that
    /// break the configuration's invariants.
    pub fn into_config(self) -> Result<ClusterConfig, String> {
        if self.rf < 1 {
            return Err("rf must be at least 1".to_string());
        }
        if self.delay_max_ms < self.delay_min_ms {
            return Err("delayMaxMs must not be below delayMinMs".to_string());
        }
        let mut config = ClusterConfig::with_nodes(self.nodes);
        config.leader_node_id = self.leader_node_id;
        config.replication_mode = self.replication_mode;
        config.rf = self.rf;
        config.semi_sync_acks = self.semi_sync_acks;
        config.delay_min_ms = self.delay_min_ms;
        config.delay_max_ms = self.delay_max_ms;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotLeader,
    NotEnoughReplicas,
    BadRequest,
    /// Produced by the client side when a node cannot be reached in time.
    Timeout,
    /// Produced by the client side when a node id cannot be resolved.
    UnknownNode,
}

/// `value` is a string for CLIENT_GET and an object for CLIENT_DUMP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    Text(String),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ResponseValue>,
}

impl Response {
    pub fn ok(request_id: Option<&str>) -> Self {
        Self {
            request_id: request_id.map(str::to_string),
            status: Status::Ok,
            error_code: None,
            error_message: None,
            leader_node_id: None,
            found: None,
            value: None,
        }
    }

    pub fn error(request_id: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            error_code: Some(code),
            error_message: Some(message.into()),
            ..Self::ok(request_id)
        }
    }

    pub fn bad_request(request_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::error(request_id, ErrorCode::BadRequest, message)
    }

    pub fn lookup(request_id: Option<&str>, value: Option<String>) -> Self {
        Self {
            found: Some(value.is_some()),
            value: value.map(ResponseValue::Text),
            ..Self::ok(request_id)
        }
    }

    pub fn dump(request_id: Option<&str>, entries: BTreeMap<String, String>) -> Self {
        Self {
            value: Some(ResponseValue::Map(entries)),
            ..Self::ok(request_id)
        }
    }

    pub fn with_leader(mut self, leader: Option<String>) -> Self {
        self.leader_node_id = leader;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn text_value(&self) -> Option<&str> {
        match &self.value {
            Some(ResponseValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn map_value(&self) -> Option<&BTreeMap<String, String>> {
        match &self.value {
            Some(ResponseValue::Map(map)) => Some(map),
            _ => None,
        }
    }
}

/// A key is valid iff it is non-empty and contains no whitespace at all.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(char::is_whitespace)
}

/// Decodes one request line.
///
/// The line is first read as a generic JSON object so that a request id can
/// be echoed back even when the typed decode fails. The error carries the
/// BAD_REQUEST to send back, or `None` for a malformed replication message,
/// whose sender never reads a reply.
pub fn decode_request(line: &str) -> Result<Request, Option<Response>> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value @ Value::Object(_)) => value,
        _ => return Err(Some(Response::bad_request(None, "Invalid JSON"))),
    };
    let request_id = value.get("requestId").and_then(Value::as_str);
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(Some(Response::bad_request(request_id, "Missing type")));
    };
    if !KNOWN_TYPES.contains(&kind) {
        return Err(Some(Response::bad_request(request_id, "Unknown type")));
    }
    let one_way = ONE_WAY_TYPES.contains(&kind);
    let request_id = request_id.map(str::to_string);
    serde_json::from_value(value).map_err(|err| {
        (!one_way).then(|| Response::bad_request(request_id.as_deref(), err.to_string()))
    })
}

/// Reads the next non-blank line, or `None` once the peer has closed.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Like [`read_line`], but fails with `InvalidData` once more than
/// `max_bytes` have been read without finding a complete line.
pub async fn read_line_bounded<R>(reader: &mut R, max_bytes: u64) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(max_bytes);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = limited.read_line(&mut line).await?;
        if limited.limit() == 0 && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request line exceeds {max_bytes} bytes"),
            ));
        }
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader).await? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
