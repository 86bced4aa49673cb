//! Engine.IO v4 long-polling framing and the Socket.IO packets carried inside it.
//!
//! Only the subset spoken by the weather station's realtime endpoint is covered:
//! text packets, the default or a named namespace, and JSON event arguments.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Separates packets inside one long-polling HTTP body.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Server defaults applied when the open packet leaves the timings out.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("empty packet")]
    Empty,
    #[error("unknown engine.io packet type {0:?}")]
    UnknownEnginePacket(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketPacket(char),
    #[error("binary socket.io packets are not supported")]
    Binary,
    #[error("malformed json in packet: {0}")]
    Json(String),
    #[error("event packet without a name")]
    MissingEventName,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(rename = "pingInterval", default = "default_ping_interval")]
    pub ping_interval_ms: u64,
    #[serde(rename = "pingTimeout", default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(rename = "maxPayload", default)]
    pub max_payload: u64,
}

impl OpenHandshake {
    /// Longest the server may stay silent before the session is dead.
    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.saturating_add(self.ping_timeout_ms))
    }
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_ping_timeout() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack,
    ConnectError(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, CodecError> {
    body.split(RECORD_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .map(decode_packet)
        .collect()
}

pub fn decode_packet(raw: &str) -> Result<EnginePacket, CodecError> {
    let mut chars = raw.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => serde_json::from_str(rest)
            .map(EnginePacket::Open)
            .map_err(|err| CodecError::Json(err.to_string())),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(rest.to_string())),
        '3' => Ok(EnginePacket::Pong(rest.to_string())),
        '4' => decode_socket_packet(rest).map(EnginePacket::Message),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(CodecError::UnknownEnginePacket(other)),
    }
}

fn decode_socket_packet(raw: &str) -> Result<SocketPacket, CodecError> {
    let mut chars = raw.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let (namespace, rest) = split_namespace(chars.as_str());

    match kind {
        '0' => {
            let data = parse_optional_json(rest)?;
            Ok(SocketPacket::Connect(data))
        }
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let digits = rest.chars().take_while(char::is_ascii_digit).count();
            let ack_id = rest[..digits].parse::<u64>().ok();
            let args: Vec<Value> = serde_json::from_str(&rest[digits..])
                .map_err(|err| CodecError::Json(err.to_string()))?;
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(CodecError::MissingEventName),
            };
            Ok(SocketPacket::Event {
                namespace,
                ack_id,
                name,
                args: args.collect(),
            })
        }
        '3' => Ok(SocketPacket::Ack),
        '4' => {
            let data = parse_optional_json(rest)?.unwrap_or(Value::Null);
            Ok(SocketPacket::ConnectError(data))
        }
        '5' | '6' => Err(CodecError::Binary),
        other => Err(CodecError::UnknownSocketPacket(other)),
    }
}

fn split_namespace(raw: &str) -> (String, &str) {
    if raw.starts_with('/') {
        if let Some((namespace, rest)) = raw.split_once(',') {
            return (namespace.to_string(), rest);
        }
        return (raw.to_string(), "");
    }
    ("/".to_string(), raw)
}

fn parse_optional_json(raw: &str) -> Result<Option<Value>, CodecError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|err| CodecError::Json(err.to_string()))
}

pub fn encode_connect() -> String {
    "40".to_string()
}

pub fn encode_pong(data: &str) -> String {
    format!("3{data}")
}

pub fn encode_event(name: &str, data: &Value) -> String {
    let packet = Value::Array(vec![Value::String(name.to_string()), data.clone()]);
    format!("42{packet}")
}
