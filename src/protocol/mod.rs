//! Wire protocol: framing, version negotiation, per-version dispatch.
//!
//! Every frame is a JSON 3-tuple `[requestId, type, payload]`. `requestId`
//! round-trips a client correlation id, with `0` meaning none. A connection
//! speaks the negotiation vocabulary until a `connect` succeeds, then the
//! vocabulary of the version it negotiated.

pub mod handshake;
pub mod v1;

use crate::connection::Connection;
use crate::error::{GatewayError, Result};
use crate::transport::Transport;
use crate::types::QueryId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// Protocol versions this crate can speak, in no particular order;
/// preference is configured on the gateway.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
}

impl ProtocolVersion {
    /// Version id as it appears on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "1" => Some(ProtocolVersion::V1),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Per-connection negotiation state. Replaced wholesale on transition; a
/// connection never leaves `Active` once it gets there.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtocolState {
    Negotiating,
    Active(ProtocolVersion),
}

/// Message type strings shared by client and server.
pub mod kind {
    pub const CONNECT: &str = "connect";
    pub const SWITCH_PROTOCOL: &str = "switch_protocol";
    pub const ERROR: &str = "error";
    pub const SESSION_NEW: &str = "session_new";
    pub const SESSION_REUSE: &str = "session_reuse";
    pub const WATCH: &str = "watch";
    pub const UNWATCH: &str = "unwatch";
    pub const EXEC: &str = "exec";
    pub const WATCH_DATA: &str = "watch_data";
}

/// A decoded wire frame.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub request_id: u64,
    pub kind: String,
    pub payload: Value,
}

impl WireMessage {
    pub fn new(request_id: u64, kind: &str, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            request_id,
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a concrete message struct.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| GatewayError::MalformedMessage(e.to_string()))
    }
}

/// Serialize a message to its frame text.
pub fn encode(message: &WireMessage) -> Result<String> {
    Ok(serde_json::to_string(&(
        message.request_id,
        &message.kind,
        &message.payload,
    ))?)
}

/// Parse a frame. Anything that is not a `[number, string, value]` tuple is
/// malformed.
pub fn decode(frame: &str) -> Result<WireMessage> {
    let (request_id, kind, payload): (u64, String, Value) = serde_json::from_str(frame)
        .map_err(|e| GatewayError::MalformedMessage(e.to_string()))?;
    Ok(WireMessage {
        request_id,
        kind,
        payload,
    })
}

/// Error response payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: u8,
}

/// Build an `error` response. Infallible: the payload is a bare code.
pub fn error_message(request_id: u64, code: u8) -> WireMessage {
    WireMessage {
        request_id,
        kind: kind::ERROR.to_string(),
        payload: serde_json::json!({ "error": code }),
    }
}

/// Encode and send one message; a refused send is logged, never propagated.
pub(crate) fn send_message(transport: &dyn Transport, connection: &Connection, message: &WireMessage) {
    let frame = match encode(message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %connection.id(), error = %e, "failed to encode outgoing message");
            return;
        }
    };
    if let Err(e) = transport.send(connection.id(), &frame) {
        warn!(connection = %connection.id(), error = %e, "transport rejected send");
    }
}

/// Deliver a query result to one connection in its negotiated vocabulary.
pub(crate) fn emit_query_data(
    transport: &dyn Transport,
    connection: &Connection,
    query: &QueryId,
    result: &Value,
    chunk_size: usize,
) {
    let version = match connection.protocol_state() {
        ProtocolState::Active(version) => version,
        ProtocolState::Negotiating => {
            warn!(connection = %connection.id(), "skipping emit to connection still negotiating");
            return;
        }
    };
    let messages = match version {
        ProtocolVersion::V1 => v1::watch_data_messages(query, result, chunk_size),
    };
    match messages {
        Ok(messages) => {
            for message in &messages {
                send_message(transport, connection, message);
            }
        }
        Err(e) => {
            warn!(query = %query, error = %e, "failed to build query data messages");
        }
    }
}
