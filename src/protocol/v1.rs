//! Protocol version 1.
//!
//! Post-negotiation vocabulary: session management (`session_new`,
//! `session_reuse`), subscriptions (`watch`, `unwatch`), actions (`exec`)
//! and the server-pushed `watch_data` stream. Replies reuse the request's
//! message type and correlation id; server pushes carry id 0.

use crate::connection::Connection;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::protocol::{self, kind, ProtocolVersion, WireMessage};
use crate::types::{IdentityId, QueryId, QueryParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionNewPayload {
    pub version: String,
    pub session: IdentityId,
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionReuseRequest {
    pub session: IdentityId,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionReusePayload {
    pub session: IdentityId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchRequest {
    pub name: String,
    #[serde(default)]
    pub params: QueryParams,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchAck {
    pub id: QueryId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnwatchRequest {
    pub id: QueryId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnwatchAck {
    pub handle: QueryId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub name: String,
    #[serde(default)]
    pub params: QueryParams,
}

/// One slice of a chunked query result.
#[derive(Debug, Serialize, Deserialize)]
pub struct WatchData {
    pub id: QueryId,
    pub total: usize,
    pub part: usize,
    pub stream: String,
}

/// Dispatch one frame from an active v1 connection. Failures turn into an
/// error reply carrying the request's correlation id.
pub(crate) fn receive(gateway: &Gateway, connection: &Connection, message: &WireMessage) {
    let outcome = match message.kind.as_str() {
        kind::SESSION_NEW => session_new(gateway, connection, message),
        kind::SESSION_REUSE => session_reuse(gateway, connection, message),
        kind::WATCH => watch(gateway, connection, message),
        kind::UNWATCH => unwatch(gateway, connection, message),
        kind::EXEC => exec(gateway, connection, message),
        _ => Err(GatewayError::UnknownMessage(message.kind.clone())),
    };
    if let Err(e) = outcome {
        debug!(connection = %connection.id(), kind = %message.kind, error = %e, "request rejected");
        let response = protocol::error_message(message.request_id, e.wire_code());
        protocol::send_message(gateway.transport(), connection, &response);
    }
}

fn reply(
    gateway: &Gateway,
    connection: &Connection,
    request_id: u64,
    kind: &str,
    payload: &impl Serialize,
) -> Result<()> {
    let message = WireMessage::new(request_id, kind, payload)?;
    protocol::send_message(gateway.transport(), connection, &message);
    Ok(())
}

fn session_new(gateway: &Gateway, connection: &Connection, message: &WireMessage) -> Result<()> {
    let identity = gateway.session_new(connection)?;
    let payload = SessionNewPayload {
        version: ProtocolVersion::V1.id().to_string(),
        session: identity.id,
        secret: identity.secret,
    };
    reply(gateway, connection, message.request_id, kind::SESSION_NEW, &payload)
}

fn session_reuse(gateway: &Gateway, connection: &Connection, message: &WireMessage) -> Result<()> {
    let request: SessionReuseRequest = message.parse_payload()?;
    gateway.session_reuse(connection, &request.session, &request.signature, request.timestamp)?;
    let payload = SessionReusePayload {
        session: request.session,
    };
    reply(gateway, connection, message.request_id, kind::SESSION_REUSE, &payload)
}

fn watch(gateway: &Gateway, connection: &Connection, message: &WireMessage) -> Result<()> {
    // The ack is the client's only way to learn the query id, so a watch
    // without a correlation id is unusable.
    if message.request_id == 0 {
        return Err(GatewayError::MalformedMessage(
            "watch requires a request id".to_string(),
        ));
    }
    let request: WatchRequest = message.parse_payload()?;
    let query = gateway.subscribe(connection, &request.name, request.params)?;
    reply(gateway, connection, message.request_id, kind::WATCH, &WatchAck { id: query })
}

fn unwatch(gateway: &Gateway, connection: &Connection, message: &WireMessage) -> Result<()> {
    if message.request_id == 0 {
        return Err(GatewayError::MalformedMessage(
            "unwatch requires a request id".to_string(),
        ));
    }
    let request: UnwatchRequest = message.parse_payload()?;
    gateway.unsubscribe(connection, &request.id)?;
    let payload = UnwatchAck { handle: request.id };
    reply(gateway, connection, message.request_id, kind::UNWATCH, &payload)
}

fn exec(gateway: &Gateway, connection: &Connection, message: &WireMessage) -> Result<()> {
    let request: ExecRequest = message.parse_payload()?;
    let payload = gateway.execute_action(connection, &request.name, &request.params)?;
    reply(gateway, connection, message.request_id, kind::EXEC, &payload)
}

/// Build the `watch_data` frames for one query result.
///
/// The result is serialized once and cut into fixed-size slices on character
/// boundaries, so a multi-byte scalar never straddles two frames. Receivers
/// buffer by id until `part == total` and concatenate in `part` order.
pub(crate) fn watch_data_messages(
    query: &QueryId,
    result: &Value,
    chunk_size: usize,
) -> Result<Vec<WireMessage>> {
    let serialized = serde_json::to_string(result)?;
    let chunk_size = chunk_size.max(1);
    let chars: Vec<char> = serialized.chars().collect();
    let total = chars.len().div_ceil(chunk_size);
    let mut messages = Vec::with_capacity(total);
    for (index, slice) in chars.chunks(chunk_size).enumerate() {
        let payload = WatchData {
            id: query.clone(),
            total,
            part: index + 1,
            stream: slice.iter().collect(),
        };
        messages.push(WireMessage::new(0, kind::WATCH_DATA, &payload)?);
    }
    Ok(messages)
}
