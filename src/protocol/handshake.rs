//! Protocol negotiation.
//!
//! Every connection starts here. The only message accepted is `connect`
//! carrying the client's offered version ids; the server picks the first
//! entry of its own preference list that the client also offers, activates
//! it, and answers with `switch_protocol`. Anything else gets a protocol
//! error and the connection stays in negotiation until the handshake
//! sweeper gives up on it.

use crate::connection::Connection;
use crate::error::GatewayError;
use crate::protocol::{self, kind, ProtocolVersion, WireMessage};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub versions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchProtocolPayload {
    pub version: String,
}

/// First server-preferred version the client also offers.
pub fn negotiate(supported: &[ProtocolVersion], offered: &[String]) -> Option<ProtocolVersion> {
    supported
        .iter()
        .copied()
        .find(|version| offered.iter().any(|id| id == version.id()))
}

/// Handle one frame from a connection still in negotiation.
pub(crate) fn receive(
    supported: &[ProtocolVersion],
    transport: &dyn Transport,
    connection: &Connection,
    message: &WireMessage,
) {
    if message.kind != kind::CONNECT {
        reject(
            transport,
            connection,
            message.request_id,
            GatewayError::UnknownMessage(message.kind.clone()),
        );
        return;
    }
    let request: ConnectRequest = match message.parse_payload() {
        Ok(request) => request,
        Err(e) => {
            reject(transport, connection, message.request_id, e);
            return;
        }
    };
    match negotiate(supported, &request.versions) {
        Some(version) => {
            connection.activate(version);
            debug!(connection = %connection.id(), version = %version, "protocol negotiated");
            let payload = SwitchProtocolPayload {
                version: version.id().to_string(),
            };
            // switch_protocol is server-initiated and carries no correlation id.
            match WireMessage::new(0, kind::SWITCH_PROTOCOL, &payload) {
                Ok(response) => protocol::send_message(transport, connection, &response),
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "failed to build switch_protocol");
                }
            }
        }
        None => {
            debug!(
                connection = %connection.id(),
                offered = ?request.versions,
                "no mutually supported protocol version"
            );
            reject(transport, connection, message.request_id, GatewayError::NegotiationFailed);
        }
    }
}

fn reject(
    transport: &dyn Transport,
    connection: &Connection,
    request_id: u64,
    error: GatewayError,
) {
    let response = protocol::error_message(request_id, error.wire_code());
    protocol::send_message(transport, connection, &response);
}
