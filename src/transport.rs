//! Transport contract.
//!
//! The gateway never touches sockets. The embedding brings a transport that
//! can push a text frame to a connection and close one, and feeds inbound
//! events into [`Gateway::handle_connect`](crate::Gateway::handle_connect) /
//! [`handle_frame`](crate::Gateway::handle_frame) /
//! [`handle_disconnect`](crate::Gateway::handle_disconnect).

use crate::error::Result;
use crate::types::ConnectionId;

pub trait Transport: Send + Sync {
    /// Deliver one frame to one connection. Errors are reported per
    /// connection and never abort a fan-out.
    fn send(&self, connection: &ConnectionId, frame: &str) -> Result<()>;

    /// Close a connection. The transport is expected to report the resulting
    /// disconnect back through `handle_disconnect`.
    fn close(&self, connection: &ConnectionId);
}
