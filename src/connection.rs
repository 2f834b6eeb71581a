//! Live connection handles and the registry that owns them.

use crate::protocol::{ProtocolState, ProtocolVersion};
use crate::types::{ConnectionId, IdentityId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// One live connection: its negotiation state, the identity bound to it (if
/// any), and when it connected. The handle owns the protocol state; nothing
/// else mutates it.
pub struct Connection {
    id: ConnectionId,
    connected_at: Instant,
    protocol: RwLock<ProtocolState>,
    identity: RwLock<Option<IdentityId>>,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            protocol: RwLock::new(ProtocolState::Negotiating),
            identity: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn protocol_state(&self) -> ProtocolState {
        *self.protocol.read()
    }

    /// Transition to `Active(version)`. The whole state is replaced; there is
    /// no partial mutation of version data.
    pub(crate) fn activate(&self, version: ProtocolVersion) {
        *self.protocol.write() = ProtocolState::Active(version);
    }

    pub fn identity_id(&self) -> Option<IdentityId> {
        self.identity.read().clone()
    }

    /// Bind an identity to this connection, replacing any previous one.
    pub(crate) fn set_identity(&self, identity: IdentityId) {
        *self.identity.write() = Some(identity);
    }
}

/// Owns every live connection handle.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in `Negotiating` state and return its handle. A
    /// colliding id replaces the old handle, which should not happen with a
    /// well-behaved transport.
    pub fn register(&self, id: ConnectionId) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(id.clone()));
        let previous = self
            .connections
            .write()
            .insert(id.clone(), Arc::clone(&connection));
        if previous.is_some() {
            warn!(connection = %id, "connection id registered twice, replacing handle");
        }
        connection
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Connections still negotiating after `timeout`. Candidates for the
    /// handshake sweeper.
    pub fn expired_negotiations(&self, timeout: Duration) -> Vec<ConnectionId> {
        let connections = self.connections.read();
        connections
            .values()
            .filter(|conn| {
                conn.protocol_state() == ProtocolState::Negotiating
                    && conn.connected_at.elapsed() > timeout
            })
            .map(|conn| conn.id.clone())
            .collect()
    }
}
