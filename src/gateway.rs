//! Gateway composition root.
//!
//! Builds every component once, wires them together, and owns the two
//! background threads (publish worker inside [`PublishQueue`], notification
//! thread inside [`InvalidationListener`]) plus the handshake sweeper. The
//! embedding feeds it transport events through `handle_connect` /
//! `handle_frame` / `handle_disconnect` and registers publications and
//! actions at startup through [`Registry`].

use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{GatewayError, Result};
use crate::executor::QueryExecutor;
use crate::identity::{IdentityManager, NewIdentity};
use crate::invalidation::InvalidationListener;
use crate::protocol::{self, handshake, v1, ProtocolState, ProtocolVersion};
use crate::publish::PublishQueue;
use crate::registry::Registry;
use crate::store::Store;
use crate::subscriptions::{QueryStore, SubscriptionIndex, TagIndex};
use crate::transport::Transport;
use crate::types::{ConnectionId, IdentityId, QueryId, QueryParams, Tag};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Protocol preference, most preferred first.
    pub supported_versions: Vec<ProtocolVersion>,
    /// How long a connection may stay in negotiation before it is closed.
    pub handshake_timeout: Duration,
    /// How often the sweeper checks for expired negotiations.
    pub handshake_sweep_interval: Duration,
    /// Maximum age of a session reuse signature.
    pub signature_timeout: Duration,
    /// Characters per `watch_data` slice.
    pub chunk_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            supported_versions: vec![ProtocolVersion::V1],
            handshake_timeout: Duration::from_millis(5000),
            handshake_sweep_interval: Duration::from_millis(250),
            signature_timeout: Duration::from_secs(60),
            chunk_size: 100,
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    connections: Arc<ConnectionRegistry>,
    subscriptions: SubscriptionIndex,
    queries: QueryStore,
    tags: TagIndex,
    identities: IdentityManager,
    queue: Arc<PublishQueue>,
    listener: InvalidationListener,
    sweeper_shutdown: Sender<()>,
    sweeper: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: Registry,
    ) -> Self {
        let config = GatewayConfig {
            chunk_size: config.chunk_size.max(1),
            ..config
        };
        let registry = Arc::new(registry);
        let connections = Arc::new(ConnectionRegistry::new());
        let subscriptions = SubscriptionIndex::new(Arc::clone(&store));
        let queries = QueryStore::new(Arc::clone(&store));
        let tags = TagIndex::new(Arc::clone(&store));
        let identities = IdentityManager::new(Arc::clone(&store), config.signature_timeout);

        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&registry),
            queries.clone(),
            tags.clone(),
            subscriptions.clone(),
            Arc::clone(&connections),
            identities.clone(),
        ));
        let queue = Arc::new(PublishQueue::spawn(
            executor,
            subscriptions.clone(),
            Arc::clone(&connections),
            Arc::clone(&transport),
            config.chunk_size,
        ));
        let listener = InvalidationListener::spawn(
            Arc::clone(&store),
            subscriptions.clone(),
            Arc::clone(&connections),
            Arc::clone(&queue),
        );

        let (sweeper_shutdown, shutdown_rx) = bounded::<()>(1);
        let sweeper = {
            let connections = Arc::clone(&connections);
            let transport = Arc::clone(&transport);
            let timeout = config.handshake_timeout;
            let interval = config.handshake_sweep_interval;
            thread::spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        for id in connections.expired_negotiations(timeout) {
                            warn!(connection = %id, "handshake timed out, closing");
                            connections.remove(&id);
                            transport.close(&id);
                        }
                    }
                    _ => return,
                }
            })
        };

        Self {
            config,
            transport,
            registry,
            connections,
            subscriptions,
            queries,
            tags,
            identities,
            queue,
            listener,
            sweeper_shutdown,
            sweeper: Some(sweeper),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// A transport-level connection opened.
    pub fn handle_connect(&self, id: ConnectionId) {
        self.connections.register(id.clone());
        debug!(connection = %id, total = self.connections.count(), "connection opened");
    }

    /// One inbound text frame from a connection.
    pub fn handle_frame(&self, id: &ConnectionId, frame: &str) {
        let connection = match self.connections.get(id) {
            Some(connection) => connection,
            None => {
                warn!(connection = %id, "frame from unknown connection");
                return;
            }
        };
        let message = match protocol::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %id, error = %e, "undecodable frame");
                let response = protocol::error_message(0, e.wire_code());
                protocol::send_message(self.transport.as_ref(), &connection, &response);
                return;
            }
        };
        match connection.protocol_state() {
            ProtocolState::Negotiating => handshake::receive(
                &self.config.supported_versions,
                self.transport.as_ref(),
                &connection,
                &message,
            ),
            ProtocolState::Active(ProtocolVersion::V1) => {
                v1::receive(self, &connection, &message)
            }
        }
    }

    /// A transport-level connection closed. Unbinds everything it watched,
    /// collects queries nobody watches anymore, and re-syncs the listener.
    pub fn handle_disconnect(&self, id: &ConnectionId) {
        self.connections.remove(id);
        match self.subscriptions.cleanup(id) {
            Ok(queries) => {
                for query in &queries {
                    self.collect_query(query);
                }
                debug!(connection = %id, queries = queries.len(), "connection cleaned up");
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "subscription cleanup failed");
            }
        }
        if let Err(e) = self.listener.reconcile() {
            warn!(error = %e, "reconcile after disconnect failed");
        }
    }

    /// Queue a broadcast for every query bound to any of `tags` (deduplicated
    /// across tags). Returns how many queries were enqueued. This is the
    /// entry point for invalidations raised outside the wire protocol.
    pub fn invalidate_tags(&self, tags: &[Tag]) -> Result<usize> {
        let queries = self.tags.query_ids_for_any(tags)?;
        let enqueued = queries.len();
        for query in queries {
            self.queue.publish(query);
        }
        Ok(enqueued)
    }

    pub(crate) fn session_new(&self, connection: &Connection) -> Result<NewIdentity> {
        let identity = self.identities.create()?;
        connection.set_identity(identity.id.clone());
        debug!(connection = %connection.id(), identity = %identity.id, "identity created");
        Ok(identity)
    }

    pub(crate) fn session_reuse(
        &self,
        connection: &Connection,
        session: &IdentityId,
        signature: &str,
        timestamp: i64,
    ) -> Result<()> {
        self.identities.authenticate(session, signature, timestamp)?;
        connection.set_identity(session.clone());
        debug!(connection = %connection.id(), identity = %session, "identity reused");
        Ok(())
    }

    pub(crate) fn subscribe(
        &self,
        connection: &Connection,
        name: &str,
        params: QueryParams,
    ) -> Result<QueryId> {
        let identity = self.require_identity(connection)?;
        let publication = self
            .registry
            .publication(name)
            .ok_or_else(|| GatewayError::UnknownPublication(name.to_string()))?;
        if !publication.authorize(&params, &self.identities.data(&identity))? {
            return Err(GatewayError::Unauthorized);
        }

        let scope = if publication.is_identity_scoped() {
            Some(&identity)
        } else {
            None
        };
        let query = QueryId::digest(name, &params, scope)?;

        self.subscriptions.bind(connection.id(), &query)?;
        if !self.queries.exists(&query)? {
            self.queries.create(&query, name, &params)?;
        }
        if let Err(e) = self.listener.reconcile() {
            warn!(error = %e, "reconcile after subscribe failed");
        }
        // Initial data jumps the broadcast backlog.
        self.queue.publish_to(query.clone(), connection.id().clone());
        debug!(connection = %connection.id(), query = %query, publication = name, "subscribed");
        Ok(query)
    }

    pub(crate) fn unsubscribe(&self, connection: &Connection, query: &QueryId) -> Result<()> {
        self.require_identity(connection)?;
        self.subscriptions.unbind(connection.id(), query)?;
        self.collect_query(query);
        if let Err(e) = self.listener.reconcile() {
            warn!(error = %e, "reconcile after unsubscribe failed");
        }
        debug!(connection = %connection.id(), query = %query, "unsubscribed");
        Ok(())
    }

    pub(crate) fn execute_action(
        &self,
        connection: &Connection,
        name: &str,
        params: &QueryParams,
    ) -> Result<Value> {
        let identity = self.require_identity(connection)?;
        let action = self
            .registry
            .action(name)
            .ok_or_else(|| GatewayError::UnknownAction(name.to_string()))?;
        let data = self.identities.data(&identity);
        if !action.authorize(params, &data)? {
            return Err(GatewayError::Unauthorized);
        }
        let outcome = action.exec(params, &data)?;
        let enqueued = self.invalidate_tags(&outcome.affected_tags)?;
        debug!(
            connection = %connection.id(),
            action = name,
            queries = enqueued,
            "action executed"
        );
        Ok(outcome.payload)
    }

    fn require_identity(&self, connection: &Connection) -> Result<IdentityId> {
        connection.identity_id().ok_or(GatewayError::Unauthorized)
    }

    /// Drop a query's record and tag bindings once nobody subscribes to it.
    /// Best effort: a failure here leaves garbage, never breaks a caller.
    fn collect_query(&self, query: &QueryId) {
        match self.subscriptions.connections_for(query) {
            Ok(connections) if connections.is_empty() => {
                if let Err(e) = self.queries.cleanup(query) {
                    warn!(query = %query, error = %e, "query cleanup failed");
                    return;
                }
                if let Err(e) = self.tags.cleanup_query_id(query) {
                    warn!(query = %query, error = %e, "tag cleanup failed");
                    return;
                }
                debug!(query = %query, "collected unwatched query");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(query = %query, error = %e, "subscriber check failed");
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.sweeper_shutdown.send(());
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.join();
        }
    }
}
