//! Connection ↔ query subscription sets.

use crate::error::Result;
use crate::store::{Batch, Store};
use crate::types::{ConnectionId, QueryId};
use std::sync::Arc;

fn connection_key(connection: &ConnectionId) -> String {
    format!("connection:{connection}:queries")
}

fn query_key(query: &QueryId) -> String {
    format!("query:{query}:connections")
}

/// Many-to-many relation between connections and the queries they watch.
///
/// Both directions live in the store so sibling processes see the same
/// bindings. Every mutation is an atomic batch covering both directions, and
/// every mutation is idempotent: re-binding a bound pair or unbinding an
/// unbound pair is a no-op.
#[derive(Clone)]
pub struct SubscriptionIndex {
    store: Arc<dyn Store>,
}

impl SubscriptionIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn bind(&self, connection: &ConnectionId, query: &QueryId) -> Result<()> {
        let mut batch = Batch::new();
        batch
            .set_add(connection_key(connection), query.as_str())
            .set_add(query_key(query), connection.as_str());
        self.store.exec_batch(batch)
    }

    pub fn unbind(&self, connection: &ConnectionId, query: &QueryId) -> Result<()> {
        let mut batch = Batch::new();
        batch
            .set_remove(connection_key(connection), query.as_str())
            .set_remove(query_key(query), connection.as_str());
        self.store.exec_batch(batch)
    }

    pub fn queries_for(&self, connection: &ConnectionId) -> Result<Vec<QueryId>> {
        Ok(self
            .store
            .set_members(&connection_key(connection))?
            .into_iter()
            .map(QueryId::from)
            .collect())
    }

    pub fn connections_for(&self, query: &QueryId) -> Result<Vec<ConnectionId>> {
        Ok(self
            .store
            .set_members(&query_key(query))?
            .into_iter()
            .map(ConnectionId::new)
            .collect())
    }

    /// Arbitrary subscriber of a query, if any. Used to pick the identity
    /// backing an identity-scoped execution.
    pub fn one_connection_for(&self, query: &QueryId) -> Result<Option<ConnectionId>> {
        Ok(self
            .store
            .set_random_member(&query_key(query))?
            .map(ConnectionId::new))
    }

    /// Every query any of the given connections watches. Callers pass the
    /// live local connections; channel subscriptions are per-process.
    pub fn active_query_ids(&self, connections: &[ConnectionId]) -> Result<Vec<QueryId>> {
        let keys: Vec<String> = connections.iter().map(connection_key).collect();
        Ok(self
            .store
            .set_union(&keys)?
            .into_iter()
            .map(QueryId::from)
            .collect())
    }

    /// Drop every binding the connection holds, atomically, and return the
    /// queries it was watching.
    pub fn cleanup(&self, connection: &ConnectionId) -> Result<Vec<QueryId>> {
        let queries = self.queries_for(connection)?;
        let mut batch = Batch::new();
        for query in &queries {
            batch.set_remove(query_key(query), connection.as_str());
        }
        batch.delete_key(connection_key(connection));
        self.store.exec_batch(batch)?;
        Ok(queries)
    }
}
