//! Query execution.

use crate::connection::ConnectionRegistry;
use crate::error::{GatewayError, Result};
use crate::identity::IdentityManager;
use crate::registry::{PublicationExec, Registry};
use crate::subscriptions::{QueryStore, SubscriptionIndex, TagIndex};
use crate::types::QueryId;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Turns a query id back into a publication call and keeps the tag index
/// accurate with whatever the call reported.
pub struct QueryExecutor {
    registry: Arc<Registry>,
    queries: QueryStore,
    tags: TagIndex,
    subscriptions: SubscriptionIndex,
    connections: Arc<ConnectionRegistry>,
    identities: IdentityManager,
}

impl QueryExecutor {
    pub fn new(
        registry: Arc<Registry>,
        queries: QueryStore,
        tags: TagIndex,
        subscriptions: SubscriptionIndex,
        connections: Arc<ConnectionRegistry>,
        identities: IdentityManager,
    ) -> Self {
        Self {
            registry,
            queries,
            tags,
            subscriptions,
            connections,
            identities,
        }
    }

    /// Execute the query and refresh its tag bindings from the result.
    ///
    /// Identity-scoped publications run with an arbitrary subscriber's
    /// identity. The identity id is part of the query digest, so every
    /// subscriber of a scoped query shares one identity; a pick that cannot
    /// be resolved locally (foreign process, raced disconnect) degrades to
    /// the same transient failure as having no subscribers at all.
    pub fn execute(&self, query: &QueryId) -> Result<Value> {
        let record = self
            .queries
            .resolve(query)?
            .ok_or_else(|| GatewayError::UnknownQuery(query.clone()))?;
        let publication = self
            .registry
            .publication(&record.publication)
            .ok_or_else(|| GatewayError::UnknownPublication(record.publication.clone()))?;

        let outcome = match publication.exec() {
            PublicationExec::Shared(exec) => exec(&record.params)?,
            PublicationExec::IdentityScoped(exec) => {
                let connection = self
                    .subscriptions
                    .one_connection_for(query)?
                    .ok_or_else(|| GatewayError::NoSubscribers(query.clone()))?;
                let identity = self
                    .connections
                    .get(&connection)
                    .and_then(|handle| handle.identity_id())
                    .ok_or_else(|| GatewayError::NoSubscribers(query.clone()))?;
                exec(&record.params, &self.identities.data(&identity))?
            }
        };

        self.tags.update(query, &outcome.tags)?;
        debug!(query = %query, tags = outcome.tags.len(), "query executed");
        Ok(outcome.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Publication;
    use crate::store::MemoryStore;
    use crate::types::{ConnectionId, PublicationResult, Tag};
    use serde_json::json;

    struct Rig {
        executor: QueryExecutor,
        queries: QueryStore,
        tags: TagIndex,
        subscriptions: SubscriptionIndex,
        connections: Arc<ConnectionRegistry>,
        identities: IdentityManager,
    }

    fn rig(registry: Registry) -> Rig {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let store: Arc<dyn crate::store::Store> = store;
        let queries = QueryStore::new(Arc::clone(&store));
        let tags = TagIndex::new(Arc::clone(&store));
        let subscriptions = SubscriptionIndex::new(Arc::clone(&store));
        let connections = Arc::new(ConnectionRegistry::new());
        let identities =
            IdentityManager::new(Arc::clone(&store), std::time::Duration::from_secs(60));
        let executor = QueryExecutor::new(
            Arc::new(registry),
            queries.clone(),
            tags.clone(),
            subscriptions.clone(),
            Arc::clone(&connections),
            identities.clone(),
        );
        Rig {
            executor,
            queries,
            tags,
            subscriptions,
            connections,
            identities,
        }
    }

    fn shared_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .add_publication(Publication::shared("rooms", |params| {
                let floor = params.get("floor").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(PublicationResult {
                    result: json!({"rooms": [floor]}),
                    tags: vec![Tag::new(format!("floor:{floor}"))],
                })
            }))
            .unwrap();
        registry
    }

    #[test]
    fn test_shared_execution_returns_result_and_tags() {
        let rig = rig(shared_registry());
        let q = QueryId::from("q1");
        rig.queries.create(&q, "rooms", &json!({"floor": 3})).unwrap();

        let result = rig.executor.execute(&q).unwrap();
        assert_eq!(result, json!({"rooms": [3]}));
        assert_eq!(rig.tags.tags_for(&q).unwrap(), vec![Tag::new("floor:3")]);
    }

    #[test]
    fn test_unknown_query() {
        let rig = rig(shared_registry());
        let err = rig.executor.execute(&QueryId::from("missing")).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownQuery(_)));
    }

    #[test]
    fn test_unknown_publication() {
        let rig = rig(shared_registry());
        let q = QueryId::from("q1");
        rig.queries.create(&q, "unregistered", &json!({})).unwrap();
        let err = rig.executor.execute(&q).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownPublication(name) if name == "unregistered"));
    }

    #[test]
    fn test_publication_failure_propagates() {
        let mut registry = Registry::new();
        registry
            .add_publication(Publication::shared("broken", |_| {
                Err(GatewayError::PublicationFailed("backend down".into()))
            }))
            .unwrap();
        let rig = rig(registry);
        let q = QueryId::from("q1");
        rig.queries.create(&q, "broken", &json!({})).unwrap();
        assert!(matches!(
            rig.executor.execute(&q).unwrap_err(),
            GatewayError::PublicationFailed(_)
        ));
        // Failed runs must not touch the tag index.
        assert!(rig.tags.tags_for(&q).unwrap().is_empty());
    }

    #[test]
    fn test_identity_scoped_uses_subscriber_identity() {
        let mut registry = Registry::new();
        registry
            .add_publication(Publication::identity_scoped("inbox", |_, identity| {
                Ok(PublicationResult {
                    result: json!({"for": identity.identity_id().as_str()}),
                    tags: vec![Tag::new(format!("inbox:{}", identity.identity_id()))],
                })
            }))
            .unwrap();
        let rig = rig(registry);

        let identity = rig.identities.create().unwrap();
        let conn = ConnectionId::new("c1");
        let handle = rig.connections.register(conn.clone());
        handle.set_identity(identity.id.clone());

        let q = QueryId::from("q1");
        rig.queries.create(&q, "inbox", &json!({})).unwrap();
        rig.subscriptions.bind(&conn, &q).unwrap();

        let result = rig.executor.execute(&q).unwrap();
        assert_eq!(result, json!({"for": identity.id.as_str()}));
        assert_eq!(
            rig.tags.tags_for(&q).unwrap(),
            vec![Tag::new(format!("inbox:{}", identity.id))]
        );
    }

    #[test]
    fn test_identity_scoped_without_subscribers() {
        let mut registry = Registry::new();
        registry
            .add_publication(Publication::identity_scoped("inbox", |_, _| {
                Ok(PublicationResult {
                    result: json!([]),
                    tags: vec![],
                })
            }))
            .unwrap();
        let rig = rig(registry);
        let q = QueryId::from("q1");
        rig.queries.create(&q, "inbox", &json!({})).unwrap();

        assert!(matches!(
            rig.executor.execute(&q).unwrap_err(),
            GatewayError::NoSubscribers(_)
        ));
    }

    #[test]
    fn test_identity_scoped_subscriber_without_identity() {
        let mut registry = Registry::new();
        registry
            .add_publication(Publication::identity_scoped("inbox", |_, _| {
                Ok(PublicationResult {
                    result: json!([]),
                    tags: vec![],
                })
            }))
            .unwrap();
        let rig = rig(registry);

        let conn = ConnectionId::new("c1");
        rig.connections.register(conn.clone());
        let q = QueryId::from("q1");
        rig.queries.create(&q, "inbox", &json!({})).unwrap();
        rig.subscriptions.bind(&conn, &q).unwrap();

        assert!(matches!(
            rig.executor.execute(&q).unwrap_err(),
            GatewayError::NoSubscribers(_)
        ));
    }

    #[test]
    fn test_reexecution_refreshes_tags() {
        let mut registry = Registry::new();
        // Tags follow a counter in the store, so each run reports a different set.
        registry
            .add_publication(Publication::identity_scoped("ticker", |_, identity| {
                let n = identity.increment("runs", 1)?;
                Ok(PublicationResult {
                    result: json!(n),
                    tags: vec![Tag::new(format!("run:{n}"))],
                })
            }))
            .unwrap();
        let rig = rig(registry);

        let identity = rig.identities.create().unwrap();
        let conn = ConnectionId::new("c1");
        rig.connections
            .register(conn.clone())
            .set_identity(identity.id.clone());
        let q = QueryId::from("q1");
        rig.queries.create(&q, "ticker", &json!({})).unwrap();
        rig.subscriptions.bind(&conn, &q).unwrap();

        rig.executor.execute(&q).unwrap();
        assert_eq!(rig.tags.tags_for(&q).unwrap(), vec![Tag::new("run:1")]);
        rig.executor.execute(&q).unwrap();
        assert_eq!(rig.tags.tags_for(&q).unwrap(), vec![Tag::new("run:2")]);
        assert!(rig.tags.query_ids_for(&Tag::new("run:1")).unwrap().is_empty());
    }
}
