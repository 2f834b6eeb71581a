//! Single-flight publish queue.
//!
//! Exactly one worker thread executes jobs, one at a time, in submission
//! order. Broadcast jobs append at the back; priority jobs (initial delivery
//! after a subscribe) insert at the front so a new subscriber never waits
//! behind a backlog of invalidations. Serializing every execution through one
//! worker is what keeps concurrent invalidation triggers for the same query
//! from racing each other's tag updates.

use crate::connection::ConnectionRegistry;
use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::protocol;
use crate::subscriptions::SubscriptionIndex;
use crate::transport::Transport;
use crate::types::{ConnectionId, QueryId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// One unit of work: re-execute a query and deliver the result.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishJob {
    pub query: QueryId,
    /// `None` broadcasts to every subscriber bound at processing time.
    pub target: Option<ConnectionId>,
}

struct QueueState {
    jobs: VecDeque<PublishJob>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// Handle to the queue. Dropping it stops the worker after the job in
/// flight, discarding the rest of the backlog.
pub struct PublishQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PublishQueue {
    pub fn spawn(
        executor: Arc<QueryExecutor>,
        subscriptions: SubscriptionIndex,
        connections: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        chunk_size: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            run_worker(
                worker_shared,
                executor,
                subscriptions,
                connections,
                transport,
                chunk_size,
            );
        });
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Broadcast to every subscriber of the query. Appends at the back.
    pub fn publish(&self, query: QueryId) {
        self.push(PublishJob { query, target: None }, false);
    }

    /// Deliver to one connection ahead of the backlog. Inserts at the front.
    pub fn publish_to(&self, query: QueryId, connection: ConnectionId) {
        self.push(
            PublishJob {
                query,
                target: Some(connection),
            },
            true,
        );
    }

    /// Jobs waiting in the queue, not counting one in flight.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    fn push(&self, job: PublishJob, front: bool) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        if front {
            state.jobs.push_front(job);
        } else {
            state.jobs.push_back(job);
        }
        self.shared.available.notify_one();
    }
}

impl Drop for PublishQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.available.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    executor: Arc<QueryExecutor>,
    subscriptions: SubscriptionIndex,
    connections: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    chunk_size: usize,
) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                shared.available.wait(&mut state);
            }
        };
        if let Err(e) = process_job(
            &job,
            &executor,
            &subscriptions,
            &connections,
            transport.as_ref(),
            chunk_size,
        ) {
            // Failed jobs are dropped; the worker moves on.
            warn!(query = %job.query, error = %e, "publish job failed");
        }
    }
}

fn process_job(
    job: &PublishJob,
    executor: &QueryExecutor,
    subscriptions: &SubscriptionIndex,
    connections: &ConnectionRegistry,
    transport: &dyn Transport,
    chunk_size: usize,
) -> Result<()> {
    // Targets are resolved now, not at enqueue time, so late subscribers
    // are included and unsubscribed ones are not.
    let targets = match &job.target {
        Some(connection) => vec![connection.clone()],
        None => subscriptions.connections_for(&job.query)?,
    };

    let result = executor.execute(&job.query)?;

    for connection_id in &targets {
        match connections.get(connection_id) {
            Some(handle) => {
                protocol::emit_query_data(transport, &handle, &job.query, &result, chunk_size);
            }
            None => {
                debug!(connection = %connection_id, "target gone before delivery, skipping");
            }
        }
    }
    debug!(query = %job.query, targets = targets.len(), "publish job processed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityManager;
    use crate::protocol::ProtocolVersion;
    use crate::registry::{Publication, Registry};
    use crate::store::MemoryStore;
    use crate::subscriptions::{QueryStore, TagIndex};
    use crate::types::PublicationResult;
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<(ConnectionId, String)>>,
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<(ConnectionId, String)> {
            self.frames.lock().clone()
        }

        fn delivered(&self) -> Vec<(ConnectionId, QueryId)> {
            self.frames()
                .iter()
                .map(|(conn, frame)| {
                    let message = crate::protocol::decode(frame).unwrap();
                    let id = message.payload.get("id").and_then(|v| v.as_str()).unwrap();
                    (conn.clone(), QueryId::from(id))
                })
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, connection: &ConnectionId, frame: &str) -> Result<()> {
            self.frames.lock().push((connection.clone(), frame.to_string()));
            Ok(())
        }

        fn close(&self, _connection: &ConnectionId) {}
    }

    struct Rig {
        queue: PublishQueue,
        queries: QueryStore,
        subscriptions: SubscriptionIndex,
        connections: Arc<ConnectionRegistry>,
        transport: Arc<RecordingTransport>,
    }

    fn rig(registry: Registry) -> Rig {
        let store: Arc<dyn crate::store::Store> = Arc::new(MemoryStore::new());
        let queries = QueryStore::new(Arc::clone(&store));
        let tags = TagIndex::new(Arc::clone(&store));
        let subscriptions = SubscriptionIndex::new(Arc::clone(&store));
        let connections = Arc::new(ConnectionRegistry::new());
        let identities = IdentityManager::new(Arc::clone(&store), Duration::from_secs(60));
        let executor = Arc::new(QueryExecutor::new(
            Arc::new(registry),
            queries.clone(),
            tags,
            subscriptions.clone(),
            Arc::clone(&connections),
            identities,
        ));
        let transport = Arc::new(RecordingTransport::default());
        let queue = PublishQueue::spawn(
            executor,
            subscriptions.clone(),
            Arc::clone(&connections),
            Arc::clone(&transport) as Arc<dyn Transport>,
            4096,
        );
        Rig {
            queue,
            queries,
            subscriptions,
            connections,
            transport,
        }
    }

    fn echo_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .add_publication(Publication::shared("echo", |params| {
                Ok(PublicationResult {
                    result: params.clone(),
                    tags: vec![],
                })
            }))
            .unwrap();
        registry
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn active_connection(rig: &Rig, id: &str) -> ConnectionId {
        let conn = ConnectionId::new(id);
        rig.connections.register(conn.clone()).activate(ProtocolVersion::V1);
        conn
    }

    #[test]
    fn test_broadcast_reaches_all_current_subscribers() {
        let rig = rig(echo_registry());
        let c1 = active_connection(&rig, "c1");
        let c2 = active_connection(&rig, "c2");
        active_connection(&rig, "bystander");

        let q = QueryId::from("q1");
        rig.queries.create(&q, "echo", &json!({"x": 1})).unwrap();
        rig.subscriptions.bind(&c1, &q).unwrap();
        rig.subscriptions.bind(&c2, &q).unwrap();

        rig.queue.publish(q.clone());
        assert!(wait_until(Duration::from_secs(2), || {
            rig.transport.frames().len() == 2
        }));

        let delivered = rig.transport.delivered();
        assert!(delivered.contains(&(c1, q.clone())));
        assert!(delivered.contains(&(c2, q)));
    }

    #[test]
    fn test_publish_to_targets_one_connection() {
        let rig = rig(echo_registry());
        let c1 = active_connection(&rig, "c1");
        let c2 = active_connection(&rig, "c2");

        let q = QueryId::from("q1");
        rig.queries.create(&q, "echo", &json!({})).unwrap();
        rig.subscriptions.bind(&c1, &q).unwrap();
        rig.subscriptions.bind(&c2, &q).unwrap();

        rig.queue.publish_to(q.clone(), c1.clone());
        assert!(wait_until(Duration::from_secs(2), || {
            !rig.transport.frames().is_empty()
        }));
        thread::sleep(Duration::from_millis(30));

        assert_eq!(rig.transport.delivered(), vec![(c1, q)]);
    }

    #[test]
    fn test_missing_handle_skipped_silently() {
        let rig = rig(echo_registry());
        let live = active_connection(&rig, "live");
        let ghost = ConnectionId::new("ghost");

        let q = QueryId::from("q1");
        rig.queries.create(&q, "echo", &json!({})).unwrap();
        rig.subscriptions.bind(&live, &q).unwrap();
        rig.subscriptions.bind(&ghost, &q).unwrap();

        rig.queue.publish(q.clone());
        assert!(wait_until(Duration::from_secs(2), || {
            !rig.transport.frames().is_empty()
        }));
        thread::sleep(Duration::from_millis(30));

        assert_eq!(rig.transport.delivered(), vec![(live, q)]);
    }

    #[test]
    fn test_failed_job_does_not_stop_worker() {
        let mut registry = echo_registry();
        registry
            .add_publication(Publication::shared("broken", |_| {
                Err(crate::error::GatewayError::PublicationFailed("nope".into()))
            }))
            .unwrap();
        let rig = rig(registry);
        let conn = active_connection(&rig, "c1");

        let bad = QueryId::from("bad");
        let good = QueryId::from("good");
        rig.queries.create(&bad, "broken", &json!({})).unwrap();
        rig.queries.create(&good, "echo", &json!({"ok": true})).unwrap();
        rig.subscriptions.bind(&conn, &bad).unwrap();
        rig.subscriptions.bind(&conn, &good).unwrap();

        rig.queue.publish(bad);
        rig.queue.publish(good.clone());

        assert!(wait_until(Duration::from_secs(2), || {
            rig.transport.delivered().contains(&(conn.clone(), good.clone()))
        }));
        assert_eq!(rig.transport.frames().len(), 1);
    }

    #[test]
    fn test_priority_job_jumps_backlog() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let mut registry = echo_registry();
        registry
            .add_publication(Publication::shared("slow", move |params| {
                // Holds the worker until the test releases it.
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                Ok(PublicationResult {
                    result: params.clone(),
                    tags: vec![],
                })
            }))
            .unwrap();
        let rig = rig(registry);
        let conn = active_connection(&rig, "c1");

        let slow = QueryId::from("slow-q");
        let backlog = QueryId::from("backlog-q");
        let urgent = QueryId::from("urgent-q");
        rig.queries.create(&slow, "slow", &json!({})).unwrap();
        rig.queries.create(&backlog, "echo", &json!({})).unwrap();
        rig.queries.create(&urgent, "echo", &json!({})).unwrap();
        for q in [&slow, &backlog, &urgent] {
            rig.subscriptions.bind(&conn, q).unwrap();
        }

        rig.queue.publish(slow.clone());
        // Give the worker time to pick up the slow job before queueing more.
        assert!(wait_until(Duration::from_secs(2), || rig.queue.pending() == 0));
        rig.queue.publish(backlog.clone());
        rig.queue.publish_to(urgent.clone(), conn.clone());
        gate_tx.send(()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            rig.transport.frames().len() == 3
        }));
        let order: Vec<QueryId> = rig
            .transport
            .delivered()
            .into_iter()
            .map(|(_, q)| q)
            .collect();
        assert_eq!(order, vec![slow, urgent, backlog]);
    }
}
