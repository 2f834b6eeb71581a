//! Invalidation listener.
//!
//! Sibling processes signal "this query's data changed" by publishing a
//! one-character payload on a per-query store channel. The listener keeps
//! this process subscribed to exactly the channels of its own connections'
//! active queries, and turns each notification into a broadcast publish job.
//! Reconciliation is coalesced: requests that arrive while a pass is running
//! fold into one follow-up pass instead of racing the channel set.

use crate::connection::ConnectionRegistry;
use crate::error::Result;
use crate::publish::PublishQueue;
use crate::store::{Store, StoreNotification};
use crate::subscriptions::SubscriptionIndex;
use crate::types::QueryId;
use crossbeam_channel::{bounded, select, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Payload published on a query channel to request re-execution.
pub const PUBLISH_PAYLOAD: &str = "P";

/// Store channel carrying invalidations for one query.
pub fn channel_for(query: &QueryId) -> String {
    format!("q{}", query)
}

fn query_id_for(channel: &str) -> Option<QueryId> {
    channel.strip_prefix('q').map(QueryId::from)
}

#[derive(Default)]
struct ReconcileFlags {
    reconciling: bool,
    pending: bool,
}

struct ListenerInner {
    store: Arc<dyn Store>,
    subscriptions: SubscriptionIndex,
    connections: Arc<ConnectionRegistry>,
    queue: Arc<PublishQueue>,
    subscribed: Mutex<HashSet<String>>,
    flags: Mutex<ReconcileFlags>,
}

impl ListenerInner {
    fn reconcile(&self) -> Result<()> {
        {
            let mut flags = self.flags.lock();
            if flags.reconciling {
                flags.pending = true;
                return Ok(());
            }
            flags.reconciling = true;
        }
        let mut outcome = self.pass();
        loop {
            let mut flags = self.flags.lock();
            if flags.pending {
                flags.pending = false;
                drop(flags);
                outcome = self.pass();
            } else {
                flags.reconciling = false;
                break;
            }
        }
        outcome
    }

    /// One convergence pass. The subscribed set is updated entry by entry so
    /// a failed store call leaves it matching what the store actually holds.
    fn pass(&self) -> Result<()> {
        let desired: HashSet<String> = self
            .subscriptions
            .active_query_ids(&self.connections.ids())?
            .iter()
            .map(channel_for)
            .collect();

        let mut subscribed = self.subscribed.lock();
        let missing: Vec<String> = desired.difference(&subscribed).cloned().collect();
        let stale: Vec<String> = subscribed.difference(&desired).cloned().collect();
        if missing.is_empty() && stale.is_empty() {
            return Ok(());
        }

        for channel in missing {
            self.store.subscribe(&channel)?;
            subscribed.insert(channel);
        }
        for channel in stale {
            self.store.unsubscribe(&channel)?;
            subscribed.remove(&channel);
        }
        debug!(channels = subscribed.len(), "reconciled invalidation channels");
        Ok(())
    }

    fn on_notification(&self, notification: StoreNotification) {
        // A notification can race an unsubscribe; drop it if the channel is
        // no longer tracked.
        if !self.subscribed.lock().contains(&notification.channel) {
            return;
        }
        if notification.payload != PUBLISH_PAYLOAD {
            return;
        }
        match query_id_for(&notification.channel) {
            Some(query) => {
                debug!(query = %query, "invalidation notification");
                self.queue.publish(query);
            }
            None => {
                warn!(channel = %notification.channel, "invalidation on unparsable channel");
            }
        }
    }
}

/// Handle to the listener. Dropping it stops the notification thread; store
/// channel subscriptions are left to the store connection's own teardown.
pub struct InvalidationListener {
    inner: Arc<ListenerInner>,
    shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl InvalidationListener {
    pub fn spawn(
        store: Arc<dyn Store>,
        subscriptions: SubscriptionIndex,
        connections: Arc<ConnectionRegistry>,
        queue: Arc<PublishQueue>,
    ) -> Self {
        let notifications = store.notifications();
        let inner = Arc::new(ListenerInner {
            store,
            subscriptions,
            connections,
            queue,
            subscribed: Mutex::new(HashSet::new()),
            flags: Mutex::new(ReconcileFlags::default()),
        });
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let worker_inner = Arc::clone(&inner);
        let worker = thread::spawn(move || loop {
            select! {
                recv(notifications) -> notification => match notification {
                    Ok(notification) => worker_inner.on_notification(notification),
                    Err(_) => return,
                },
                recv(shutdown_rx) -> _ => return,
            }
        });
        Self {
            inner,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Bring channel subscriptions in line with the active query set.
    /// Requests made while a pass is in flight coalesce into one extra pass.
    pub fn reconcile(&self) -> Result<()> {
        self.inner.reconcile()
    }

    /// Whether this process currently listens for the query's invalidations.
    pub fn is_tracking(&self, query: &QueryId) -> bool {
        self.inner.subscribed.lock().contains(&channel_for(query))
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.subscribed.lock().len()
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
