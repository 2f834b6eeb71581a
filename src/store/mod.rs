//! External store contract.
//!
//! The gateway keeps all shared state (subscriptions, tags, query metadata,
//! identities) in an associative store so several server processes can share
//! one source of truth. The contract is small: hash fields, sets, atomic
//! write batches, and pub/sub channels. [`memory::MemoryStore`] implements it
//! in-process for tests and single-node embeddings.

pub mod memory;

use crate::error::Result;
use crossbeam_channel::Receiver;

pub use memory::MemoryStore;

/// A pub/sub message delivered for a channel this process subscribed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreNotification {
    pub channel: String,
    pub payload: String,
}

/// One write inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    HashSet { key: String, field: String, value: String },
    DeleteKey { key: String },
}

/// An ordered list of writes applied atomically: no reader observes a state
/// where only some of them have landed.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn hash_set(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(BatchOp::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::DeleteKey { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// The associative store the gateway shares with its sibling processes.
///
/// Empty sets and hashes do not exist: removing the last member of a set (or
/// the last field of a hash) deletes the key, as Redis does.
pub trait Store: Send + Sync {
    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    fn hash_get_many(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    /// Add `delta` to an integer hash field (missing field counts as 0) and
    /// return the new value.
    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Uniformly random member of the set, or `None` if the key is absent.
    fn set_random_member(&self, key: &str) -> Result<Option<String>>;

    /// Deduplicated union of the sets at `keys`. Absent keys contribute
    /// nothing.
    fn set_union(&self, keys: &[String]) -> Result<Vec<String>>;

    fn key_exists(&self, key: &str) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Apply every write in the batch atomically, in order.
    fn exec_batch(&self, batch: Batch) -> Result<()>;

    /// Publish a payload on a channel. Delivered to every process currently
    /// subscribed to it, including this one.
    fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    fn subscribe(&self, channel: &str) -> Result<()>;

    fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Receiver for notifications on subscribed channels. One consumer per
    /// process; messages are not duplicated across cloned receivers.
    fn notifications(&self) -> Receiver<StoreNotification>;
}
