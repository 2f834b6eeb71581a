//! In-memory store implementation.

use crate::error::{GatewayError, Result};
use crate::store::{Batch, BatchOp, Store, StoreNotification};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct MemoryData {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
}

struct PubSub {
    subscribed: HashSet<String>,
    sender: Sender<StoreNotification>,
    receiver: Receiver<StoreNotification>,
}

/// In-process [`Store`] backed by hash maps.
///
/// All writes, batched or not, run under one data lock, so a batch is atomic
/// with respect to every reader. Pub/sub loops back through a channel:
/// publishing on this store behaves exactly like a foreign process publishing
/// on a shared backend, which is what tests use it for.
pub struct MemoryStore {
    data: Mutex<MemoryData>,
    pubsub: Mutex<PubSub>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            data: Mutex::new(MemoryData::default()),
            pubsub: Mutex::new(PubSub {
                subscribed: HashSet::new(),
                sender,
                receiver,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_op(data: &mut MemoryData, op: BatchOp) {
    match op {
        BatchOp::SetAdd { key, member } => {
            data.sets.entry(key).or_default().insert(member);
        }
        BatchOp::SetRemove { key, member } => {
            if let Some(set) = data.sets.get_mut(&key) {
                set.remove(&member);
                if set.is_empty() {
                    data.sets.remove(&key);
                }
            }
        }
        BatchOp::HashSet { key, field, value } => {
            data.hashes.entry(key).or_default().insert(field, value);
        }
        BatchOp::DeleteKey { key } => {
            data.hashes.remove(&key);
            data.sets.remove(&key);
        }
    }
}

impl Store for MemoryStore {
    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let data = self.data.lock();
        Ok(data
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    fn hash_get_many(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let data = self.data.lock();
        let hash = data.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(*field)).cloned())
            .collect())
    }

    fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock();
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut data = self.data.lock();
        if let Some(hash) = data.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                data.hashes.remove(key);
            }
        }
        Ok(())
    }

    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock();
        let hash = data.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| GatewayError::Store(format!("field {field} is not an integer")))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let data = self.data.lock();
        Ok(data
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn set_random_member(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.lock();
        Ok(data
            .sets
            .get(key)
            .and_then(|set| set.iter().choose(&mut rand::thread_rng()))
            .cloned())
    }

    fn set_union(&self, keys: &[String]) -> Result<Vec<String>> {
        let data = self.data.lock();
        let mut union = HashSet::new();
        for key in keys {
            if let Some(set) = data.sets.get(key) {
                union.extend(set.iter().cloned());
            }
        }
        Ok(union.into_iter().collect())
    }

    fn key_exists(&self, key: &str) -> Result<bool> {
        let data = self.data.lock();
        Ok(data.hashes.contains_key(key) || data.sets.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock();
        data.hashes.remove(key);
        data.sets.remove(key);
        Ok(())
    }

    fn exec_batch(&self, batch: Batch) -> Result<()> {
        let mut data = self.data.lock();
        for op in batch.ops {
            apply_op(&mut data, op);
        }
        Ok(())
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let pubsub = self.pubsub.lock();
        if pubsub.subscribed.contains(channel) {
            // Receiver side never closes while the store lives; a failed send
            // just means nobody is listening anymore.
            let _ = pubsub.sender.send(StoreNotification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<()> {
        let mut pubsub = self.pubsub.lock();
        pubsub.subscribed.insert(channel.to_string());
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut pubsub = self.pubsub.lock();
        pubsub.subscribed.remove(channel);
        Ok(())
    }

    fn notifications(&self) -> Receiver<StoreNotification> {
        self.pubsub.lock().receiver.clone()
    }
}
