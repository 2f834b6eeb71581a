//! Identity issuance, signed reuse, and per-identity data.
//!
//! An identity outlives any single connection. It is created once with a
//! high-entropy secret, and reclaimed on later connections by presenting a
//! signature over the id, the secret, and a fresh timestamp. Identity records
//! live in the shared store so any sibling process can authenticate a
//! returning client.

use crate::error::{GatewayError, Result};
use crate::store::{Batch, Store};
use crate::types::{epoch_millis, IdentityId, QueryParams};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const SECRET_FIELD: &str = "secret";
const ID_LENGTH: usize = 12;
const SECRET_BYTES: usize = 64;

fn identity_key(id: &IdentityId) -> String {
    format!("identity:{id}")
}

fn identity_data_key(id: &IdentityId) -> String {
    format!("identity:{id}:data")
}

/// Freshly issued identity. The secret is handed to the client exactly once.
#[derive(Clone, Debug)]
pub struct NewIdentity {
    pub id: IdentityId,
    pub secret: String,
}

/// Compute the reuse signature for an identity at a given timestamp.
///
/// Clients derive the same value from the secret they were issued; the server
/// recomputes it from the stored secret and compares.
pub fn sign(id: &IdentityId, secret: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}_{}", id.as_str(), secret, timestamp).as_bytes());
    hex::encode(hasher.finalize())
}

/// Issues identities and validates signed reuse.
#[derive(Clone)]
pub struct IdentityManager {
    store: Arc<dyn Store>,
    signature_timeout: Duration,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn Store>, signature_timeout: Duration) -> Self {
        Self {
            store,
            signature_timeout,
        }
    }

    /// Create a new identity with a random id and secret.
    pub fn create(&self) -> Result<NewIdentity> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_LENGTH)
            .map(char::from)
            .collect();
        let id = IdentityId::new(id);

        let mut secret_bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = hex::encode(secret_bytes);

        self.store
            .hash_set(&identity_key(&id), SECRET_FIELD, &secret)?;
        Ok(NewIdentity { id, secret })
    }

    /// Validate a reuse attempt. Unknown id, signature mismatch, and stale
    /// timestamp all fail identically.
    pub fn authenticate(&self, id: &IdentityId, signature: &str, timestamp: i64) -> Result<()> {
        let secret = self
            .store
            .hash_get(&identity_key(id), SECRET_FIELD)?
            .ok_or(GatewayError::AuthenticationFailed)?;
        if signature != sign(id, &secret, timestamp) {
            return Err(GatewayError::AuthenticationFailed);
        }
        let age = epoch_millis() - timestamp;
        if age > self.signature_timeout.as_millis() as i64 {
            return Err(GatewayError::AuthenticationFailed);
        }
        Ok(())
    }

    /// Accessor for the identity's data fields.
    pub fn data(&self, id: &IdentityId) -> IdentityData {
        IdentityData::new(Arc::clone(&self.store), id.clone())
    }

    /// Remove the identity record and its data.
    pub fn cleanup(&self, id: &IdentityId) -> Result<()> {
        let mut batch = Batch::new();
        batch
            .delete_key(identity_key(id))
            .delete_key(identity_data_key(id));
        self.store.exec_batch(batch)
    }
}

/// Per-identity key/value data, shared across the identity's connections and
/// across processes. Values are JSON; integer fields additionally support
/// atomic increment.
///
/// Handed to identity-scoped publications, actions, and authorize hooks.
#[derive(Clone)]
pub struct IdentityData {
    store: Arc<dyn Store>,
    id: IdentityId,
}

impl IdentityData {
    pub fn new(store: Arc<dyn Store>, id: IdentityId) -> Self {
        Self { store, id }
    }

    pub fn identity_id(&self) -> &IdentityId {
        &self.id
    }

    pub fn get(&self, field: &str) -> Result<Option<QueryParams>> {
        match self.store.hash_get(&identity_data_key(&self.id), field)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, field: &str, value: &QueryParams) -> Result<()> {
        self.store.hash_set(
            &identity_data_key(&self.id),
            field,
            &serde_json::to_string(value)?,
        )
    }

    pub fn delete(&self, field: &str) -> Result<()> {
        self.store.hash_delete(&identity_data_key(&self.id), field)
    }

    pub fn increment(&self, field: &str, delta: i64) -> Result<i64> {
        self.store
            .hash_increment(&identity_data_key(&self.id), field, delta)
    }
}
