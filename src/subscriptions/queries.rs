//! Query metadata records.

use crate::error::Result;
use crate::store::{Batch, Store};
use crate::types::{QueryId, QueryParams};
use std::sync::Arc;

const PUBLICATION_FIELD: &str = "publication";
const PARAMS_FIELD: &str = "params";

fn meta_key(query: &QueryId) -> String {
    format!("query:{query}")
}

/// What defines a query: the publication it runs and the params it was
/// subscribed with. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRecord {
    pub publication: String,
    pub params: QueryParams,
}

/// Store-backed map from query id to its defining record.
#[derive(Clone)]
pub struct QueryStore {
    store: Arc<dyn Store>,
}

impl QueryStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn exists(&self, query: &QueryId) -> Result<bool> {
        self.store.key_exists(&meta_key(query))
    }

    /// Write the record unless it already exists. The id is a digest of the
    /// record's contents, so a concurrent create writes the same bytes.
    pub fn create(&self, query: &QueryId, publication: &str, params: &QueryParams) -> Result<()> {
        if self.exists(query)? {
            return Ok(());
        }
        let mut batch = Batch::new();
        batch
            .hash_set(meta_key(query), PUBLICATION_FIELD, publication)
            .hash_set(meta_key(query), PARAMS_FIELD, serde_json::to_string(params)?);
        self.store.exec_batch(batch)
    }

    pub fn resolve(&self, query: &QueryId) -> Result<Option<QueryRecord>> {
        let mut values = self
            .store
            .hash_get_many(&meta_key(query), &[PUBLICATION_FIELD, PARAMS_FIELD])?
            .into_iter();
        let publication = values.next().flatten();
        let params = values.next().flatten();
        match (publication, params) {
            (Some(publication), Some(raw)) => Ok(Some(QueryRecord {
                publication,
                params: serde_json::from_str(&raw)?,
            })),
            _ => Ok(None),
        }
    }

    pub fn cleanup(&self, query: &QueryId) -> Result<()> {
        self.store.delete(&meta_key(query))
    }
}
