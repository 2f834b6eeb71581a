//! Core types for the subscription gateway.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Arbitrary parameters a query is parameterized by.
///
/// Serialized with sorted object keys (serde_json's default map), which keeps
/// the [`QueryId`] digest canonical across clients.
pub type QueryParams = serde_json::Value;

/// Unique identifier for a live connection. Assigned by the transport.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an authenticated identity, stable across reconnects.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        IdentityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", self.0)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identifier for a query (publication + params, plus the
/// identity for identity-scoped publications).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    /// Compute the digest for a query. Same inputs always yield the same id.
    pub fn digest(
        publication: &str,
        params: &QueryParams,
        identity: Option<&IdentityId>,
    ) -> Result<Self, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(publication.as_bytes());
        hasher.update(b"\n");
        hasher.update(serde_json::to_string(params)?.as_bytes());
        if let Some(identity) = identity {
            hasher.update(b"\n");
            hasher.update(identity.as_str().as_bytes());
        }
        Ok(QueryId(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for QueryId {
    fn from(s: String) -> Self {
        QueryId(s)
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        QueryId(s.to_string())
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({}...)", &self.0[..self.0.len().min(8)])
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque label attached to a query's last result; invalidation is keyed by it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Tag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag(s.to_string())
    }
}

impl From<String> for Tag {
    fn from(s: String) -> Self {
        Tag(s)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a publication returns: the payload to deliver plus the tags the
/// result depends on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicationResult {
    pub result: serde_json::Value,
    pub tags: Vec<Tag>,
}

/// What an action returns: the payload for the caller plus the tags its
/// mutation affected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub payload: serde_json::Value,
    pub affected_tags: Vec<Tag>,
}

/// Milliseconds since Unix epoch. Signature timestamps use this clock.
pub fn epoch_millis() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    duration.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_id_deterministic() {
        let params = json!({"a": 1, "x": 5});
        let first = QueryId::digest("rooms", &params, None).unwrap();
        let second = QueryId::digest("rooms", &params, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_query_id_key_order_insensitive() {
        let a: QueryParams = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: QueryParams = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(
            QueryId::digest("rooms", &a, None).unwrap(),
            QueryId::digest("rooms", &b, None).unwrap()
        );
    }

    #[test]
    fn test_query_id_varies_by_inputs() {
        let params = json!({"a": 1});
        let base = QueryId::digest("rooms", &params, None).unwrap();
        assert_ne!(
            base,
            QueryId::digest("rooms", &json!({"a": 2}), None).unwrap()
        );
        assert_ne!(base, QueryId::digest("users", &params, None).unwrap());
        let identity = IdentityId::new("i1");
        assert_ne!(
            base,
            QueryId::digest("rooms", &params, Some(&identity)).unwrap()
        );
    }

    #[test]
    fn test_query_id_identity_scoping() {
        let params = json!({"a": 1});
        let alice = IdentityId::new("alice");
        let bob = IdentityId::new("bob");
        assert_ne!(
            QueryId::digest("inbox", &params, Some(&alice)).unwrap(),
            QueryId::digest("inbox", &params, Some(&bob)).unwrap()
        );
    }

    #[test]
    fn test_newtype_serde_transparent() {
        let tag = Tag::new("room:42");
        assert_eq!(serde_json::to_string(&tag).unwrap(), r#""room:42""#);
        let back: Tag = serde_json::from_str(r#""room:42""#).unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn test_debug_truncates_query_id() {
        let id = QueryId::digest("rooms", &json!({}), None).unwrap();
        let debug = format!("{:?}", id);
        assert!(debug.starts_with("QueryId("));
        assert!(debug.len() < id.as_str().len());
    }
}
