//! # Ripple
//!
//! The reactive subscription core of a real-time messaging gateway: clients
//! negotiate a wire protocol version, authenticate as an identity, watch
//! named publications, and receive pushed updates whenever the data behind a
//! watch changes.
//!
//! ## Core Concepts
//!
//! - **Publications**: Named data sources clients watch, parameterized by params
//! - **Actions**: Named mutations that report the tags they touched
//! - **Tags**: Labels linking query results to the changes that invalidate them
//! - **Queries**: One publication + params (+ identity if scoped), digested to a stable id
//!
//! ## Example
//!
//! ```ignore
//! use ripple::{Gateway, GatewayConfig, MemoryStore, Publication, Registry};
//!
//! let mut registry = Registry::new();
//! registry.add_publication(Publication::shared("rooms", |params| {
//!     Ok(PublicationResult {
//!         result: json!({"rooms": ["lobby"]}),
//!         tags: vec![Tag::new("rooms")],
//!     })
//! }))?;
//!
//! let gateway = Gateway::new(
//!     GatewayConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     transport,
//!     registry,
//! );
//!
//! // The embedding feeds transport events in:
//! gateway.handle_connect(connection_id.clone());
//! gateway.handle_frame(&connection_id, frame);
//! ```

pub mod connection;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod identity;
pub mod invalidation;
pub mod protocol;
pub mod publish;
pub mod registry;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use connection::{Connection, ConnectionRegistry};
pub use error::{GatewayError, Result};
pub use executor::QueryExecutor;
pub use gateway::{Gateway, GatewayConfig};
pub use identity::{IdentityData, IdentityManager, NewIdentity};
pub use invalidation::InvalidationListener;
pub use protocol::{ProtocolState, ProtocolVersion, WireMessage};
pub use publish::{PublishJob, PublishQueue};
pub use registry::{Action, Publication, Registry};
pub use store::{Batch, BatchOp, MemoryStore, Store, StoreNotification};
pub use subscriptions::{QueryRecord, QueryStore, SubscriptionIndex, TagIndex};
pub use transport::Transport;
pub use types::*;
