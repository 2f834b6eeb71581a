//! Subscription state shared through the store.
//!
//! Three services own the durable relations behind the reactive core:
//! - [`SubscriptionIndex`]: which connections watch which queries
//! - [`QueryStore`]: what each query id means (publication + params)
//! - [`TagIndex`]: which tags each query's last result depended on
//!
//! All three write exclusively through atomic store batches, so sibling
//! processes never observe a half-updated binding.

mod index;
mod queries;
mod tags;

pub use index::SubscriptionIndex;
pub use queries::{QueryRecord, QueryStore};
pub use tags::TagIndex;
