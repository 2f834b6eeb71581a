//! Tag ↔ query invalidation index.

use crate::error::Result;
use crate::store::{Batch, Store};
use crate::types::{QueryId, Tag};
use std::collections::HashSet;
use std::sync::Arc;

fn tag_key(tag: &Tag) -> String {
    format!("tag:{tag}:queries")
}

fn query_tags_key(query: &QueryId) -> String {
    format!("query:{query}:tags")
}

/// Many-to-many relation between queries and the tags their last result
/// depended on.
///
/// [`update`](TagIndex::update) is diff-based: only the tags that appeared or
/// disappeared since the previous execution are written, both directions in
/// one atomic batch, so the index is exact after every run even as tag sets
/// grow and shrink.
#[derive(Clone)]
pub struct TagIndex {
    store: Arc<dyn Store>,
}

impl TagIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn tags_for(&self, query: &QueryId) -> Result<Vec<Tag>> {
        Ok(self
            .store
            .set_members(&query_tags_key(query))?
            .into_iter()
            .map(Tag::from)
            .collect())
    }

    pub fn query_ids_for(&self, tag: &Tag) -> Result<Vec<QueryId>> {
        Ok(self
            .store
            .set_members(&tag_key(tag))?
            .into_iter()
            .map(QueryId::from)
            .collect())
    }

    /// Every query bound to at least one of the tags, deduplicated.
    pub fn query_ids_for_any(&self, tags: &[Tag]) -> Result<Vec<QueryId>> {
        let keys: Vec<String> = tags.iter().map(tag_key).collect();
        Ok(self
            .store
            .set_union(&keys)?
            .into_iter()
            .map(QueryId::from)
            .collect())
    }

    /// Replace the query's tag bindings with `new_tags`.
    pub fn update(&self, query: &QueryId, new_tags: &[Tag]) -> Result<()> {
        let old: HashSet<Tag> = self.tags_for(query)?.into_iter().collect();
        let new: HashSet<Tag> = new_tags.iter().cloned().collect();

        let mut batch = Batch::new();
        for tag in new.difference(&old) {
            batch
                .set_add(tag_key(tag), query.as_str())
                .set_add(query_tags_key(query), tag.as_str());
        }
        for tag in old.difference(&new) {
            batch
                .set_remove(tag_key(tag), query.as_str())
                .set_remove(query_tags_key(query), tag.as_str());
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.store.exec_batch(batch)
    }

    /// Unbind every tag, then drop the query's own tag-set key.
    pub fn cleanup_query_id(&self, query: &QueryId) -> Result<()> {
        self.update(query, &[])?;
        self.store.delete(&query_tags_key(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn index() -> TagIndex {
        TagIndex::new(Arc::new(MemoryStore::new()))
    }

    fn sorted(mut tags: Vec<Tag>) -> Vec<Tag> {
        tags.sort();
        tags
    }

    #[test]
    fn test_update_binds_both_directions() {
        let index = index();
        let q = QueryId::from("q1");
        index
            .update(&q, &[Tag::new("a"), Tag::new("b")])
            .unwrap();

        assert_eq!(
            sorted(index.tags_for(&q).unwrap()),
            vec![Tag::new("a"), Tag::new("b")]
        );
        assert_eq!(index.query_ids_for(&Tag::new("a")).unwrap(), vec![q.clone()]);
        assert_eq!(index.query_ids_for(&Tag::new("b")).unwrap(), vec![q]);
    }

    #[test]
    fn test_update_diffs_old_bindings() {
        let index = index();
        let q = QueryId::from("q1");
        index
            .update(&q, &[Tag::new("a"), Tag::new("b")])
            .unwrap();
        index
            .update(&q, &[Tag::new("b"), Tag::new("c")])
            .unwrap();

        assert_eq!(
            sorted(index.tags_for(&q).unwrap()),
            vec![Tag::new("b"), Tag::new("c")]
        );
        assert!(index.query_ids_for(&Tag::new("a")).unwrap().is_empty());
        assert_eq!(index.query_ids_for(&Tag::new("c")).unwrap(), vec![q]);
    }

    #[test]
    fn test_update_with_duplicate_tags() {
        let index = index();
        let q = QueryId::from("q1");
        index
            .update(&q, &[Tag::new("a"), Tag::new("a")])
            .unwrap();
        assert_eq!(index.tags_for(&q).unwrap(), vec![Tag::new("a")]);
    }

    #[test]
    fn test_query_ids_for_any_dedupes() {
        let index = index();
        let q1 = QueryId::from("q1");
        let q2 = QueryId::from("q2");
        index
            .update(&q1, &[Tag::new("a"), Tag::new("b")])
            .unwrap();
        index.update(&q2, &[Tag::new("b")]).unwrap();

        let hits = index
            .query_ids_for_any(&[Tag::new("a"), Tag::new("b"), Tag::new("b")])
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&q1));
        assert!(hits.contains(&q2));
    }

    #[test]
    fn test_cleanup_query_id() {
        let index = index();
        let q = QueryId::from("q1");
        index
            .update(&q, &[Tag::new("a"), Tag::new("b")])
            .unwrap();
        index.cleanup_query_id(&q).unwrap();

        assert!(index.tags_for(&q).unwrap().is_empty());
        assert!(index.query_ids_for(&Tag::new("a")).unwrap().is_empty());
        assert!(index.query_ids_for(&Tag::new("b")).unwrap().is_empty());
    }

    proptest! {
        /// After any two consecutive updates the index reflects exactly the
        /// second tag set, in both directions.
        #[test]
        fn prop_update_converges_to_latest(
            first in prop::collection::vec("[a-d]{1,2}", 0..6),
            second in prop::collection::vec("[a-d]{1,2}", 0..6),
        ) {
            let index = index();
            let q = QueryId::from("q1");
            let first: Vec<Tag> = first.into_iter().map(Tag::from).collect();
            let second: Vec<Tag> = second.into_iter().map(Tag::from).collect();

            index.update(&q, &first).unwrap();
            index.update(&q, &second).unwrap();

            let expected: HashSet<Tag> = second.iter().cloned().collect();
            let actual: HashSet<Tag> = index.tags_for(&q).unwrap().into_iter().collect();
            prop_assert_eq!(&actual, &expected);

            for tag in first.iter().chain(second.iter()) {
                let bound = index.query_ids_for(tag).unwrap().contains(&q);
                prop_assert_eq!(bound, expected.contains(tag));
            }
        }
    }
}
