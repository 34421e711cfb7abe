use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{Bound, FieldFilter, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

pub type TargetId = i32;

/// The backend-facing form of a query. Several queries can map to one target
/// (for example `limit_to_last` queries are stored flipped).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub(crate) fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    /// Single-document target, used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(
            key.path().clone(),
            None,
            Vec::new(),
            Vec::new(),
            None,
            None,
            None,
        )
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    /// Key usable for deduplicating equal targets.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

/// Hands out target ids from one of two disjoint spaces. The target cache
/// uses even ids, the sync engine odd ones for limbo targets.
#[derive(Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache(after: TargetId) -> Self {
        let mut next_id = after + 2;
        if next_id % 2 != 0 {
            next_id -= 1;
        }
        Self {
            next_id: next_id.max(2),
        }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{OrderDirection, Query};

    #[test]
    fn equal_queries_share_canonical_ids() {
        let path = ResourcePath::from_string("rooms").unwrap();
        let a = Query::collection(path.clone())
            .order_by("rank", OrderDirection::Ascending)
            .unwrap();
        let b = Query::collection(path)
            .order_by("rank", OrderDirection::Ascending)
            .unwrap();
        assert_eq!(a.to_target().canonical_id(), b.to_target().canonical_id());
    }

    #[test]
    fn generators_use_disjoint_spaces() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        assert_eq!(cache.next(), 2);
        assert_eq!(cache.next(), 4);
        let mut resumed = TargetIdGenerator::for_target_cache(6);
        assert_eq!(resumed.next(), 8);

        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!(sync.next(), 1);
        assert_eq!(sync.next(), 3);
    }

    #[test]
    fn document_target() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert!(Target::for_document(&key).is_document_target());
    }
}
