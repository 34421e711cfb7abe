use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents of a query result, ordered by the query's comparator with the
/// key as final tiebreak.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// A set ordered by key alone.
    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left: &Document, right: &Document| {
            left.key().cmp(right.key())
        }))
    }

    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    /// Inserts or replaces the document with the same key.
    pub fn add(&mut self, document: Document) {
        self.delete(&document.key().clone());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        let Some(existing) = self.by_key.remove(key) else {
            return;
        };
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(|document| document.key())
    }

    fn position(&self, document: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|candidate| self.compare(candidate, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, MutableDocument, SnapshotVersion};
    use crate::firestore::value::{compare_values, FirestoreValue, MapValue};

    fn doc(path: &str, rank: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("rank").unwrap(), FirestoreValue::from(rank));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn by_rank() -> DocumentComparator {
        let rank = FieldPath::from_dot_separated("rank").unwrap();
        Arc::new(move |left: &Document, right: &Document| {
            match (left.field(&rank), right.field(&rank)) {
                (Some(l), Some(r)) => compare_values(l, r),
                _ => Ordering::Equal,
            }
        })
    }

    #[test]
    fn keeps_comparator_order_and_replaces_by_key() {
        let mut set = DocumentSet::new(by_rank());
        set.add(doc("d/a", 3));
        set.add(doc("d/b", 1));
        set.add(doc("d/c", 2));
        let keys: Vec<String> = set.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["d/b", "d/c", "d/a"]);

        set.add(doc("d/b", 9));
        assert_eq!(set.len(), 3);
        assert_eq!(set.last().map(|d| d.key().to_string()), Some("d/b".to_string()));
        assert_eq!(set.index_of(&DocumentKey::from_string("d/c").unwrap()), Some(0));

        set.delete(&DocumentKey::from_string("d/c").unwrap());
        assert_eq!(set.first().map(|d| d.key().to_string()), Some("d/a".to_string()));
    }

    #[test]
    fn ties_break_on_key() {
        let mut set = DocumentSet::new(by_rank());
        set.add(doc("d/z", 1));
        set.add(doc("d/y", 1));
        assert_eq!(set.first().map(|d| d.key().to_string()), Some("d/y".to_string()));
    }
}
