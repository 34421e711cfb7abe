use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Ordered field map of a document or of a nested map value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up the value at a (possibly nested) field path.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating intermediate maps and replacing
    /// non-map values found along the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies a batch of writes; `None` deletes the field.
    pub fn set_all<'a, I>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (&'a FieldPath, Option<FirestoreValue>)>,
    {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(path, value),
                None => self.delete(path),
            }
        }
    }

    /// Every leaf field path in this map. Empty nested maps count as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.get(first).map(|existing| existing.kind()) {
        Some(ValueKind::Map(map)) => map.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    let Some(ValueKind::Map(map)) = fields.get(first).map(|existing| existing.kind()) else {
        return;
    };
    let mut child = map.fields.clone();
    delete_at_segments(&mut child, rest);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (name, value) in fields {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => {
                collect_leaf_paths(&child.fields, prefix, out)
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}
