use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{array_contains, FirestoreValue, MapValue, ValueKind};

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Set of field paths touched by a patch or accumulated across several
/// mutations on the same document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    /// Whether `path` is one of the fields or nested below one of them.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(mut self, other: &FieldMask) -> Self {
        self.fields.extend(other.fields.iter().cloned());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    Increment(FirestoreValue),
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn server_timestamp(field_path: FieldPath) -> Self {
        Self::new(field_path, TransformOperation::ServerTimestamp)
    }

    pub fn increment(field_path: FieldPath, operand: FirestoreValue) -> FirestoreResult<Self> {
        if !operand.is_number() {
            return Err(invalid_argument("increment() requires a numeric operand"));
        }
        Ok(Self::new(field_path, TransformOperation::Increment(operand)))
    }

    pub fn array_union(field_path: FieldPath, elements: Vec<FirestoreValue>) -> Self {
        Self::new(field_path, TransformOperation::ArrayUnion(elements))
    }

    pub fn array_remove(field_path: FieldPath, elements: Vec<FirestoreValue>) -> Self {
        Self::new(field_path, TransformOperation::ArrayRemove(elements))
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Value the field takes locally, before the backend has seen the write.
    /// Server timestamps resolve to the local write time until acknowledged.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::Increment(operand) => numeric_increment(previous, operand),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        }
    }

    /// Value the field takes once the backend acknowledged the write.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: Option<&FirestoreValue>,
        commit_time: Timestamp,
    ) -> FirestoreValue {
        match (&self.operation, server_result) {
            (TransformOperation::ArrayUnion(elements), _) => array_union(previous, elements),
            (TransformOperation::ArrayRemove(elements), _) => array_remove(previous, elements),
            (_, Some(result)) => result.clone(),
            (_, None) => self.apply_to_local_view(previous, commit_time),
        }
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(|value| value.as_array())
        .map(|array| array.to_vec())
        .unwrap_or_default();

    for element in additions {
        if !array_contains(&values, element) {
            values.push(element.clone());
        }
    }

    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(|value| value.as_array())
        .map(|array| array.to_vec())
        .unwrap_or_default();

    let filtered = values
        .into_iter()
        .filter(|candidate| !array_contains(removals, candidate))
        .collect();

    FirestoreValue::from_array(filtered)
}

/// Adds `operand` to the previous value. Non-numeric previous values count as
/// integer zero; integer overflow falls back to a double.
fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing
        .filter(|value| value.is_number())
        .map(|value| value.kind().clone())
        .unwrap_or(ValueKind::Integer(0));

    match (base, operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(current as f64 + *delta as f64),
        },
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current as f64 + *delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + *delta)
        }
        _ => operand.clone(),
    }
}

/// Outcome of a single write as reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes the masked fields; masked fields missing from `data` are deleted.
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Only checks the precondition.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Update of the leaf fields of `data`; fails on the server if the
    /// document does not exist.
    pub fn patch(key: DocumentKey, data: MapValue) -> Self {
        let field_mask = FieldMask::new(data.leaf_paths());
        Self::patch_with_mask(key, data, field_mask)
    }

    pub fn patch_with_mask(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Mutation::Verify {
            key,
            precondition: Precondition::UpdateTime(version),
        }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    /// Attaches a transform. Ignored for deletes and verifies.
    pub fn with_transform(mut self, transform: FieldTransform) -> Self {
        match &mut self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms.push(transform),
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Applies the mutation to the local view of `document` and returns the
    /// accumulated field mask. `None` means the whole document is affected.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }

        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let results = local_transform_results(field_transforms, document, local_write_time);
                let mut data = value.clone();
                write_transform_results(&mut data, field_transforms, results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                ..
            } => {
                let results = local_transform_results(field_transforms, document, local_write_time);
                let mut merged = document.data().clone();
                merged.set_all(patch_values(data, field_mask));
                write_transform_results(&mut merged, field_transforms, results);
                let version = document.version();
                document
                    .convert_to_found_document(version, merged)
                    .set_has_local_mutations();

                previous_mask.map(|mask| {
                    let mut mask = mask.union(field_mask);
                    for transform in field_transforms {
                        mask.insert(transform.field_path().clone());
                    }
                    mask
                })
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(SnapshotVersion::min())
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the remote version of `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let results = server_transform_results(field_transforms, document, result);
                let mut data = value.clone();
                write_transform_results(&mut data, field_transforms, results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The backend applied the patch to a document we have not
                    // seen; its contents are unknown until the next read.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let results = server_transform_results(field_transforms, document, result);
                let mut merged = document.data().clone();
                merged.set_all(patch_values(data, field_mask));
                write_transform_results(&mut merged, field_transforms, results);
                document
                    .convert_to_found_document(result.version, merged)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Smallest mutation that turns the remote document into `document`, the
    /// result of applying pending mutations covering `mask`. Returns `None`
    /// when `document` carries no local changes.
    pub fn calculate_overlay_mutation(
        document: &MutableDocument,
        mask: Option<&FieldMask>,
    ) -> Option<Mutation> {
        if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
            return None;
        }

        let Some(mask) = mask else {
            return Some(if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            });
        };

        let mut data = MapValue::empty();
        let mut overlay_mask = FieldMask::default();
        for field in mask.fields() {
            if overlay_mask.covers(field) {
                continue;
            }
            let mut path = field.clone();
            let mut value = document.field(&path);
            // A deleted nested field is carried by its parent map.
            if value.is_none() && path.len() > 1 {
                if let Some(parent) = path.parent() {
                    value = document.field(&parent);
                    path = parent;
                }
            }
            match value {
                Some(value) => data.set(&path, value.clone()),
                None => data.delete(&path),
            }
            overlay_mask.insert(path);
        }

        Some(Mutation::Patch {
            key: document.key().clone(),
            data,
            field_mask: overlay_mask,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        })
    }
}

fn patch_values<'a>(
    data: &'a MapValue,
    field_mask: &'a FieldMask,
) -> impl Iterator<Item = (&'a FieldPath, Option<FirestoreValue>)> + 'a {
    field_mask
        .fields()
        .iter()
        .map(move |path| (path, data.field(path).cloned()))
}

fn local_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    local_write_time: Timestamp,
) -> Vec<FirestoreValue> {
    transforms
        .iter()
        .map(|transform| {
            transform.apply_to_local_view(document.field(transform.field_path()), local_write_time)
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    result: &MutationResult,
) -> Vec<FirestoreValue> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            transform.apply_to_remote_document(
                document.field(transform.field_path()),
                result.transform_results.get(index),
                result.version.timestamp(),
            )
        })
        .collect()
}

fn write_transform_results(
    data: &mut MapValue,
    transforms: &[FieldTransform],
    results: Vec<FirestoreValue>,
) {
    for (transform, value) in transforms.iter().zip(results) {
        data.set(transform.field_path(), value);
    }
}
