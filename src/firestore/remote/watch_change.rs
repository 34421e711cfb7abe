use serde_json::Value as JsonValue;

use crate::firestore::core::TargetId;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilterParams;
use crate::firestore::remote::rpc_error::StatusCause;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message of the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty for a global change that applies to every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A document entering, changing in, or leaving a set of targets.
/// `documentDelete` and `documentRemove` decode to this as well.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// The new state. `None` when the document only left the targets
    /// without the backend saying whether it still exists.
    pub document: Option<MutableDocument>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(serializer, filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .map(|token| serializer.decode_bytes(token))
        .transpose()?
        .unwrap_or_default();

    let read_time = decode_read_time(serializer, value)?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(StatusCause::into_error);

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let read_time = decode_read_time(serializer, value)?;

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        document: Some(MutableDocument::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;
    let key = serializer.document_key_from_name(name)?;

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        document: None,
    }))
}

fn decode_filter_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;

    // A malformed bloom filter is treated as absent; the mismatch then falls
    // back to a full re-listen.
    let unchanged_names = value
        .get("unchangedNames")
        .and_then(|names| match decode_bloom_filter(serializer, names) {
            Ok(params) => Some(params),
            Err(err) => {
                log::debug!("ignoring undecodable bloom filter for target {target_id}: {err}");
                None
            }
        });

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn decode_bloom_filter(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<BloomFilterParams> {
    let bits = value
        .get("bits")
        .ok_or_else(|| invalid_argument("bloom filter missing bits"))?;
    let bitmap = bits
        .get("bitmap")
        .and_then(JsonValue::as_str)
        .map(|bitmap| serializer.decode_bytes(bitmap))
        .transpose()?
        .unwrap_or_default();
    let padding = bits.get("padding").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let hash_count = value.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    Ok(BloomFilterParams {
        bitmap,
        padding,
        hash_count,
    })
}

fn decode_read_time(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_version(timestamp))
        .transpose()
        .map(Option::unwrap_or_default)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "NO_CHANGE" => TargetChangeState::NoChange,
        "ADD" => TargetChangeState::Added,
        "REMOVE" => TargetChangeState::Removed,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}
