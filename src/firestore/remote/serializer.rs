use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, FieldTransform, MutableDocument, Mutation,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_structured_query;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Converts between the model and the JSON form of the Firestore protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.canonical_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// `projects/{p}/databases/{d}/documents[/{path}]`
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let key = DocumentKey::from_resource_name(name)?;
        let prefix = format!("{}/documents/", self.database_name());
        if !name.starts_with(&prefix) {
            return Err(invalid_argument(format!(
                "Document {name} does not belong to database {}",
                self.database_name()
            )));
        }
        Ok(key)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        version.timestamp().to_rfc3339()
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::new(Timestamp::from_rfc3339(value)?))
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: &str) -> FirestoreResult<Vec<u8>> {
        BASE64_STANDARD
            .decode(value)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_document_fields(&self, map: &MapValue) -> JsonValue {
        json!({
            "fields": encode_map_fields(map)
        })
    }

    /// Decodes the `fields` of a document or map value. A missing `fields`
    /// entry is an empty map.
    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    /// Decodes a `Document` proto into a found document at its update time.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let update_time = document
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument(format!("Document {name} missing updateTime")))?;
        let version = self.decode_version(update_time)?;
        let data = self.decode_map_value(document)?;
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    pub fn encode_document(&self, document: &MutableDocument) -> JsonValue {
        json!({
            "name": self.document_name(document.key()),
            "fields": encode_map_fields(document.data()),
            "updateTime": self.encode_version(document.version()),
        })
    }

    /// Body of an `addTarget` request.
    pub fn encode_target(&self, target_data: &TargetData) -> FirestoreResult<JsonValue> {
        let target = &target_data.target;
        let mut add_target = serde_json::Map::new();
        add_target.insert("targetId".to_string(), json!(target_data.target_id));

        if target.is_document_target() {
            add_target.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(target.path())] }),
            );
        } else {
            let parent = match target.collection_group() {
                Some(_) => target.path().clone(),
                None => target.path().without_last(),
            };
            add_target.insert(
                "query".to_string(),
                json!({
                    "parent": self.resource_name(&parent),
                    "structuredQuery": encode_structured_query(self, target)?,
                }),
            );
        }

        if !target_data.resume_token.is_empty() {
            add_target.insert(
                "resumeToken".to_string(),
                json!(self.encode_bytes(&target_data.resume_token)),
            );
            if let Some(expected_count) = target_data.expected_count {
                add_target.insert("expectedCount".to_string(), json!(expected_count));
            }
        } else if !target_data.snapshot_version.is_min() {
            add_target.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
            if let Some(expected_count) = target_data.expected_count {
                add_target.insert("expectedCount".to_string(), json!(expected_count));
            }
        }

        Ok(JsonValue::Object(add_target))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(key),
                        "fields": encode_map_fields(value),
                    }),
                );
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(key),
                        "fields": encode_map_fields(data),
                    }),
                );
                let mask: Vec<String> = field_mask
                    .fields()
                    .iter()
                    .map(FieldPath::canonical_string)
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": mask }));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }

        if let Some(transforms) = self.encode_field_transforms(mutation.field_transforms()) {
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }

        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }

        JsonValue::Object(write)
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(*version) }))
            }
        }
    }

    fn encode_field_transforms(&self, transforms: &[FieldTransform]) -> Option<Vec<JsonValue>> {
        if transforms.is_empty() {
            return None;
        }

        let mut encoded = Vec::with_capacity(transforms.len());
        for transform in transforms {
            let field_path = transform.field_path().canonical_string();
            let json = match transform.operation() {
                TransformOperation::ServerTimestamp => json!({
                    "fieldPath": field_path,
                    "setToServerValue": "REQUEST_TIME"
                }),
                TransformOperation::ArrayUnion(elements) => json!({
                    "fieldPath": field_path,
                    "appendMissingElements": {
                        "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                    }
                }),
                TransformOperation::ArrayRemove(elements) => json!({
                    "fieldPath": field_path,
                    "removeAllFromArray": {
                        "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                    }
                }),
                TransformOperation::Increment(operand) => json!({
                    "fieldPath": field_path,
                    "increment": encode_value(operand)
                }),
            };
            encoded.push(json);
        }

        Some(encoded)
    }

    /// Decodes one `WriteResult`. Writes that did not change the document
    /// report no update time and take the commit version.
    pub fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let version = match value.get("updateTime").and_then(JsonValue::as_str) {
            Some(update_time) => {
                let version = self.decode_version(update_time)?;
                if version.is_min() {
                    commit_version
                } else {
                    version
                }
            }
            None => commit_version,
        };

        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(MutationResult::new(version, transform_results))
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": BASE64_STANDARD.encode(bytes) }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::Array(array) => {
            let values = array.iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::from_rfc3339(
            timestamp_str,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}
