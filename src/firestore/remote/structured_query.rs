use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, FieldFilter, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::remote::serializer::JsonProtoSerializer;

pub(crate) fn encode_structured_query(
    serializer: &JsonProtoSerializer,
    target: &Target,
) -> FirestoreResult<JsonValue> {
    let mut structured = serde_json::Map::new();

    let (collection_id, all_descendants) = match target.collection_group() {
        Some(group) => (group.to_string(), true),
        None => {
            let collection_id = target
                .path()
                .last_segment()
                .ok_or_else(|| invalid_argument("Query target has no collection id"))?;
            (collection_id.to_string(), false)
        }
    };
    let mut from_entry = serde_json::Map::new();
    from_entry.insert("collectionId".to_string(), json!(collection_id));
    if all_descendants {
        from_entry.insert("allDescendants".to_string(), json!(true));
    }
    structured.insert(
        "from".to_string(),
        JsonValue::Array(vec![JsonValue::Object(from_entry)]),
    );

    if !target.filters().is_empty() {
        structured.insert("where".to_string(), encode_filters(serializer, target.filters()));
    }

    if !target.order_by().is_empty() {
        let orders: Vec<_> = target
            .order_by()
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field().canonical_string() },
                    "direction": order.direction().as_str(),
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit() {
        structured.insert("limit".to_string(), json!(limit));
    }

    if let Some(start) = target.start_at() {
        structured.insert("startAt".to_string(), encode_cursor(serializer, start, true));
    }

    if let Some(end) = target.end_at() {
        structured.insert("endAt".to_string(), encode_cursor(serializer, end, false));
    }

    Ok(JsonValue::Object(structured))
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[FieldFilter]) -> JsonValue {
    if filters.len() == 1 {
        return encode_field_filter(serializer, &filters[0]);
    }

    let nested: Vec<_> = filters
        .iter()
        .map(|filter| encode_field_filter(serializer, filter))
        .collect();

    json!({
        "compositeFilter": {
            "op": "AND",
            "filters": nested
        }
    })
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field().canonical_string() },
            "op": filter.operator().as_str(),
            "value": serializer.encode_value(filter.value())
        }
    })
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound
            .values()
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": if start { bound.inclusive() } else { !bound.inclusive() },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{FilterOperator, OrderDirection, Query};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::test_support::query;

    #[test]
    fn encodes_filters_order_and_limit() {
        let serializer = JsonProtoSerializer::new(DatabaseId::default("project"));
        let query: Query = query("rooms")
            .where_field("size", FilterOperator::GreaterThan, 2i64)
            .unwrap()
            .where_field("open", FilterOperator::Equal, true)
            .unwrap()
            .order_by("size", OrderDirection::Descending)
            .unwrap()
            .limit_to_first(5)
            .unwrap();

        let encoded = encode_structured_query(&serializer, &query.to_target()).unwrap();
        assert_eq!(encoded["where"]["compositeFilter"]["op"], json!("AND"));
        assert_eq!(
            encoded["where"]["compositeFilter"]["filters"][0]["fieldFilter"]["op"],
            json!("GREATER_THAN")
        );
        assert_eq!(encoded["orderBy"][0]["direction"], json!("DESCENDING"));
        assert_eq!(encoded["orderBy"][1]["field"]["fieldPath"], json!("__name__"));
        assert_eq!(encoded["limit"], json!(5));
    }

    #[test]
    fn collection_group_queries_cover_descendants() {
        let serializer = JsonProtoSerializer::new(DatabaseId::default("project"));
        let encoded =
            encode_structured_query(&serializer, &Query::collection_group("rooms").to_target())
                .unwrap();
        assert_eq!(encoded["from"][0]["allDescendants"], json!(true));
    }
}
