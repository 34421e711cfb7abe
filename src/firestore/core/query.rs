use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, FieldPath, IntoFieldPath, ResourcePath,
};
use crate::firestore::value::{
    array_contains, compare_values, type_order, values_equal, FirestoreValue, ValueKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    /// Operator name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    fn canonical(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn requires_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(
        field: FieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        if operator.requires_array_operand() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "'{}' filters require an array value",
                operator.canonical()
            )));
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        let Some(other) = field_value(document, &self.field) else {
            return false;
        };
        let other = &other;
        let operand = &self.value;
        match self.operator {
            FilterOperator::Equal => values_equal(other, operand),
            // Types do not have to match for `!=`.
            FilterOperator::NotEqual => !other.is_null() && !values_equal(other, operand),
            FilterOperator::LessThan
            | FilterOperator::LessThanOrEqual
            | FilterOperator::GreaterThan
            | FilterOperator::GreaterThanOrEqual => {
                same_type_order(other, operand)
                    && self.matches_comparison(compare_values(other, operand))
            }
            FilterOperator::ArrayContains => other
                .as_array()
                .is_some_and(|values| array_contains(values, operand)),
            FilterOperator::ArrayContainsAny => match (other.as_array(), operand.as_array()) {
                (Some(values), Some(needles)) => {
                    needles.iter().any(|needle| array_contains(values, needle))
                }
                _ => false,
            },
            FilterOperator::In => operand
                .as_array()
                .is_some_and(|values| array_contains(values, other)),
            FilterOperator::NotIn => match operand.as_array() {
                Some(values) => {
                    !array_contains(values, &FirestoreValue::null())
                        && !other.is_null()
                        && !array_contains(values, other)
                }
                None => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.canonical(),
            self.value.canonical_string()
        )
    }
}

fn same_type_order(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    type_order(left) == type_order(right)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASCENDING",
            OrderDirection::Descending => "DESCENDING",
        }
    }

    fn flipped(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), suffix)
    }
}

/// Cursor position. `inclusive` bounds include documents equal to the
/// position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    values: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (value, order) in self.values.iter().zip(order_by.iter()) {
            let ordering = if order.field.is_key_field() {
                match value.kind() {
                    ValueKind::Reference(name) => DocumentKey::from_resource_name(name)
                        .map(|key| key.cmp(document.key()))
                        .unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                }
            } else {
                match document.field(&order.field) {
                    Some(field) => compare_values(value, field),
                    None => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether the document sorts at or after this bound used as a start.
    fn admits_from_start(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    fn admits_from_end(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.values.iter().map(|v| v.canonical_string()).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A query as written by the user. Queries are compared by canonical id;
/// `to_target` gives the form sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the documents directly under `path`.
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::collection(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Query matching exactly one document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::collection(key.path().clone())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn where_field(
        &self,
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: impl Into<FirestoreValue>,
    ) -> FirestoreResult<Self> {
        let filter = FieldFilter::new(field.into_field_path()?, operator, value.into())?;
        let mut query = self.clone();
        query.filters.push(filter);
        Ok(query)
    }

    pub fn order_by(
        &self,
        field: impl IntoFieldPath,
        direction: OrderDirection,
    ) -> FirestoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "order_by() must be called before start_at() or end_at()",
            ));
        }
        let mut query = self.clone();
        query
            .explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(query)
    }

    pub fn limit_to_first(&self, limit: u32) -> FirestoreResult<Self> {
        self.with_limit(limit, LimitType::First)
    }

    pub fn limit_to_last(&self, limit: u32) -> FirestoreResult<Self> {
        self.with_limit(limit, LimitType::Last)
    }

    fn with_limit(&self, limit: u32, limit_type: LimitType) -> FirestoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("Query limit must be positive"));
        }
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = limit_type;
        Ok(query)
    }

    pub fn starting_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    pub fn ending_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// Same query without its limit. Used to re-run limit queries.
    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    fn first_inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.operator.is_inequality())
            .map(|filter| &filter.field)
    }

    /// Explicit ordering plus the implicit inequality field and the trailing
    /// key ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(field) = self.first_inequality_field() {
                if !field.is_key_field() {
                    order_by.push(OrderBy::new(field.clone(), OrderDirection::Ascending));
                }
            }
        }
        if !order_by.iter().any(|order| order.field.is_key_field()) {
            let direction = order_by
                .last()
                .map(|order| order.direction)
                .unwrap_or(OrderDirection::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let document_path = key.path();
        match &self.collection_group {
            Some(group) => key.has_collection_id(group) && self.path.is_prefix_of(document_path),
            None if self.path.is_document_path() => &self.path == document_path,
            None => self.path.is_immediate_parent_of(document_path),
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.admits_from_start(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.admits_from_end(&order_by, document) {
                return false;
            }
        }
        true
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                let flipped = order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect();
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    self.filters.clone(),
                    flipped,
                    self.limit,
                    self.end_at.clone(),
                    self.start_at.clone(),
                )
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }
}

/// Value of `field` in the document; the key field yields a reference.
fn field_value(document: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}
