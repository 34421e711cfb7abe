use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Position of each value type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Reference(_) => 6,
        ValueKind::Array(_) => 7,
        ValueKind::Map(_) => 8,
    }
}

/// Total order over values. Values of different types order by type, NaN
/// sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let type_ordering = type_order(left).cmp(&type_order(right));
    if type_ordering != Ordering::Equal {
        return type_ordering;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Equality as seen by queries: integers and doubles compare numerically and
/// NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if type_order(left) != type_order(right) {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields().iter().all(|(key, value)| {
                    b.fields()
                        .get(key)
                        .is_some_and(|other| values_equal(value, other))
                })
        }
        _ => compare_values(left, right) == Ordering::Equal,
    }
}

pub fn array_contains(values: &[FirestoreValue], needle: &FirestoreValue) -> bool {
    values.iter().any(|candidate| values_equal(candidate, needle))
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_arrays(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = compare_values(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_entries = left.fields().iter();
    let mut right_entries = right.fields().iter();
    loop {
        match (left_entries.next(), right_entries.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}
