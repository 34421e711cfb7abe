mod compare;
mod map_value;
mod value;

pub use compare::{array_contains, compare_values, type_order, values_equal};
pub use map_value::MapValue;
pub use value::{FirestoreValue, ValueKind};
