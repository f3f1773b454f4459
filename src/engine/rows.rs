//! Row vectors and the value hashing used by distinct and join storage.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::value::Value;

/// One slot per Output-or-Aggregate column, optionally extended at the
/// tail with sort-key values.
pub type Row = Vec<Value>;

/// The join index: a hash over the equality-key values maps to the bucket
/// of right-side rows that produced it. False positives are fine; the
/// `where` equality filter rechecks actual values.
pub type IndexedRows = IndexMap<u64, Rc<Vec<Row>>>;

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Real(r) => r.to_bits().hash(state),
        Value::Int(i) => i.hash(state),
        Value::Bool(b) => b.hash(state),
        Value::DateTime(dt) => {
            (
                dt.error,
                dt.date_only,
                dt.year,
                dt.month,
                dt.day,
                dt.hours,
                dt.minutes,
                dt.seconds,
                dt.ms,
            )
                .hash(state);
        }
        Value::Str(s) => s.hash(state),
        Value::Unknown => 0u8.hash(state),
    }
}

/// Combine the value hashes golden-ratio style, independent of the
/// hasher's own mixing, so bucket keys are stable within a run.
pub fn hash_values(values: &[Value]) -> u64 {
    let mut seed: u64 = 0;
    for value in values {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        hash_value(value, &mut h);
        let a = h.finish();
        seed ^= a
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(seed << 6)
            .wrapping_add(seed >> 2);
    }
    seed
}

/// A dedupe key: the output-value prefix of a row, compared under the
/// Value equality relation.
#[derive(Debug, Clone)]
pub struct RowKey(pub Vec<Value>);

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| Value::compare(a, b) == std::cmp::Ordering::Equal)
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in &self.0 {
            hash_value(value, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_values_distinguishes() {
        let a = vec![Value::Int(1), Value::Str("x".into())];
        let b = vec![Value::Int(2), Value::Str("x".into())];
        assert_ne!(hash_values(&a), hash_values(&b));
        assert_eq!(hash_values(&a), hash_values(&a));
    }

    #[test]
    fn test_row_key_equality() {
        let a = RowKey(vec![Value::Str("x".into()), Value::Int(3)]);
        let b = RowKey(vec![Value::Str("x".into()), Value::Int(3)]);
        let c = RowKey(vec![Value::Str("x".into()), Value::Int(4)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_row_key_in_map_keeps_insertion_order() {
        let mut map: IndexMap<RowKey, usize> = IndexMap::new();
        map.insert(RowKey(vec![Value::Str("b".into())]), 0);
        map.insert(RowKey(vec![Value::Str("a".into())]), 1);
        let order: Vec<usize> = map.values().copied().collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_types_hash_differently_from_values() {
        // Int 1 and Bool true must not collide as row keys.
        let a = RowKey(vec![Value::Int(1)]);
        let b = RowKey(vec![Value::Bool(true)]);
        assert_ne!(a, b);
    }
}
