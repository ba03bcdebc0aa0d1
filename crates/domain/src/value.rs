// crates/domain/src/value.rs
//
// Value rules every backend has to agree on: kinds, numeric-aware equality,
// the total sort order and the canonical key used by emulated indexes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(v: &Json) -> Self {
        match v {
            Json::Null => ValueKind::Null,
            Json::Bool(_) => ValueKind::Bool,
            Json::Number(_) => ValueKind::Number,
            Json::String(_) => ValueKind::String,
            Json::Array(_) => ValueKind::Array,
            Json::Object(_) => ValueKind::Object,
        }
    }

    /// Position in the cross-backend sort order. Absent values rank as null.
    pub fn sort_rank(self) -> u8 {
        match self {
            ValueKind::Null => 0,
            ValueKind::Number => 1,
            ValueKind::String => 2,
            ValueKind::Object => 3,
            ValueKind::Array => 4,
            ValueKind::Bool => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "null" => ValueKind::Null,
            "bool" => ValueKind::Bool,
            "number" => ValueKind::Number,
            "string" => ValueKind::String,
            "array" => ValueKind::Array,
            "object" => ValueKind::Object,
            _ => return None,
        })
    }

    /// Kinds an ordering comparison (`<`, `>`, ...) may be applied to.
    pub fn is_orderable(self) -> bool {
        matches!(self, ValueKind::Number | ValueKind::String)
    }
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Equality and ordering
// ─────────────────────────────────────────────────────────────────────────────

pub fn numbers_equal(a: &Number, b: &Number) -> bool {
    compare_numbers(a, b) == Ordering::Equal
}

pub fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let fa = a.as_f64().unwrap_or(f64::NAN);
    let fb = b.as_f64().unwrap_or(f64::NAN);
    fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
}

/// Deep structural equality where `1 == 1.0`.
pub fn values_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => numbers_equal(x, y),
        (Json::Array(xs), Json::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Json::Object(xs), Json::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Total order used for sorting. `None` (absent) sorts with `null`.
pub fn compare_values(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    let ka = a.map(ValueKind::of).unwrap_or(ValueKind::Null);
    let kb = b.map(ValueKind::of).unwrap_or(ValueKind::Null);

    let by_rank = ka.sort_rank().cmp(&kb.sort_rank());
    if by_rank != Ordering::Equal {
        return by_rank;
    }

    match (a, b) {
        (Some(Json::Number(x)), Some(Json::Number(y))) => compare_numbers(x, y),
        (Some(Json::String(x)), Some(Json::String(y))) => x.cmp(y),
        (Some(Json::Bool(x)), Some(Json::Bool(y))) => x.cmp(y),
        (Some(x @ Json::Array(_)), Some(y @ Json::Array(_)))
        | (Some(x @ Json::Object(_)), Some(y @ Json::Object(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => Ordering::Equal,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Index keys
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical string form of a value for hash-bucket lookups.
///
/// Integral floats are folded onto integers so `1` and `1.0` share a bucket,
/// matching `values_equal`.
pub fn index_key(v: &Json) -> String {
    canonical(v).to_string()
}

fn canonical(v: &Json) -> Json {
    match v {
        Json::Number(n) => {
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                        return Json::from(f as i64);
                    }
                }
            }
            Json::Number(n.clone())
        }
        Json::Array(items) => Json::Array(items.iter().map(canonical).collect()),
        Json::Object(map) => Json::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical(v)))
                .collect::<Map<String, Json>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_and_integral_floats_are_equal() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2.0]}), &json!({"a": [1.0, 2]})));
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(!values_equal(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn sort_order_ranks_kinds_before_values() {
        let absent = None;
        let null = json!(null);
        let num = json!(10);
        let s = json!("a");
        let obj = json!({"x": 1});
        let arr = json!([1]);
        let b = json!(false);

        let ordered = [
            absent,
            Some(&null),
            Some(&num),
            Some(&s),
            Some(&obj),
            Some(&arr),
            Some(&b),
        ];
        for w in ordered.windows(2) {
            assert_ne!(compare_values(w[0], w[1]), Ordering::Greater);
        }
        assert_eq!(compare_values(None, Some(&null)), Ordering::Equal);
        assert_eq!(compare_values(Some(&num), Some(&s)), Ordering::Less);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(
            compare_values(Some(&json!(2)), Some(&json!(10.5))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!(-1)), Some(&json!(u64::MAX))),
            Ordering::Less
        );
    }

    #[test]
    fn index_key_folds_integral_floats() {
        assert_eq!(index_key(&json!(3.0)), index_key(&json!(3)));
        assert_ne!(index_key(&json!(3.5)), index_key(&json!(3)));
        assert_eq!(index_key(&json!("x")), "\"x\"");
        assert_eq!(index_key(&json!([1.0, {"a": 2.0}])), "[1,{\"a\":2}]");
    }

    #[test]
    fn kind_names_round_trip() {
        for k in [
            ValueKind::Null,
            ValueKind::Bool,
            ValueKind::Number,
            ValueKind::String,
            ValueKind::Array,
            ValueKind::Object,
        ] {
            assert_eq!(ValueKind::from_name(k.name()), Some(k));
        }
        assert!(ValueKind::from_name("date").is_none());
    }
}
