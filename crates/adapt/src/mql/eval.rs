// crates/adapt/src/mql/eval.rs

use domain::value::{compare_numbers, values_equal};
use domain::{Document, ValueKind};
use serde_json::Value as Json;
use std::cmp::Ordering;

use crate::mql::ast::{CmpOp, Filter};

/// Ordering comparison; only number/number and string/string pairs compare.
fn ordered(actual: Option<&Json>, expected: &Json, accept: impl Fn(Ordering) -> bool) -> bool {
    match (actual, expected) {
        (Some(Json::Number(a)), Json::Number(b)) => accept(compare_numbers(a, b)),
        (Some(Json::String(a)), Json::String(b)) => accept(a.as_str().cmp(b.as_str())),
        _ => false,
    }
}

fn equal(actual: Option<&Json>, expected: &Json) -> bool {
    match actual {
        Some(actual) => values_equal(actual, expected),
        // absent matches null
        None => expected.is_null(),
    }
}

fn array_contains(actual: Option<&Json>, expected: &Json) -> bool {
    match actual {
        Some(Json::Array(items)) => items.iter().any(|i| values_equal(i, expected)),
        _ => false,
    }
}

/// Evaluate a single comparison operator against an optional JSON value.
pub fn eval_cmp(op: &CmpOp, actual: Option<&Json>) -> bool {
    use CmpOp::*;

    match op {
        Eq(expected) => equal(actual, expected),
        Ne(expected) => !equal(actual, expected),
        Gt(expected) => ordered(actual, expected, |o| o == Ordering::Greater),
        Gte(expected) => ordered(actual, expected, |o| o != Ordering::Less),
        Lt(expected) => ordered(actual, expected, |o| o == Ordering::Less),
        Lte(expected) => ordered(actual, expected, |o| o != Ordering::Greater),
        In(list) => list.iter().any(|v| equal(actual, v)),
        Nin(list) => !list.iter().any(|v| equal(actual, v)),
        Contains(expected) => array_contains(actual, expected),
        All(values) => !values.is_empty() && values.iter().all(|v| array_contains(actual, v)),
        Exists(flag) => actual.is_some() == *flag,
        Size(expected_len) => match actual {
            Some(Json::Array(arr)) => arr.len() as i64 == *expected_len,
            _ => false,
        },
        TypeIs(kinds) => actual.is_some_and(|v| kinds.contains(&ValueKind::of(v))),
    }
}

/// Evaluate a full Filter against a document. Short-circuits left to right.
pub fn eval_filter(filter: &Filter, doc: &Document) -> bool {
    use Filter::*;

    match filter {
        Field(expr) => eval_cmp(&expr.op, doc.lookup(expr.path.as_str())),
        And(filters) => filters.iter().all(|f| eval_filter(f, doc)),
        Or(filters) => filters.iter().any(|f| eval_filter(f, doc)),
        Not(inner) => !eval_filter(inner, doc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Json) -> Document {
        Document::from_json(v).unwrap()
    }

    #[test]
    fn equality_is_numeric_aware_and_strict_on_arrays() {
        let d = doc(json!({ "n": 1, "tags": ["x", "y"] }));
        assert!(eval_filter(&Filter::eq("n", 1.0).unwrap(), &d));
        assert!(!eval_filter(&Filter::eq("n", "1").unwrap(), &d));
        // scalar equality does not reach into arrays
        assert!(!eval_filter(&Filter::eq("tags", "y").unwrap(), &d));
        assert!(eval_filter(&Filter::eq("tags", json!(["x", "y"])).unwrap(), &d));
    }

    #[test]
    fn null_matches_absent_and_null() {
        let with_null = doc(json!({ "a": null }));
        let without = doc(json!({ "b": 1 }));
        let valued = doc(json!({ "a": 2 }));
        let is_null = Filter::eq("a", Json::Null).unwrap();
        let not_null = Filter::ne("a", Json::Null).unwrap();

        assert!(eval_filter(&is_null, &with_null));
        assert!(eval_filter(&is_null, &without));
        assert!(!eval_filter(&is_null, &valued));
        assert!(!eval_filter(&not_null, &with_null));
        assert!(!eval_filter(&not_null, &without));
        assert!(eval_filter(&not_null, &valued));
    }

    #[test]
    fn ordering_only_within_numbers_and_strings() {
        let d = doc(json!({ "n": 5, "s": "m", "b": true }));
        assert!(eval_filter(&Filter::gt("n", 4).unwrap(), &d));
        assert!(eval_filter(&Filter::gte("n", 5.0).unwrap(), &d));
        assert!(!eval_filter(&Filter::lt("n", 5).unwrap(), &d));
        assert!(eval_filter(&Filter::lte("s", "m").unwrap(), &d));
        assert!(eval_filter(&Filter::gt("s", "a").unwrap(), &d));
        // number vs string never matches
        assert!(!eval_filter(&Filter::gt("s", 1).unwrap(), &d));
        assert!(!eval_filter(&Filter::gt("missing", 1).unwrap(), &d));
    }

    #[test]
    fn membership_and_array_operators() {
        let d = doc(json!({ "k": "b", "tags": ["x", "y", 3] }));
        assert!(eval_filter(&Filter::is_in("k", vec![json!("a"), json!("b")]).unwrap(), &d));
        assert!(!eval_filter(&Filter::is_in("k", vec![]).unwrap(), &d));
        assert!(eval_filter(&Filter::field("k", CmpOp::Nin(vec![json!("z")])).unwrap(), &d));
        assert!(eval_filter(&Filter::contains("tags", 3.0).unwrap(), &d));
        assert!(!eval_filter(&Filter::contains("k", "b").unwrap(), &d));
        assert!(eval_filter(
            &Filter::field("tags", CmpOp::All(vec![json!("x"), json!("y")])).unwrap(),
            &d
        ));
        assert!(!eval_filter(&Filter::field("tags", CmpOp::All(vec![])).unwrap(), &d));
        assert!(eval_filter(&Filter::field("tags", CmpOp::Size(3)).unwrap(), &d));
        assert!(!eval_filter(&Filter::field("k", CmpOp::Size(1)).unwrap(), &d));
    }

    #[test]
    fn exists_type_and_negation() {
        let d = doc(json!({ "a": { "b": null } }));
        assert!(eval_filter(&Filter::exists("a.b", true).unwrap(), &d));
        assert!(eval_filter(&Filter::exists("a.c", false).unwrap(), &d));
        assert!(eval_filter(
            &Filter::field("a", CmpOp::TypeIs(vec![ValueKind::Object])).unwrap(),
            &d
        ));
        assert!(!eval_filter(
            &Filter::field("a.c", CmpOp::TypeIs(vec![ValueKind::Null])).unwrap(),
            &d
        ));
        // negation of a missing-field comparison matches
        assert!(eval_filter(&Filter::gt("zz", 1).unwrap().negate(), &d));
    }

    #[test]
    fn empty_and_or() {
        let d = doc(json!({}));
        assert!(eval_filter(&Filter::And(vec![]), &d));
        assert!(!eval_filter(&Filter::Or(vec![]), &d));
    }
}
