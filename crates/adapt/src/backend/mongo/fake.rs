//! In-memory stand-in for a Mongo server.
//!
//! Query documents are matched with the server's own rules, written out
//! here without going through the filter parser or evaluator: dotted paths
//! descend into arrays of documents, equality and `$type` also match array
//! elements, `null` matches missing fields and arrays holding `null`, `$expr`
//! runs aggregation expressions, and an array sort key sorts by its smallest
//! (ascending) or largest (descending) element.

use super::{MongoExec, MongoExecError, PRIMARY_INDEX};
use crate::mql::mongo::ID;
use crate::mql::MongoFind;
use domain::value::{compare_values, values_equal};
use domain::ValueKind;
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

type Outcome<T> = Result<T, MongoExecError>;

#[derive(Default)]
pub struct FakeMongo {
    pub collections: HashMap<String, BTreeMap<String, Json>>,
    /// (collection, index name) → path
    pub indexes: HashMap<(String, String), String>,
    /// Shared so a test can take the server down after handing the fake over.
    pub down: Arc<AtomicBool>,
}

impl FakeMongo {
    fn check(&self) -> Outcome<()> {
        if self.down.load(AtomicOrdering::Relaxed) {
            Err(MongoExecError::Unavailable("server selection timeout".into()))
        } else {
            Ok(())
        }
    }
}

fn unsupported(what: impl std::fmt::Display) -> MongoExecError {
    MongoExecError::Command(format!("unsupported: {what}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Path resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Values a query path reaches, and whether some branch ended early.
#[derive(Debug, Default)]
struct Reach<'a> {
    values: Vec<&'a Json>,
    missing: bool,
}

fn reach<'a>(doc: &'a Json, path: &str) -> Reach<'a> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Reach::default();
    walk(doc, &segments, &mut out);
    out
}

fn walk<'a>(cur: &'a Json, segments: &[&str], out: &mut Reach<'a>) {
    let Some((head, rest)) = segments.split_first() else {
        out.values.push(cur);
        return;
    };
    match cur {
        Json::Object(fields) => match fields.get(*head) {
            Some(next) => walk(next, rest, out),
            None => out.missing = true,
        },
        Json::Array(items) => {
            if let Ok(i) = head.parse::<usize>() {
                match items.get(i) {
                    Some(next) => walk(next, rest, out),
                    None => out.missing = true,
                }
                return;
            }
            if items.is_empty() {
                out.missing = true;
            }
            for item in items {
                match item {
                    Json::Object(_) => walk(item, segments, out),
                    _ => out.missing = true,
                }
            }
        }
        _ => out.missing = true,
    }
}

/// Every reached value plus the elements of reached arrays.
fn candidates<'a>(reach: &Reach<'a>) -> Vec<&'a Json> {
    let mut out = Vec::new();
    for &v in &reach.values {
        out.push(v);
        if let Json::Array(items) = v {
            out.extend(items.iter());
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Query documents
// ─────────────────────────────────────────────────────────────────────────────

fn matches(doc: &Json, filter: &Json) -> Outcome<bool> {
    let Json::Object(conditions) = filter else {
        return Err(unsupported(format!("filter {filter}")));
    };
    for (key, arg) in conditions {
        let ok = match key.as_str() {
            "$and" => all_of(doc, arg)?,
            "$or" => any_of(doc, arg)?,
            "$nor" => !any_of(doc, arg)?,
            "$expr" => truthy(&expression(doc, arg)?),
            op if op.starts_with('$') => return Err(unsupported(op)),
            path => field_matches(doc, path, arg)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses(arg: &Json) -> Outcome<&Vec<Json>> {
    match arg {
        Json::Array(items) if !items.is_empty() => Ok(items),
        other => Err(MongoExecError::Command(format!(
            "$and/$or/$nor needs a nonempty array, got {other}"
        ))),
    }
}

fn all_of(doc: &Json, arg: &Json) -> Outcome<bool> {
    for clause in clauses(arg)? {
        if !matches(doc, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(doc: &Json, arg: &Json) -> Outcome<bool> {
    for clause in clauses(arg)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(v: &Json) -> Option<&Map<String, Json>> {
    match v {
        Json::Object(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => Some(ops),
        _ => None,
    }
}

fn field_matches(doc: &Json, path: &str, cond: &Json) -> Outcome<bool> {
    let r = reach(doc, path);
    match is_operator_object(cond) {
        Some(ops) => operators_match(&r, ops),
        None => Ok(equals(&r, cond)),
    }
}

fn equals(r: &Reach<'_>, literal: &Json) -> bool {
    if literal.is_null() && (r.missing || r.values.is_empty()) {
        return true;
    }
    candidates(r).into_iter().any(|v| values_equal(v, literal))
}

fn compares(r: &Reach<'_>, literal: &Json, accept: impl Fn(Ordering) -> bool) -> bool {
    let bracket = ValueKind::of(literal);
    candidates(r)
        .into_iter()
        .filter(|v| ValueKind::of(v) == bracket && bracket.is_orderable())
        .any(|v| accept(compare_values(Some(v), Some(literal))))
}

fn has_type(v: &Json, names: &[String]) -> bool {
    names.iter().any(|n| ValueKind::from_name(n) == Some(ValueKind::of(v)))
}

fn operators_match(r: &Reach<'_>, ops: &Map<String, Json>) -> Outcome<bool> {
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(r, arg),
            "$ne" => !equals(r, arg),
            "$gt" => compares(r, arg, |o| o == Ordering::Greater),
            "$gte" => compares(r, arg, |o| o != Ordering::Less),
            "$lt" => compares(r, arg, |o| o == Ordering::Less),
            "$lte" => compares(r, arg, |o| o != Ordering::Greater),
            "$in" => list(arg)?.iter().any(|v| equals(r, v)),
            "$nin" => !list(arg)?.iter().any(|v| equals(r, v)),
            "$exists" => !r.values.is_empty() == arg.as_bool().unwrap_or(true),
            "$size" => r
                .values
                .iter()
                .any(|v| matches!(v, Json::Array(items) if Some(items.len() as u64) == arg.as_u64())),
            "$type" => {
                let names: Vec<String> = match arg {
                    Json::String(n) => vec![n.clone()],
                    Json::Array(ns) => ns.iter().filter_map(|n| n.as_str().map(String::from)).collect(),
                    other => return Err(unsupported(format!("$type {other}"))),
                };
                candidates(r).into_iter().any(|v| has_type(v, &names))
            }
            "$elemMatch" => {
                let inner = is_operator_object(arg).ok_or_else(|| unsupported("$elemMatch on documents"))?;
                let mut found = false;
                for v in &r.values {
                    if let Json::Array(items) = v {
                        for item in items {
                            let one = Reach {
                                values: vec![item],
                                missing: false,
                            };
                            if operators_match(&one, inner)? {
                                found = true;
                            }
                        }
                    }
                }
                found
            }
            "$not" => {
                let inner = is_operator_object(arg).ok_or_else(|| unsupported("$not without operators"))?;
                !operators_match(r, inner)?
            }
            other => return Err(unsupported(other)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn list(arg: &Json) -> Outcome<&Vec<Json>> {
    arg.as_array()
        .ok_or_else(|| MongoExecError::Command(format!("expected an array, got {arg}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregation expressions (`$expr`)
// ─────────────────────────────────────────────────────────────────────────────

/// `None` is a missing value.
fn expression(doc: &Json, e: &Json) -> Outcome<Option<Json>> {
    match e {
        Json::String(s) if s.starts_with('$') => Ok(field_value(doc, &s[1..])),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expression(doc, item)?.unwrap_or(Json::Null));
            }
            Ok(Some(Json::Array(out)))
        }
        Json::Object(fields) => match fields.iter().next() {
            Some((op, arg)) if fields.len() == 1 && op.starts_with('$') => operator(doc, op, arg),
            _ => {
                let mut out = Map::new();
                for (k, v) in fields {
                    if let Some(v) = expression(doc, v)? {
                        out.insert(k.clone(), v);
                    }
                }
                Ok(Some(Json::Object(out)))
            }
        },
        literal => Ok(Some(literal.clone())),
    }
}

fn operator(doc: &Json, op: &str, arg: &Json) -> Outcome<Option<Json>> {
    let args = |n: usize| -> Outcome<Vec<Option<Json>>> {
        match arg {
            Json::Array(items) if items.len() == n => items.iter().map(|i| expression(doc, i)).collect(),
            single if n == 1 => Ok(vec![expression(doc, single)?]),
            other => Err(MongoExecError::Command(format!("{op} takes {n} arguments, got {other}"))),
        }
    };
    let value = match op {
        "$literal" => arg.clone(),
        "$eq" => {
            let a = args(2)?;
            Json::Bool(match (&a[0], &a[1]) {
                (None, None) => true,
                (Some(x), Some(y)) => values_equal(x, y),
                _ => false,
            })
        }
        "$in" => {
            let a = args(2)?;
            match &a[1] {
                Some(Json::Array(items)) => Json::Bool(
                    a[0].as_ref()
                        .is_some_and(|x| items.iter().any(|i| values_equal(x, i))),
                ),
                _ => return Err(MongoExecError::Command("$in needs an array".into())),
            }
        }
        "$isArray" => Json::Bool(matches!(args(1)?[0], Some(Json::Array(_)))),
        "$cond" => {
            let parts = list(arg)?;
            let [test, then, otherwise] = parts.as_slice() else {
                return Err(MongoExecError::Command("$cond takes 3 arguments".into()));
            };
            let branch = if truthy(&expression(doc, test)?) { then } else { otherwise };
            return expression(doc, branch);
        }
        other => return Err(unsupported(other)),
    };
    Ok(Some(value))
}

/// Aggregation field path: maps over arrays instead of reaching into them.
fn field_value(doc: &Json, path: &str) -> Option<Json> {
    path.split('.').try_fold(doc.clone(), step)
}

fn step(cur: Json, segment: &str) -> Option<Json> {
    match cur {
        Json::Object(mut fields) => fields.remove(segment),
        Json::Array(items) => Some(Json::Array(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Json::Object(_) | Json::Array(_) => step(item, segment),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

fn truthy(v: &Option<Json>) -> bool {
    match v {
        None | Some(Json::Null) => false,
        Some(Json::Bool(b)) => *b,
        Some(Json::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sorting
// ─────────────────────────────────────────────────────────────────────────────

fn sort_key(doc: &Json, path: &str, ascending: bool) -> Option<Json> {
    let r = reach(doc, path);
    let mut keys: Vec<&Json> = Vec::new();
    for &v in &r.values {
        match v {
            Json::Array(items) if !items.is_empty() => keys.extend(items.iter()),
            other => keys.push(other),
        }
    }
    let pick = keys.into_iter().reduce(|a, b| {
        let ord = compare_values(Some(a), Some(b));
        match (ascending, ord) {
            (true, Ordering::Greater) | (false, Ordering::Less) => b,
            _ => a,
        }
    });
    pick.cloned()
}

impl MongoExec for FakeMongo {
    fn insert_one(&mut self, collection: &str, doc: Json) -> Outcome<()> {
        self.check()?;
        let id = doc.get(ID).and_then(Json::as_str).unwrap_or_default().to_string();
        if self.collections.get(collection).is_some_and(|c| c.contains_key(&id)) {
            return Err(MongoExecError::DuplicateKey {
                index: PRIMARY_INDEX.into(),
            });
        }
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, doc);
        Ok(())
    }

    fn replace_one(&mut self, collection: &str, key: &str, doc: Json) -> Outcome<u64> {
        self.check()?;
        match self.collections.get_mut(collection).and_then(|c| c.get_mut(key)) {
            Some(slot) => {
                *slot = doc;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_one(&mut self, collection: &str, key: &str) -> Outcome<u64> {
        self.check()?;
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(key));
        Ok(u64::from(removed.is_some()))
    }

    fn find(&mut self, collection: &str, find: &MongoFind) -> Outcome<Vec<Json>> {
        self.check()?;
        let mut docs = Vec::new();
        if let Some(stored) = self.collections.get(collection) {
            for doc in stored.values() {
                if matches(doc, &find.filter)? {
                    docs.push(doc.clone());
                }
            }
        }
        docs.sort_by(|a, b| {
            for (path, dir) in &find.sort {
                let ascending = *dir >= 0;
                let ord = compare_values(
                    sort_key(a, path, ascending).as_ref(),
                    sort_key(b, path, ascending).as_ref(),
                );
                if ord != Ordering::Equal {
                    return if ascending { ord } else { ord.reverse() };
                }
            }
            Ordering::Equal
        });
        Ok(docs
            .into_iter()
            .skip(find.skip as usize)
            .take(find.limit.map_or(usize::MAX, |l| l as usize))
            .collect())
    }

    fn count(&mut self, collection: &str, filter: &Json) -> Outcome<u64> {
        let all = MongoFind {
            filter: filter.clone(),
            sort: Vec::new(),
            skip: 0,
            limit: None,
        };
        Ok(self.find(collection, &all)?.len() as u64)
    }

    fn create_index(&mut self, collection: &str, name: &str, path: &str) -> Outcome<()> {
        self.check()?;
        self.indexes
            .insert((collection.to_string(), name.to_string()), path.to_string());
        Ok(())
    }

    fn drop_index(&mut self, collection: &str, name: &str) -> Outcome<()> {
        self.check()?;
        self.indexes
            .remove(&(collection.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| MongoExecError::Command(format!("index not found: {name}")))
    }

    fn drop_collection(&mut self, collection: &str) -> Outcome<()> {
        self.check()?;
        self.collections.remove(collection);
        self.indexes.retain(|(c, _), _| c != collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::compile::emit;
    use crate::mql::eval::eval_filter;
    use crate::mql::mongo::MongoEmitter;
    use crate::mql::{CmpOp, Filter};
    use domain::Document;
    use serde_json::json;

    fn hits(docs: &[Json], filter: &Json) -> Vec<String> {
        docs.iter()
            .filter(|d| matches(d, filter).unwrap())
            .map(|d| d[ID].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn raw_documents_follow_server_rules() {
        let docs = [
            json!({ "_id": "null", "a": null }),
            json!({ "_id": "holds-null", "a": [null, 1] }),
            json!({ "_id": "missing" }),
            json!({ "_id": "nested", "a": [{ "b": 1 }, { "b": 2 }] }),
        ];
        assert_eq!(hits(&docs, &json!({ "a": null })), vec!["null", "holds-null", "missing"]);
        assert_eq!(hits(&docs, &json!({ "a": 1 })), vec!["holds-null"]);
        assert_eq!(hits(&docs, &json!({ "a.b": 2 })), vec!["nested"]);
        assert_eq!(hits(&docs, &json!({ "a": { "$type": "null" } })), vec!["null", "holds-null"]);
        assert_eq!(
            hits(&docs, &json!({ "$expr": { "$eq": ["$a.b", { "$literal": [1, 2] }] } })),
            vec!["nested"]
        );
    }

    #[test]
    fn arrays_sort_by_their_extreme_element() {
        let mut fake = FakeMongo::default();
        for (id, v) in [("x", json!([5, 1])), ("y", json!(3)), ("z", json!([2, 4]))] {
            fake.insert_one("c", json!({ "_id": id, "v": v })).unwrap();
        }
        let order = |dir: i32, fake: &mut FakeMongo| -> Vec<String> {
            let find = MongoFind {
                filter: json!({}),
                sort: vec![("v".into(), dir), (ID.into(), 1)],
                skip: 0,
                limit: None,
            };
            fake.find("c", &find)
                .unwrap()
                .iter()
                .map(|d| d[ID].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(order(1, &mut fake), vec!["x", "z", "y"]);
        assert_eq!(order(-1, &mut fake), vec!["x", "z", "y"]);
    }

    /// Documents chosen where server matching and whole-value evaluation
    /// part ways: arrays on the path, arrays holding null, nested arrays,
    /// numbers spelled differently.
    fn corpus() -> Vec<Json> {
        vec![
            json!({ "_id": "1", "a": null }),
            json!({ "_id": "2", "a": [null, 1] }),
            json!({ "_id": "3", "a": [1, 2] }),
            json!({ "_id": "4", "a": 1 }),
            json!({ "_id": "5" }),
            json!({ "_id": "6", "a": { "b": 1 } }),
            json!({ "_id": "7", "a": [{ "b": 1 }, { "b": 2 }] }),
            json!({ "_id": "8", "a": [[1, 2], 3] }),
            json!({ "_id": "9", "a": "x", "w": [1.0, 2], "o": { "a": 1, "b": 2 } }),
            json!({ "_id": "10", "a": [], "t": true }),
            json!({ "_id": "11", "a": 1.0, "t": 1 }),
            json!({ "_id": "12", "a": { "b": null } }),
            json!({ "_id": "13", "a": [{ "b": [1, 2] }] }),
            json!({ "_id": "14", "a": [{ "b": 1 }] }),
            json!({ "_id": "15", "a": { "b": [null] } }),
        ]
    }

    fn filters() -> Vec<Filter> {
        let f = |path: &str, op: CmpOp| Filter::field(path, op).unwrap();
        vec![
            Filter::eq("a", Json::Null).unwrap(),
            Filter::ne("a", Json::Null).unwrap(),
            Filter::eq("a", 1).unwrap(),
            Filter::ne("a", 1).unwrap(),
            Filter::eq("a", json!([1, 2])).unwrap(),
            Filter::eq("a", json!([])).unwrap(),
            Filter::eq("a", json!({ "b": 1 })).unwrap(),
            Filter::contains("a", 1).unwrap(),
            Filter::contains("a", Json::Null).unwrap(),
            Filter::contains("a", json!([1, 2])).unwrap(),
            Filter::contains("a", json!({ "b": 1 })).unwrap(),
            f("a", CmpOp::All(vec![json!(1), json!(2)])),
            Filter::eq("a.b", 1).unwrap(),
            Filter::eq("a.b", Json::Null).unwrap(),
            Filter::ne("a.b", Json::Null).unwrap(),
            Filter::eq("a.b", json!([1, 2])).unwrap(),
            Filter::contains("a.b", Json::Null).unwrap(),
            Filter::exists("a.b", true).unwrap(),
            Filter::exists("a.b", false).unwrap(),
            Filter::exists("a", false).unwrap(),
            Filter::gt("a", 0).unwrap(),
            Filter::lte("a.b", 1).unwrap(),
            Filter::is_in("a", vec![Json::Null, json!(1)]).unwrap(),
            f("a", CmpOp::Nin(vec![json!(1)])),
            f("a", CmpOp::Size(2)),
            f("a.b", CmpOp::Size(2)),
            f("a", CmpOp::TypeIs(vec![ValueKind::Null])),
            f("a", CmpOp::TypeIs(vec![ValueKind::Number])),
            f("a", CmpOp::TypeIs(vec![ValueKind::Array])),
            f("a.b", CmpOp::TypeIs(vec![ValueKind::Number])),
            Filter::eq("w", json!([1, 2])).unwrap(),
            Filter::eq("o", json!({ "b": 2, "a": 1 })).unwrap(),
            Filter::eq("t", true).unwrap(),
            Filter::eq("t", 1).unwrap(),
            Filter::eq("a.b", 1).unwrap().negate(),
            Filter::eq("a", 1).unwrap().or(Filter::eq("a.b", 2).unwrap()),
        ]
    }

    #[test]
    fn emitted_filters_agree_with_in_process_evaluation() {
        let docs = corpus();
        for filter in filters() {
            let emitted = emit(&filter, &mut MongoEmitter).unwrap();
            let expected: Vec<String> = docs
                .iter()
                .filter(|d| {
                    let mut fields = d.as_object().cloned().unwrap_or_default();
                    fields.remove(ID);
                    eval_filter(&filter, &Document::from_fields(fields))
                })
                .map(|d| d[ID].as_str().unwrap().to_string())
                .collect();
            assert_eq!(hits(&docs, &emitted), expected, "{filter:?} as {emitted}");
        }
    }
}
