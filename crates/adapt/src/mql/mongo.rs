// crates/adapt/src/mql/mongo.rs
//
// Filter → MongoDB query document (as JSON; the driver converts to BSON).
// Mongo reaches into arrays on its own: along dotted paths, in equality and
// in `$type`. Every leaf is narrowed so a path only resolves when no prefix
// is an array and the value itself is compared whole, which is what the
// other backends do.

use super::ast::{CmpOp, FieldExpr, Query};
use super::compile::Emitter;
use crate::Result;
use domain::ValueKind;
use serde_json::{json, Value as Json};

/// Primary key and revision slots in stored Mongo documents.
pub const ID: &str = "_id";
pub const REV: &str = "_rev";

/// Matches nothing: every stored document has an `_id`.
fn never() -> Json {
    json!({ ID: { "$exists": false } })
}

fn type_names(kinds: &[ValueKind]) -> Vec<&'static str> {
    kinds.iter().map(|k| k.name()).collect()
}

fn not_array(path: &str) -> Json {
    json!({ path: { "$not": { "$type": "array" } } })
}

/// Proper prefixes of a dotted path: `a.b.c` → `a`, `a.b`.
fn prefixes(path: &str) -> Vec<&str> {
    path.match_indices('.').map(|(i, _)| &path[..i]).collect()
}

pub struct MongoEmitter;

impl MongoEmitter {
    /// `positive` evaluated only where no prefix of `path` is an array.
    /// When an absent value satisfies the leaf (`null` equality), an array
    /// prefix counts as absent and matches as well.
    fn guarded(path: &str, positive: Json, absent_matches: bool) -> Json {
        let prefixes = prefixes(path);
        if prefixes.is_empty() {
            return positive;
        }
        let mut exact: Vec<Json> = prefixes.iter().map(|p| not_array(p)).collect();
        exact.push(positive);
        let exact = Self::all(exact);
        if !absent_matches {
            return exact;
        }
        let mut any = vec![exact];
        any.extend(prefixes.iter().map(|p| json!({ *p: { "$type": "array" } })));
        Self::any(any)
    }

    fn equals(path: &str, v: &Json) -> Json {
        match v {
            Json::Null => Self::guarded(
                path,
                json!({ "$and": [{ path: null }, not_array(path)] }),
                true,
            ),
            // aggregation equality compares arrays and documents whole
            Json::Array(_) | Json::Object(_) => Self::guarded(
                path,
                json!({ "$expr": { "$eq": [format!("${path}"), { "$literal": v }] } }),
                false,
            ),
            _ => Self::guarded(
                path,
                json!({ "$and": [{ path: { "$eq": v } }, not_array(path)] }),
                false,
            ),
        }
    }

    /// `$elemMatch` narrows (and can use an index); `$expr` makes the element
    /// comparison exact for nested arrays and documents.
    fn contains(path: &str, v: &Json) -> Json {
        let field = format!("${path}");
        Self::guarded(
            path,
            json!({ "$and": [
                { path: { "$elemMatch": { "$eq": v } } },
                { "$expr": { "$in": [
                    { "$literal": v },
                    { "$cond": [{ "$isArray": [&field] }, &field, []] }
                ] } }
            ] }),
            false,
        )
    }

    fn ordered(path: &str, op: &str, v: &Json) -> Json {
        Self::guarded(
            path,
            json!({ "$and": [{ path: { op: v } }, not_array(path)] }),
            false,
        )
    }

    fn exists(path: &str) -> Json {
        Self::guarded(path, json!({ path: { "$exists": true } }), false)
    }

    fn type_is(path: &str, kinds: &[ValueKind]) -> Json {
        let positive = if kinds.contains(&ValueKind::Array) {
            json!({ path: { "$type": type_names(kinds) } })
        } else {
            // `$type` matches array elements too
            json!({ "$and": [{ path: { "$type": type_names(kinds) } }, not_array(path)] })
        };
        Self::guarded(path, positive, false)
    }

    fn any(parts: Vec<Json>) -> Json {
        match parts.len() {
            0 => never(),
            1 => parts.into_iter().next().unwrap_or_else(never),
            _ => json!({ "$or": parts }),
        }
    }

    fn all(parts: Vec<Json>) -> Json {
        match parts.len() {
            0 => json!({}),
            1 => parts.into_iter().next().unwrap_or_default(),
            _ => json!({ "$and": parts }),
        }
    }
}

impl Emitter for MongoEmitter {
    type Output = Json;

    fn field(&mut self, expr: &FieldExpr) -> Result<Json> {
        let path = expr.path.as_str();
        let out = match &expr.op {
            CmpOp::Eq(v) => Self::equals(path, v),
            CmpOp::Ne(v) => json!({ "$nor": [Self::equals(path, v)] }),
            CmpOp::Gt(v) => Self::ordered(path, "$gt", v),
            CmpOp::Gte(v) => Self::ordered(path, "$gte", v),
            CmpOp::Lt(v) => Self::ordered(path, "$lt", v),
            CmpOp::Lte(v) => Self::ordered(path, "$lte", v),
            CmpOp::In(vs) => Self::any(vs.iter().map(|v| Self::equals(path, v)).collect()),
            CmpOp::Nin(vs) => {
                json!({ "$nor": [Self::any(vs.iter().map(|v| Self::equals(path, v)).collect())] })
            }
            CmpOp::Contains(v) => Self::contains(path, v),
            CmpOp::All(vs) if vs.is_empty() => never(),
            CmpOp::All(vs) => Self::all(vs.iter().map(|v| Self::contains(path, v)).collect()),
            CmpOp::Exists(true) => Self::exists(path),
            CmpOp::Exists(false) => json!({ "$nor": [Self::exists(path)] }),
            CmpOp::Size(n) => Self::guarded(path, json!({ path: { "$size": n } }), false),
            CmpOp::TypeIs(kinds) if kinds.is_empty() => never(),
            CmpOp::TypeIs(kinds) => Self::type_is(path, kinds),
        };
        Ok(out)
    }

    fn and(&mut self, parts: Vec<Json>) -> Json {
        Self::all(parts)
    }

    fn or(&mut self, parts: Vec<Json>) -> Json {
        Self::any(parts)
    }

    fn not(&mut self, inner: Json) -> Json {
        json!({ "$nor": [inner] })
    }
}

/// A compiled `find`: filter document, ordered sort keys and paging.
#[derive(Debug, Clone, PartialEq)]
pub struct MongoFind {
    pub filter: Json,
    /// Kept as pairs; JSON objects would lose key order.
    pub sort: Vec<(String, i32)>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl MongoFind {
    pub fn new(filter: Json, query: &Query) -> Self {
        let mut sort: Vec<(String, i32)> = query
            .sort()
            .iter()
            .map(|(p, d)| (p.as_str().to_string(), d.as_i32()))
            .collect();
        sort.push((ID.to_string(), 1));
        Self {
            filter,
            sort,
            skip: query.offset_value() as u64,
            limit: query.limit_value().map(|l| l as u64),
        }
    }

    /// Same filter and ordering, different window.
    pub fn page(&self, skip: u64, limit: Option<u64>) -> Self {
        Self {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            skip,
            limit,
        }
    }
}
