// crates/adapt/src/mql/parser.rs

use super::ast::{CmpOp, FieldExpr, Filter, Query, SortDir};
use crate::Error;
use domain::ValueKind;
use serde_json::{Map, Value as Json};

/// Parse a Mongo-style JSON filter into a Filter AST.
///
/// Supported: implicit equality, `$and`, `$or`, `$nor`, `$eq`, `$ne`, `$gt`,
/// `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$all`, `$exists`, `$size`,
/// `$type`, `$elemMatch: {$eq: v}` and per-field `$not`.
pub fn parse_filter(json: &Json) -> Result<Filter, Error> {
    match json {
        Json::Object(map) => {
            let mut filters = Vec::new();

            for (k, v) in map {
                match k.as_str() {
                    "$and" => filters.push(Filter::And(parse_list("$and", v)?)),
                    "$or" => filters.push(Filter::Or(parse_list("$or", v)?)),
                    "$nor" => filters.push(Filter::Not(Box::new(Filter::Or(parse_list(
                        "$nor", v,
                    )?)))),
                    op if op.starts_with('$') => {
                        return Err(Error::InvalidOperator(format!(
                            "unsupported top-level operator {op}"
                        )))
                    }
                    _ => filters.push(parse_field_expr(k, v)?),
                }
            }

            if filters.len() == 1 {
                Ok(filters.remove(0))
            } else {
                Ok(Filter::And(filters))
            }
        }
        _ => Err(Error::InvalidFilter(
            "top-level filter must be an object".into(),
        )),
    }
}

fn parse_list(op: &str, value: &Json) -> Result<Vec<Filter>, Error> {
    match value {
        Json::Array(arr) => arr.iter().map(parse_filter).collect(),
        _ => Err(Error::InvalidFilter(format!("{op} value must be an array"))),
    }
}

fn is_operator_object(map: &Map<String, Json>) -> bool {
    map.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn parse_field_expr(path: &str, v: &Json) -> Result<Filter, Error> {
    let obj = match v {
        Json::Object(obj) if is_operator_object(obj) => obj,
        // Shorthand: { field: value } → Eq, embedded documents included
        _ => return Filter::eq(path, v.clone()),
    };

    let mut and_ops = Vec::new();
    for (op_name, op_val) in obj {
        if op_name == "$not" {
            and_ops.push(parse_not(path, op_val)?);
        } else {
            let cmp = parse_cmp_op(op_name, op_val)?;
            and_ops.push(Filter::Field(FieldExpr::new(path, cmp)?));
        }
    }

    if and_ops.len() == 1 {
        Ok(and_ops.remove(0))
    } else {
        Ok(Filter::And(and_ops))
    }
}

fn parse_not(path: &str, value: &Json) -> Result<Filter, Error> {
    let inner = match value {
        Json::Object(obj) if is_operator_object(obj) => obj,
        _ => {
            return Err(Error::InvalidFilter(
                "$not expects an operator object".into(),
            ))
        }
    };
    let mut parts = Vec::new();
    for (op_name, op_val) in inner {
        let cmp = parse_cmp_op(op_name, op_val)?;
        parts.push(Filter::Field(FieldExpr::new(path, cmp)?));
    }
    let body = if parts.len() == 1 {
        parts.remove(0)
    } else {
        Filter::And(parts)
    };
    Ok(body.negate())
}

fn array_operand<'a>(op: &str, value: &'a Json) -> Result<&'a Vec<Json>, Error> {
    value
        .as_array()
        .ok_or_else(|| Error::InvalidFilter(format!("{op} expects array")))
}

fn parse_cmp_op(op_name: &str, value: &Json) -> Result<CmpOp, Error> {
    use CmpOp::*;

    match op_name {
        "$eq" => Ok(Eq(value.clone())),
        "$ne" => Ok(Ne(value.clone())),
        "$gt" => Ok(Gt(value.clone())),
        "$gte" => Ok(Gte(value.clone())),
        "$lt" => Ok(Lt(value.clone())),
        "$lte" => Ok(Lte(value.clone())),
        "$in" => Ok(In(array_operand(op_name, value)?.clone())),
        "$nin" => Ok(Nin(array_operand(op_name, value)?.clone())),
        "$all" => Ok(All(array_operand(op_name, value)?.clone())),
        "$exists" => {
            let b = value
                .as_bool()
                .ok_or_else(|| Error::InvalidFilter("$exists expects boolean".into()))?;
            Ok(Exists(b))
        }
        "$size" => {
            let n = value
                .as_i64()
                .ok_or_else(|| Error::InvalidFilter("$size expects integer".into()))?;
            Ok(Size(n))
        }
        "$type" => {
            let names: Vec<&Json> = match value {
                Json::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            let kinds = names
                .into_iter()
                .map(|n| {
                    n.as_str()
                        .and_then(ValueKind::from_name)
                        .ok_or_else(|| Error::InvalidFilter(format!("unknown $type {n}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TypeIs(kinds))
        }
        "$elemMatch" => match value.as_object().and_then(|m| m.get("$eq")) {
            Some(v) if value.as_object().is_some_and(|m| m.len() == 1) => Ok(Contains(v.clone())),
            _ => Err(Error::InvalidOperator(
                "$elemMatch only supports {$eq: value}".into(),
            )),
        },
        _ => Err(Error::InvalidOperator(format!(
            "unsupported operator {op_name}"
        ))),
    }
}

/// Parse a full query object:
///
/// ```text
/// { "filter": {...}, "sort": [["field", 1], ["other", -1]], "limit": 10, "skip": 5 }
/// ```
///
/// `sort` may also be an object `{ "field": 1 }`; its keys are applied in
/// lexical order.
pub fn parse_query(json: &Json) -> Result<Query, Error> {
    let obj = match json {
        Json::Object(m) => m,
        _ => return Err(Error::InvalidFilter("query must be an object".into())),
    };

    let filter = match obj.get("filter") {
        Some(f) => parse_filter(f)?,
        None => Filter::all(),
    };
    let mut query = Query::new(filter);

    if let Some(sort_val) = obj.get("sort") {
        for (field, dir) in parse_sort(sort_val)? {
            query = query.sort_by(&field, dir)?;
        }
    }

    if let Some(n) = obj.get("limit").and_then(Json::as_u64) {
        query = query.limit(n as usize);
    }
    if let Some(n) = obj.get("skip").and_then(Json::as_u64) {
        query = query.offset(n as usize);
    }

    Ok(query)
}

fn direction(v: &Json) -> Result<SortDir, Error> {
    let n = v
        .as_i64()
        .ok_or_else(|| Error::InvalidSort("sort direction must be 1 or -1".into()))?;
    SortDir::from_i64(n)
}

fn parse_sort(value: &Json) -> Result<Vec<(String, SortDir)>, Error> {
    match value {
        Json::Object(map) => map
            .iter()
            .map(|(field, dir)| Ok((field.clone(), direction(dir)?)))
            .collect(),
        Json::Array(items) => items
            .iter()
            .map(|item| match item.as_array().map(Vec::as_slice) {
                Some([Json::String(field), dir]) => Ok((field.clone(), direction(dir)?)),
                _ => Err(Error::InvalidSort(
                    "sort entries must be [field, 1|-1] pairs".into(),
                )),
            })
            .collect(),
        _ => Err(Error::InvalidSort(
            "sort must be an object or an array of pairs".into(),
        )),
    }
}
