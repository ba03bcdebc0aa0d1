// crates/adapt/src/mql/sql.rs
//
// Filter → SQLite condition over `json1`. Every collection is a table
// `(pk TEXT PRIMARY KEY, rev INTEGER, data TEXT)` with the document fields
// serialized as JSON in `data`.

use super::ast::{CmpOp, FieldExpr, Query, SortDir};
use super::compile::Emitter;
use crate::{Error, Result};
use domain::path::is_identifier;
use domain::{FieldPath, ValueKind};
use sea_query::{
    Alias, Cond, Condition, Expr, Order, Query as SeaQuery, SimpleExpr, SqliteQueryBuilder, Value,
    Values,
};
use serde_json::Value as Json;

pub const PK: &str = "pk";
pub const REV: &str = "rev";
pub const DATA: &str = "data";

/// JSON path operand of `json_extract` and friends.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonPath {
    /// Safe to inline, e.g. `'$.meta.lang'`.
    Literal(String),
    /// Bound as a parameter, e.g. `$."birth-year"`.
    Param(String),
    /// Relative to the current `json_each` row `e`: `e.fullkey` followed by
    /// the (bound) suffix.
    Element(String),
}

/// One step below a JSON path.
#[derive(Debug, Clone, Copy)]
enum Step<'a> {
    Index(usize),
    Key(&'a str),
}

impl JsonPath {
    pub fn of(path: &FieldPath) -> Result<Self> {
        if path.is_identifier() {
            return Ok(JsonPath::Literal(format!("$.{}", path.as_str())));
        }
        let mut out = String::from("$");
        for seg in path.segments() {
            out.push_str(&quoted(seg)?);
        }
        Ok(JsonPath::Param(out))
    }

    fn child(&self, step: Step<'_>) -> Result<Self> {
        let inline = match step {
            Step::Index(i) => Some(format!("[{i}]")),
            Step::Key(k) if is_identifier(k) => Some(format!(".{k}")),
            Step::Key(_) => None,
        };
        let suffix = match (&inline, step) {
            (Some(s), _) => s.clone(),
            (None, Step::Key(k)) => quoted(k)?,
            (None, Step::Index(i)) => format!("[{i}]"),
        };
        Ok(match self {
            JsonPath::Literal(base) if inline.is_some() => JsonPath::Literal(format!("{base}{suffix}")),
            JsonPath::Literal(base) | JsonPath::Param(base) => JsonPath::Param(format!("{base}{suffix}")),
            JsonPath::Element(base) => JsonPath::Element(format!("{base}{suffix}")),
        })
    }
}

fn quoted(key: &str) -> Result<String> {
    if key.contains('"') {
        return Err(Error::InvalidFilter(format!(
            "key {key} cannot be expressed in SQL"
        )));
    }
    Ok(format!(".\"{key}\""))
}

/// SQL text with `?` placeholders and their binds, in placeholder order.
#[derive(Debug, Default)]
struct Sql {
    text: String,
    binds: Vec<Value>,
}

impl Sql {
    /// Render `template` where `{p}` stands for the JSON path and each `?`
    /// consumes the next bind value.
    fn render(template: &str, path: &JsonPath, binds: Vec<Value>) -> Self {
        let mut out = Sql::default();
        let mut binds = binds.into_iter();
        let mut rest = template;

        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("{p}") {
                match path {
                    JsonPath::Literal(lit) => {
                        out.text.push('\'');
                        out.text.push_str(lit);
                        out.text.push('\'');
                    }
                    JsonPath::Param(p) => {
                        out.text.push('?');
                        out.binds.push(Value::from(p.clone()));
                    }
                    JsonPath::Element(suffix) if suffix.is_empty() => out.text.push_str("e.fullkey"),
                    JsonPath::Element(suffix) => {
                        out.text.push_str("(e.fullkey || ?)");
                        out.binds.push(Value::from(suffix.clone()));
                    }
                }
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix('?') {
                out.text.push('?');
                out.binds.extend(binds.next());
                rest = tail;
            } else {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    out.text.push(c);
                }
                rest = chars.as_str();
            }
        }
        out
    }

    fn push(&mut self, other: Sql) {
        self.text.push_str(&other.text);
        self.binds.extend(other.binds);
    }

    /// Parenthesized conjunction of `parts`.
    fn all(parts: Vec<Sql>) -> Self {
        let mut out = Sql::default();
        out.text.push('(');
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out.text.push_str(" AND ");
            }
            out.push(part);
        }
        out.text.push(')');
        out
    }

    fn into_expr(self) -> SimpleExpr {
        Expr::cust_with_values(self.text, self.binds)
    }
}

fn fragment(template: &str, path: &JsonPath, binds: Vec<Value>) -> SimpleExpr {
    Sql::render(template, path, binds).into_expr()
}

const KIND: &str = r#"COALESCE(json_type("data", {p}), '')"#;

fn sqlite_types(kind: ValueKind) -> &'static [&'static str] {
    match kind {
        ValueKind::Null => &["null"],
        ValueKind::Bool => &["true", "false"],
        ValueKind::Number => &["integer", "real"],
        ValueKind::String => &["text"],
        ValueKind::Array => &["array"],
        ValueKind::Object => &["object"],
    }
}

fn type_list(kinds: &[ValueKind]) -> String {
    kinds
        .iter()
        .flat_map(|k| sqlite_types(*k))
        .map(|t| format!("'{t}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn bind_json(v: &Json) -> Value {
    match v {
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::from(s.clone()),
        other => Value::from(other.to_string()),
    }
}

fn constant(truth: bool) -> Condition {
    Cond::all().add(Expr::cust(if truth { "1 = 1" } else { "1 = 0" }))
}

fn leaf(expr: SimpleExpr) -> Condition {
    Cond::all().add(expr)
}

pub struct SqlEmitter;

impl SqlEmitter {
    fn equals(p: &JsonPath, v: &Json) -> Result<SimpleExpr> {
        Ok(equality(p, v, false)?.into_expr())
    }

    fn ordered(p: &JsonPath, op: &str, v: &Json) -> SimpleExpr {
        let kinds = type_list(&[ValueKind::of(v)]);
        fragment(
            &format!(r#"({KIND} IN ({kinds}) AND json_extract("data", {{p}}) {op} ?)"#),
            p,
            vec![bind_json(v)],
        )
    }

    fn contains(p: &JsonPath, v: &Json) -> Result<SimpleExpr> {
        let element = match v {
            Json::Null => Sql::render("e.type = 'null'", p, vec![]),
            Json::Bool(b) => Sql::render(
                &format!("e.type = '{}'", if *b { "true" } else { "false" }),
                p,
                vec![],
            ),
            Json::Number(_) => Sql::render(
                "e.type IN ('integer', 'real') AND e.value = ?",
                p,
                vec![bind_json(v)],
            ),
            Json::String(_) => Sql::render("e.type = 'text' AND e.value = ?", p, vec![bind_json(v)]),
            Json::Array(_) | Json::Object(_) => equality(&JsonPath::Element(String::new()), v, true)?,
        };
        let mut sql = Sql::render(
            &format!(r#"({KIND} = 'array' AND EXISTS (SELECT 1 FROM json_each("data", {{p}}) AS e WHERE "#),
            p,
            vec![],
        );
        sql.push(element);
        sql.text.push_str("))");
        Ok(sql.into_expr())
    }
}

/// Structural equality: numbers compare by value whatever their spelling,
/// arrays element by element, objects key by key regardless of key order.
/// Below the top level a null must be present, not merely absent.
fn equality(p: &JsonPath, v: &Json, nested: bool) -> Result<Sql> {
    let sql = match v {
        Json::Null if nested => Sql::render(r#"json_type("data", {p}) = 'null'"#, p, vec![]),
        Json::Null => Sql::render(r#"COALESCE(json_type("data", {p}), 'null') = 'null'"#, p, vec![]),
        Json::Bool(b) => Sql::render(
            &format!("{KIND} = '{}'", if *b { "true" } else { "false" }),
            p,
            vec![],
        ),
        Json::Number(_) => Sql::render(
            &format!(r#"({KIND} IN ('integer', 'real') AND json_extract("data", {{p}}) = ?)"#),
            p,
            vec![bind_json(v)],
        ),
        Json::String(_) => Sql::render(
            &format!(r#"({KIND} = 'text' AND json_extract("data", {{p}}) = ?)"#),
            p,
            vec![bind_json(v)],
        ),
        Json::Array(items) => {
            let mut parts = vec![Sql::render(
                &format!(r#"{KIND} = 'array' AND json_array_length("data", {{p}}) = ?"#),
                p,
                vec![Value::from(items.len() as i64)],
            )];
            for (i, item) in items.iter().enumerate() {
                parts.push(equality(&p.child(Step::Index(i))?, item, true)?);
            }
            Sql::all(parts)
        }
        Json::Object(fields) => {
            let mut parts = vec![Sql::render(
                &format!(r#"{KIND} = 'object' AND (SELECT COUNT(*) FROM json_each("data", {{p}})) = ?"#),
                p,
                vec![Value::from(fields.len() as i64)],
            )];
            for (key, item) in fields {
                parts.push(equality(&p.child(Step::Key(key))?, item, true)?);
            }
            Sql::all(parts)
        }
    };
    Ok(sql)
}

impl Emitter for SqlEmitter {
    type Output = Condition;

    fn field(&mut self, expr: &FieldExpr) -> Result<Condition> {
        let p = JsonPath::of(&expr.path)?;
        let cond = match &expr.op {
            CmpOp::Eq(v) => leaf(Self::equals(&p, v)?),
            CmpOp::Ne(v) => leaf(Self::equals(&p, v)?).not(),
            CmpOp::Gt(v) => leaf(Self::ordered(&p, ">", v)),
            CmpOp::Gte(v) => leaf(Self::ordered(&p, ">=", v)),
            CmpOp::Lt(v) => leaf(Self::ordered(&p, "<", v)),
            CmpOp::Lte(v) => leaf(Self::ordered(&p, "<=", v)),
            CmpOp::In(vs) => any_of(vs.iter().map(|v| Self::equals(&p, v)).collect::<Result<Vec<_>>>()?),
            CmpOp::Nin(vs) => any_of(vs.iter().map(|v| Self::equals(&p, v)).collect::<Result<Vec<_>>>()?).not(),
            CmpOp::Contains(v) => leaf(Self::contains(&p, v)?),
            CmpOp::All(vs) if vs.is_empty() => constant(false),
            CmpOp::All(vs) => {
                let mut all = Cond::all();
                for v in vs {
                    all = all.add(Self::contains(&p, v)?);
                }
                all
            }
            CmpOp::Exists(true) => leaf(fragment(r#"json_type("data", {p}) IS NOT NULL"#, &p, vec![])),
            CmpOp::Exists(false) => leaf(fragment(r#"json_type("data", {p}) IS NULL"#, &p, vec![])),
            CmpOp::Size(n) => leaf(fragment(
                &format!(r#"({KIND} = 'array' AND json_array_length("data", {{p}}) = ?)"#),
                &p,
                vec![Value::from(*n)],
            )),
            CmpOp::TypeIs(kinds) if kinds.is_empty() => constant(false),
            CmpOp::TypeIs(kinds) => leaf(fragment(
                &format!("{KIND} IN ({})", type_list(kinds)),
                &p,
                vec![],
            )),
        };
        Ok(cond)
    }

    fn and(&mut self, parts: Vec<Condition>) -> Condition {
        if parts.is_empty() {
            return constant(true);
        }
        parts.into_iter().fold(Cond::all(), |c, p| c.add(p))
    }

    fn or(&mut self, parts: Vec<Condition>) -> Condition {
        if parts.is_empty() {
            return constant(false);
        }
        parts.into_iter().fold(Cond::any(), |c, p| c.add(p))
    }

    fn not(&mut self, inner: Condition) -> Condition {
        Cond::all().add(inner).not()
    }
}

fn any_of(exprs: Vec<SimpleExpr>) -> Condition {
    let mut any = Cond::any();
    let mut empty = true;
    for e in exprs {
        any = any.add(e);
        empty = false;
    }
    if empty {
        constant(false)
    } else {
        any
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled SELECT
// ─────────────────────────────────────────────────────────────────────────────

/// Rank of each `json_type` in the cross-backend sort order.
const RANK: &str = r#"CASE json_type("data", {p}) WHEN 'integer' THEN 1 WHEN 'real' THEN 1 WHEN 'text' THEN 2 WHEN 'object' THEN 3 WHEN 'array' THEN 4 WHEN 'true' THEN 5 WHEN 'false' THEN 5 ELSE 0 END"#;

/// Condition plus ordering for one query; the table is chosen at execution.
#[derive(Debug, Clone)]
pub struct SqlQuery {
    condition: Condition,
    order: Vec<(SimpleExpr, Order)>,
    limit: Option<u64>,
    offset: u64,
}

impl SqlQuery {
    pub fn new(condition: Condition, query: &Query) -> Result<Self> {
        let mut order = Vec::new();
        for (path, dir) in query.sort() {
            let p = JsonPath::of(path)?;
            let o = match dir {
                SortDir::Asc => Order::Asc,
                SortDir::Desc => Order::Desc,
            };
            order.push((fragment(RANK, &p, vec![]), o.clone()));
            order.push((fragment(r#"json_extract("data", {p})"#, &p, vec![]), o));
        }
        Ok(Self {
            condition,
            order,
            limit: query.limit_value().map(|l| l as u64),
            offset: query.offset_value() as u64,
        })
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// `SELECT pk, rev, data` for one page of the result.
    pub fn select(&self, table: &str, limit: Option<u64>, offset: u64) -> (String, Values) {
        let mut stmt = SeaQuery::select();
        stmt.columns([Alias::new(PK), Alias::new(REV), Alias::new(DATA)])
            .from(Alias::new(table))
            .cond_where(self.condition.clone());
        for (expr, order) in &self.order {
            stmt.order_by_expr(expr.clone(), order.clone());
        }
        stmt.order_by(Alias::new(PK), Order::Asc);
        match (limit, offset) {
            (Some(n), _) => {
                stmt.limit(n);
            }
            // SQLite needs LIMIT before OFFSET
            (None, o) if o > 0 => {
                stmt.limit(i64::MAX as u64);
            }
            _ => {}
        }
        if offset > 0 {
            stmt.offset(offset);
        }
        stmt.build(SqliteQueryBuilder)
    }

    /// `SELECT COUNT(*) AS n` over the whole match set (paging ignored).
    pub fn count(&self, table: &str) -> (String, Values) {
        SeaQuery::select()
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(Alias::new(table))
            .cond_where(self.condition.clone())
            .build(SqliteQueryBuilder)
    }
}
