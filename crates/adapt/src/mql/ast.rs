use crate::{Error, Result};
use domain::{FieldPath, ValueKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Comparison operations on a single field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq(Json),
    Ne(Json),
    Gt(Json),
    Gte(Json),
    Lt(Json),
    Lte(Json),
    In(Vec<Json>),
    Nin(Vec<Json>),
    /// Array field holds an element equal to the value.
    Contains(Json),
    /// Array field holds every listed value.
    All(Vec<Json>),
    Exists(bool),
    Size(i64),
    TypeIs(Vec<ValueKind>),
}

impl CmpOp {
    pub fn name(&self) -> &'static str {
        match self {
            CmpOp::Eq(_) => "eq",
            CmpOp::Ne(_) => "ne",
            CmpOp::Gt(_) => "gt",
            CmpOp::Gte(_) => "gte",
            CmpOp::Lt(_) => "lt",
            CmpOp::Lte(_) => "lte",
            CmpOp::In(_) => "in",
            CmpOp::Nin(_) => "nin",
            CmpOp::Contains(_) => "contains",
            CmpOp::All(_) => "all",
            CmpOp::Exists(_) => "exists",
            CmpOp::Size(_) => "size",
            CmpOp::TypeIs(_) => "type",
        }
    }

    /// Operand of an ordering comparison (`gt`, `gte`, `lt`, `lte`).
    pub fn ordering_operand(&self) -> Option<&Json> {
        match self {
            CmpOp::Gt(v) | CmpOp::Gte(v) | CmpOp::Lt(v) | CmpOp::Lte(v) => Some(v),
            _ => None,
        }
    }
}

/// A single field expression: `<path> <op>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExpr {
    pub path: FieldPath, // e.g. "kind", "meta.tags"
    pub op: CmpOp,
}

impl FieldExpr {
    pub fn new(path: &str, op: CmpOp) -> Result<Self> {
        Ok(Self {
            path: FieldPath::parse(path)?,
            op,
        })
    }
}

/// Filter tree. `And([])` matches everything, `Or([])` matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Field(FieldExpr),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::And(Vec::new())
    }
}

impl Filter {
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn field(path: &str, op: CmpOp) -> Result<Self> {
        Ok(Filter::Field(FieldExpr::new(path, op)?))
    }

    pub fn eq(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Eq(value.into()))
    }

    pub fn ne(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Ne(value.into()))
    }

    pub fn gt(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Gt(value.into()))
    }

    pub fn gte(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Gte(value.into()))
    }

    pub fn lt(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Lt(value.into()))
    }

    pub fn lte(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Lte(value.into()))
    }

    pub fn is_in(path: &str, values: Vec<Json>) -> Result<Self> {
        Self::field(path, CmpOp::In(values))
    }

    pub fn contains(path: &str, value: impl Into<Json>) -> Result<Self> {
        Self::field(path, CmpOp::Contains(value.into()))
    }

    pub fn exists(path: &str, present: bool) -> Result<Self> {
        Self::field(path, CmpOp::Exists(present))
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Depth-first visit of every field expression in the tree.
    pub fn for_each_field<'a>(&'a self, f: &mut impl FnMut(&'a FieldExpr)) {
        match self {
            Filter::And(parts) | Filter::Or(parts) => {
                for part in parts {
                    part.for_each_field(f);
                }
            }
            Filter::Not(inner) => inner.for_each_field(f),
            Filter::Field(expr) => f(expr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    /// Mongo-style direction: `1` ascending, `-1` descending.
    pub fn from_i64(dir: i64) -> Result<Self> {
        match dir {
            1 => Ok(SortDir::Asc),
            -1 => Ok(SortDir::Desc),
            _ => Err(Error::InvalidSort("sort direction must be 1 or -1".into())),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            SortDir::Asc => 1,
            SortDir::Desc => -1,
        }
    }
}

/// Filter plus sort and paging. Immutable once built; `refine` and the
/// builder methods return new values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    filter: Filter,
    sort: Vec<(FieldPath, SortDir)>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Match every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, path: &str, dir: SortDir) -> Result<Self> {
        self.sort.push((FieldPath::parse(path)?, dir));
        Ok(self)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// New query whose filter is the conjunction of this one and `extra`.
    /// Sort and paging carry over.
    pub fn refine(&self, extra: Filter) -> Self {
        let filter = match &self.filter {
            Filter::And(parts) if parts.is_empty() => extra,
            current => current.clone().and(extra),
        };
        Self {
            filter,
            ..self.clone()
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn sort(&self) -> &[(FieldPath, SortDir)] {
        &self.sort
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset_value(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    pub fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset.is_some_and(|o| o > 0)
    }
}
