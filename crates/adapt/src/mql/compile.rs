// crates/adapt/src/mql/compile.rs

use super::ast::{CmpOp, FieldExpr, Filter, Query};
use super::eval::eval_cmp;
use super::mongo::{MongoEmitter, MongoFind};
use super::sql::{SqlEmitter, SqlQuery};
use crate::backend::BackendKind;
use crate::{Error, Result};
use domain::{Document, FieldPath, ValueKind};
use serde_json::Value as Json;

/// Per-backend translation of filter nodes. `emit` walks the tree and
/// dispatches each node here, so backends only describe leaves and the
/// three connectives.
pub trait Emitter {
    type Output;

    fn field(&mut self, expr: &FieldExpr) -> Result<Self::Output>;
    fn and(&mut self, parts: Vec<Self::Output>) -> Self::Output;
    fn or(&mut self, parts: Vec<Self::Output>) -> Self::Output;
    fn not(&mut self, inner: Self::Output) -> Self::Output;
}

pub fn emit<E: Emitter>(filter: &Filter, emitter: &mut E) -> Result<E::Output> {
    match filter {
        Filter::Field(expr) => emitter.field(expr),
        Filter::And(parts) => {
            let parts = parts
                .iter()
                .map(|p| emit(p, emitter))
                .collect::<Result<Vec<_>>>()?;
            Ok(emitter.and(parts))
        }
        Filter::Or(parts) => {
            let parts = parts
                .iter()
                .map(|p| emit(p, emitter))
                .collect::<Result<Vec<_>>>()?;
            Ok(emitter.or(parts))
        }
        Filter::Not(inner) => {
            let inner = emit(inner, emitter)?;
            Ok(emitter.not(inner))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Static checks and type guards
// ─────────────────────────────────────────────────────────────────────────────

fn check_operands(filter: &Filter) -> Result<()> {
    let mut failure = None;
    filter.for_each_field(&mut |expr| {
        if failure.is_some() {
            return;
        }
        if let Some(operand) = expr.op.ordering_operand() {
            let kind = ValueKind::of(operand);
            if !kind.is_orderable() {
                failure = Some(Error::TypeMismatch {
                    path: expr.path.to_string(),
                    expected: "number or string".into(),
                    found: kind.to_string(),
                });
            }
        }
        if let CmpOp::Size(n) = expr.op {
            if n < 0 {
                failure = Some(Error::InvalidFilter(format!(
                    "size of {} must not be negative",
                    expr.path
                )));
            }
        }
    });
    failure.map_or(Ok(()), Err)
}

/// What a [`TypeGuard`] demands of the values stored at its path.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardRule {
    /// Ordering comparison: every stored value must be of this kind, null,
    /// or absent.
    Compare(ValueKind),
    /// Sort key: every document matching the filter must hold a scalar (or
    /// nothing) there, reached without crossing an array. Engines disagree
    /// on how arrays and documents sort.
    Sort(Filter),
}

/// Precondition on one path, checked before the main query runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeGuard {
    pub path: FieldPath,
    pub rule: GuardRule,
}

impl TypeGuard {
    /// Filter matching documents that violate the guard.
    pub fn violations(&self) -> Filter {
        let field = |path: &FieldPath, op| {
            Filter::Field(FieldExpr {
                path: path.clone(),
                op,
            })
        };
        match &self.rule {
            GuardRule::Compare(kind) => Filter::Or(vec![
                field(&self.path, CmpOp::TypeIs(vec![ValueKind::Array])),
                Filter::And(vec![
                    field(&self.path, CmpOp::Exists(true)),
                    field(&self.path, CmpOp::TypeIs(vec![*kind, ValueKind::Null])).negate(),
                ]),
            ]),
            GuardRule::Sort(scope) => {
                let mut bad = vec![field(
                    &self.path,
                    CmpOp::TypeIs(vec![ValueKind::Array, ValueKind::Object]),
                )];
                bad.extend(
                    prefixes(&self.path)
                        .into_iter()
                        .map(|p| field(&p, CmpOp::TypeIs(vec![ValueKind::Array]))),
                );
                Filter::And(vec![scope.clone(), Filter::Or(bad)])
            }
        }
    }

    pub fn mismatch(&self, offender: &Document) -> Error {
        let kind_at = |path: &FieldPath| offender.lookup(path.as_str()).map(ValueKind::of);
        match &self.rule {
            GuardRule::Compare(kind) => Error::TypeMismatch {
                path: self.path.to_string(),
                expected: kind.to_string(),
                found: kind_at(&self.path).unwrap_or(ValueKind::Null).to_string(),
            },
            GuardRule::Sort(_) => {
                let (path, found) = prefixes(&self.path)
                    .into_iter()
                    .find(|p| kind_at(p) == Some(ValueKind::Array))
                    .map(|p| (p.to_string(), ValueKind::Array))
                    .unwrap_or_else(|| {
                        (
                            self.path.to_string(),
                            kind_at(&self.path).unwrap_or(ValueKind::Null),
                        )
                    });
                Error::TypeMismatch {
                    path,
                    expected: "scalar".into(),
                    found: found.to_string(),
                }
            }
        }
    }
}

/// Proper prefixes of a path: `a.b.c` → `a`, `a.b`.
fn prefixes(path: &FieldPath) -> Vec<FieldPath> {
    let full = path.as_str();
    full.match_indices('.')
        .filter_map(|(i, _)| FieldPath::parse(&full[..i]).ok())
        .collect()
}

fn type_guards(query: &Query) -> Vec<TypeGuard> {
    let mut guards: Vec<TypeGuard> = Vec::new();
    query.filter().for_each_field(&mut |expr| {
        if let Some(operand) = expr.op.ordering_operand() {
            let guard = TypeGuard {
                path: expr.path.clone(),
                rule: GuardRule::Compare(ValueKind::of(operand)),
            };
            if !guards.contains(&guard) {
                guards.push(guard);
            }
        }
    });
    for (path, _) in query.sort() {
        if !guards
            .iter()
            .any(|g| &g.path == path && matches!(g.rule, GuardRule::Sort(_)))
        {
            guards.push(TypeGuard {
                path: path.clone(),
                rule: GuardRule::Sort(query.filter().clone()),
            });
        }
    }
    guards
}

// ─────────────────────────────────────────────────────────────────────────────
// Index constraints
// ─────────────────────────────────────────────────────────────────────────────

/// A top-level conjunct an emulated index can answer.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexConstraint {
    Eq { path: FieldPath, value: Json },
    In { path: FieldPath, values: Vec<Json> },
    Contains { path: FieldPath, value: Json },
}

impl IndexConstraint {
    pub fn path(&self) -> &FieldPath {
        match self {
            IndexConstraint::Eq { path, .. }
            | IndexConstraint::In { path, .. }
            | IndexConstraint::Contains { path, .. } => path,
        }
    }

    /// Re-check the constraint against a fetched document.
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = doc.lookup(self.path().as_str());
        match self {
            IndexConstraint::Eq { value, .. } => eval_cmp(&CmpOp::Eq(value.clone()), actual),
            IndexConstraint::In { values, .. } => eval_cmp(&CmpOp::In(values.clone()), actual),
            IndexConstraint::Contains { value, .. } => {
                eval_cmp(&CmpOp::Contains(value.clone()), actual)
            }
        }
    }
}

fn collect_constraints(filter: &Filter, out: &mut Vec<IndexConstraint>) {
    match filter {
        Filter::And(parts) => {
            for part in parts {
                collect_constraints(part, out);
            }
        }
        Filter::Field(FieldExpr { path, op }) => match op {
            // null also matches absent fields, which an index never lists
            CmpOp::Eq(v) if !v.is_null() => out.push(IndexConstraint::Eq {
                path: path.clone(),
                value: v.clone(),
            }),
            CmpOp::In(values) if !values.iter().any(Json::is_null) => {
                out.push(IndexConstraint::In {
                    path: path.clone(),
                    values: values.clone(),
                })
            }
            CmpOp::Contains(v) => out.push(IndexConstraint::Contains {
                path: path.clone(),
                value: v.clone(),
            }),
            _ => {}
        },
        // disjunctions and negations can match outside any single bucket
        Filter::Or(_) | Filter::Not(_) => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled form
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum NativeQuery {
    /// Evaluated in-process over the source documents.
    Scan,
    Sql(SqlQuery),
    Mongo(MongoFind),
}

/// Result of compiling a [`Query`] for one backend kind. Immutable and
/// reusable across executions.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    query: Query,
    target: BackendKind,
    native: NativeQuery,
    guards: Vec<TypeGuard>,
    hints: Vec<IndexConstraint>,
}

impl CompiledQuery {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn target(&self) -> BackendKind {
        self.target
    }

    pub fn native(&self) -> &NativeQuery {
        &self.native
    }

    pub fn guards(&self) -> &[TypeGuard] {
        &self.guards
    }

    pub fn hints(&self) -> &[IndexConstraint] {
        &self.hints
    }
}

/// Compile `query` for `target`. Fails with `TypeMismatch` when an ordering
/// comparison has a non-orderable operand.
pub fn compile(query: &Query, target: BackendKind) -> Result<CompiledQuery> {
    check_operands(query.filter())?;

    let native = match target {
        BackendKind::File => NativeQuery::Scan,
        BackendKind::Sql => {
            let condition = emit(query.filter(), &mut SqlEmitter)?;
            NativeQuery::Sql(SqlQuery::new(condition, query)?)
        }
        BackendKind::Mongo => {
            let filter = emit(query.filter(), &mut MongoEmitter)?;
            NativeQuery::Mongo(MongoFind::new(filter, query))
        }
    };

    let mut hints = Vec::new();
    collect_constraints(query.filter(), &mut hints);

    Ok(CompiledQuery {
        query: query.clone(),
        target,
        native,
        guards: type_guards(query),
        hints,
    })
}
