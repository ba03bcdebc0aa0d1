//! SQL adapter (SQLite dialect via SeaQuery 0.32.x).
//! - Builds SQL with SeaQuery and executes via the synchronous `SqlExec` port.
//! - One table per collection, created on first use, plus an index catalog
//!   table.
//! - No SeaQuery types leak through the port.
//! - Results are fetched page by page as the cursor advances.

use super::{check_key, expect_target, key_for, BackendAdapter, BackendKind, Cursor, Delegation};
use crate::mql::sql::{DATA, PK, REV};
use crate::mql::{CompiledQuery, NativeQuery, SqlQuery};
use crate::{Error, Result};
use domain::{Document, FieldPath, IndexDefinition, Key};
use sea_query::{
    Alias, ColumnDef, Expr, OnConflict, Order, Query, SqliteQueryBuilder, Table, Value, Values,
};
use serde_json::{Map, Value as Json};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Port / trait: infra implements this. No SeaQuery types leak here.
// ─────────────────────────────────────────────────────────────────────────────

/// Logical bind values your infra can translate to its own binder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Double(f64),
}

pub type SqlRow = HashMap<String, SqlValue>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SqlExecError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("statement failed: {0}")]
    Statement(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait SqlExec: Send {
    /// Execute the statements atomically; returns affected rows.
    /// Each pair is (sql, binds in placeholder order).
    fn execute(&mut self, statements: Vec<(String, Vec<SqlValue>)>) -> Result<u64, SqlExecError>;

    fn fetch_all(&mut self, statement: (String, Vec<SqlValue>)) -> Result<Vec<SqlRow>, SqlExecError>;

    /// Open a transaction; `execute` batches join it until commit/rollback.
    fn begin(&mut self) -> Result<(), SqlExecError>;

    fn commit(&mut self) -> Result<(), SqlExecError>;

    fn rollback(&mut self) -> Result<(), SqlExecError>;

    fn close(&mut self) -> Result<(), SqlExecError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Statement helpers
// ─────────────────────────────────────────────────────────────────────────────

fn to_sql_values(values: Values) -> Result<Vec<SqlValue>> {
    values
        .0
        .into_iter()
        .map(|v| match v {
            Value::String(Some(s)) => Ok(SqlValue::Text(*s)),
            Value::BigInt(Some(i)) => Ok(SqlValue::Long(i)),
            Value::BigUnsigned(Some(u)) => Ok(SqlValue::Long(i64::try_from(u).unwrap_or(i64::MAX))),
            Value::Int(Some(i)) => Ok(SqlValue::Int(i)),
            Value::Double(Some(f)) => Ok(SqlValue::Double(f)),
            Value::Bool(Some(b)) => Ok(SqlValue::Bool(b)),
            Value::String(None)
            | Value::BigInt(None)
            | Value::BigUnsigned(None)
            | Value::Int(None)
            | Value::Double(None)
            | Value::Bool(None) => Ok(SqlValue::Null),
            other => Err(Error::backend(format!("unsupported bind value {other:?}"))),
        })
        .collect()
}

fn statement((sql, values): (String, Values)) -> Result<(String, Vec<SqlValue>)> {
    Ok((sql, to_sql_values(values)?))
}

fn create_table_sql(table: &str) -> String {
    let mut stmt = Table::create();
    stmt.table(Alias::new(table))
        .if_not_exists()
        .col(ColumnDef::new(Alias::new(PK)).text().not_null().primary_key())
        .col(ColumnDef::new(Alias::new(REV)).big_integer().not_null())
        .col(ColumnDef::new(Alias::new(DATA)).text().not_null());
    stmt.to_string(SqliteQueryBuilder)
}

/// Index catalog table; collection names never start with `__`.
const CATALOG: &str = "__blitzdb_indexes";
const CATALOG_NAME: &str = "name";
const CATALOG_COLLECTION: &str = "collection";
const CATALOG_DEFINITION: &str = "definition";

fn create_catalog_sql() -> String {
    let mut stmt = Table::create();
    stmt.table(Alias::new(CATALOG))
        .if_not_exists()
        .col(ColumnDef::new(Alias::new(CATALOG_NAME)).text().not_null().primary_key())
        .col(ColumnDef::new(Alias::new(CATALOG_COLLECTION)).text().not_null())
        .col(ColumnDef::new(Alias::new(CATALOG_DEFINITION)).text().not_null());
    stmt.to_string(SqliteQueryBuilder)
}

/// Expression index over `json_extract`; only identifier paths get here.
/// Never `UNIQUE`: SQLite would compare `true` and `1` as equal, so
/// uniqueness is checked by the store with the query semantics instead.
fn create_index_sql(def: &IndexDefinition) -> String {
    format!(
        r#"CREATE INDEX IF NOT EXISTS "{}" ON "{}" (json_extract("data", '$.{}'))"#,
        def.name(),
        def.collection(),
        def.path().as_str()
    )
}

fn decode_row(collection: &str, row: &SqlRow) -> Result<Document> {
    let key = match row.get(PK) {
        Some(SqlValue::Text(k)) => Key::new(k.clone()),
        other => return Err(Error::backend(format!("bad pk column: {other:?}"))),
    };
    let rev = match row.get(REV) {
        Some(SqlValue::Long(r)) => *r as u64,
        Some(SqlValue::Int(r)) => *r as u64,
        other => return Err(Error::backend(format!("bad rev column: {other:?}"))),
    };
    let fields: Map<String, Json> = match row.get(DATA) {
        Some(SqlValue::Text(t)) => serde_json::from_str(t)?,
        other => return Err(Error::backend(format!("bad data column: {other:?}"))),
    };
    Ok(Document::from_fields(fields)
        .with_key(key)
        .with_collection(collection)
        .with_revision(rev))
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_PAGE_SIZE: u64 = 256;

pub struct SqlAdapter<E: SqlExec> {
    exec: E,
    page_size: u64,
    tables: HashSet<String>,
    in_transaction: bool,
}

impl<E: SqlExec> SqlAdapter<E> {
    pub fn new(exec: E) -> Self {
        Self {
            exec,
            page_size: DEFAULT_PAGE_SIZE,
            tables: HashSet::new(),
            in_transaction: false,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn to_error(&self, collection: &str, e: SqlExecError) -> Error {
        match e {
            SqlExecError::Unavailable(msg) => Error::BackendUnavailable(msg),
            SqlExecError::UniqueViolation(msg) => Error::UniqueViolation {
                collection: collection.to_string(),
                index: index_from_message(&msg).unwrap_or(msg),
            },
            SqlExecError::Statement(msg) => Error::Backend(msg),
        }
    }

    fn ensure_table(&mut self, collection: &str) -> Result<()> {
        if self.tables.contains(collection) {
            return Ok(());
        }
        let ddl = if collection == CATALOG {
            create_catalog_sql()
        } else {
            create_table_sql(collection)
        };
        self.exec
            .execute(vec![(ddl, vec![])])
            .map_err(|e| self.to_error(collection, e))?;
        self.tables.insert(collection.to_string());
        Ok(())
    }

    fn run(&mut self, collection: &str, stmt: (String, Values)) -> Result<u64> {
        let stmt = statement(stmt)?;
        self.exec
            .execute(vec![stmt])
            .map_err(|e| self.to_error(collection, e))
    }

    fn current_revision(&mut self, collection: &str, key: &Key) -> Result<Option<u64>> {
        let stmt = statement(
            Query::select()
                .column(Alias::new(REV))
                .from(Alias::new(collection))
                .and_where(Expr::col(Alias::new(PK)).eq(key.as_str()))
                .build(SqliteQueryBuilder),
        )?;
        let rows = self
            .exec
            .fetch_all(stmt)
            .map_err(|e| self.to_error(collection, e))?;
        Ok(rows.first().and_then(|r| match r.get(REV) {
            Some(SqlValue::Long(n)) => Some(*n as u64),
            Some(SqlValue::Int(n)) => Some(*n as u64),
            _ => None,
        }))
    }

    fn write_row(
        &mut self,
        collection: &str,
        key: &Key,
        rev: u64,
        data: String,
        replace: bool,
    ) -> Result<()> {
        let stmt = if replace {
            Query::update()
                .table(Alias::new(collection))
                .values([
                    (Alias::new(REV), (rev as i64).into()),
                    (Alias::new(DATA), data.into()),
                ])
                .and_where(Expr::col(Alias::new(PK)).eq(key.as_str()))
                .build(SqliteQueryBuilder)
        } else {
            Query::insert()
                .into_table(Alias::new(collection))
                .columns([Alias::new(PK), Alias::new(REV), Alias::new(DATA)])
                .values([key.as_str().into(), (rev as i64).into(), data.into()])
                .map_err(|e| Error::backend(e.to_string()))?
                .build(SqliteQueryBuilder)
        };
        self.exec
            .execute(vec![statement(stmt)?])
            .map_err(|e| self.to_error(collection, e))?;
        Ok(())
    }
}

/// SQLite reports e.g. `UNIQUE constraint failed: index 'idx_items__name'`.
fn index_from_message(msg: &str) -> Option<String> {
    let start = msg.find("index '")? + "index '".len();
    let end = msg[start..].find('\'')?;
    Some(msg[start..start + end].to_string())
}

fn sql_query(query: &CompiledQuery) -> Result<&SqlQuery> {
    match query.native() {
        NativeQuery::Sql(q) => Ok(q),
        _ => Err(Error::backend("query has no SQL form")),
    }
}

impl<E: SqlExec> BackendAdapter for SqlAdapter<E> {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn insert(&mut self, collection: &str, doc: Document, overwrite: bool) -> Result<Document> {
        self.ensure_table(collection)?;
        let key = key_for(&doc);
        let previous = self.current_revision(collection, &key)?;
        let revision = match previous {
            Some(_) if !overwrite => return Err(Error::duplicate(collection, &key)),
            Some(rev) => rev + 1,
            None => 1,
        };
        let fields = doc.into_fields();
        let data = serde_json::to_string(&fields)?;
        self.write_row(collection, &key, revision, data, previous.is_some())?;
        debug!(collection, key = %key, revision, "sql insert");
        Ok(Document::from_fields(fields)
            .with_key(key)
            .with_collection(collection)
            .with_revision(revision))
    }

    fn update(&mut self, collection: &str, key: &Key, doc: Document) -> Result<Document> {
        check_key(key, &doc)?;
        self.ensure_table(collection)?;
        let revision = match self.current_revision(collection, key)? {
            Some(rev) => rev + 1,
            None => return Err(Error::not_found(collection, key)),
        };
        let fields = doc.into_fields();
        self.write_row(collection, key, revision, serde_json::to_string(&fields)?, true)?;
        Ok(Document::from_fields(fields)
            .with_key(key.clone())
            .with_collection(collection)
            .with_revision(revision))
    }

    fn delete(&mut self, collection: &str, key: &Key, strict: bool) -> Result<bool> {
        self.ensure_table(collection)?;
        let stmt = statement(
            Query::delete()
                .from_table(Alias::new(collection))
                .and_where(Expr::col(Alias::new(PK)).eq(key.as_str()))
                .build(SqliteQueryBuilder),
        )?;
        let affected = self
            .exec
            .execute(vec![stmt])
            .map_err(|e| self.to_error(collection, e))?;
        match affected {
            0 if strict => Err(Error::not_found(collection, key)),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    fn fetch_by_key(&mut self, collection: &str, key: &Key) -> Result<Document> {
        self.ensure_table(collection)?;
        let stmt = statement(
            Query::select()
                .columns([Alias::new(PK), Alias::new(REV), Alias::new(DATA)])
                .from(Alias::new(collection))
                .and_where(Expr::col(Alias::new(PK)).eq(key.as_str()))
                .build(SqliteQueryBuilder),
        )?;
        let rows = self
            .exec
            .fetch_all(stmt)
            .map_err(|e| self.to_error(collection, e))?;
        match rows.first() {
            Some(row) => decode_row(collection, row),
            None => Err(Error::not_found(collection, key)),
        }
    }

    fn execute_query<'a>(
        &'a mut self,
        collection: &str,
        query: &CompiledQuery,
    ) -> Result<Cursor<'a>> {
        expect_target(query, BackendKind::Sql)?;
        let sql = sql_query(query)?.clone();
        self.ensure_table(collection)?;
        Ok(Cursor::new(Pages {
            adapter: self,
            collection: collection.to_string(),
            query: sql,
            fetched: 0,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn count(&mut self, collection: &str, query: &CompiledQuery) -> Result<u64> {
        expect_target(query, BackendKind::Sql)?;
        if query.query().is_paged() {
            let mut n = 0;
            for doc in self.execute_query(collection, query)? {
                doc?;
                n += 1;
            }
            return Ok(n);
        }
        self.ensure_table(collection)?;
        let stmt = statement(sql_query(query)?.count(collection))?;
        let rows = self
            .exec
            .fetch_all(stmt)
            .map_err(|e| self.to_error(collection, e))?;
        match rows.first().and_then(|r| r.get("n")) {
            Some(SqlValue::Long(n)) => Ok(*n as u64),
            Some(SqlValue::Int(n)) => Ok(*n as u64),
            other => Err(Error::backend(format!("bad count result: {other:?}"))),
        }
    }

    fn create_index(&mut self, def: &IndexDefinition) -> Result<Delegation> {
        if !self.supports_native_index(def.path()) {
            return Ok(Delegation::Emulated);
        }
        self.ensure_table(def.collection())?;
        self.exec
            .execute(vec![(create_index_sql(def), vec![])])
            .map_err(|e| self.to_error(def.collection(), e))?;
        debug!(index = %def.name(), "native sql index created");
        Ok(Delegation::Native)
    }

    fn drop_index(&mut self, def: &IndexDefinition) -> Result<()> {
        if !def.delegated {
            return Ok(());
        }
        let sql = format!(r#"DROP INDEX IF EXISTS "{}""#, def.name());
        self.exec
            .execute(vec![(sql, vec![])])
            .map_err(|e| self.to_error(def.collection(), e))?;
        Ok(())
    }

    fn supports_native_index(&self, path: &FieldPath) -> bool {
        path.is_top_level() && path.is_identifier()
    }

    fn drop_collection(&mut self, collection: &str) -> Result<()> {
        let mut stmt = Table::drop();
        stmt.table(Alias::new(collection)).if_exists();
        self.exec
            .execute(vec![(stmt.to_string(SqliteQueryBuilder), vec![])])
            .map_err(|e| self.to_error(collection, e))?;
        self.tables.remove(collection);
        Ok(())
    }

    fn load_catalog(&mut self) -> Result<Vec<IndexDefinition>> {
        self.ensure_table(CATALOG)?;
        let stmt = statement(
            Query::select()
                .column(Alias::new(CATALOG_DEFINITION))
                .from(Alias::new(CATALOG))
                .order_by(Alias::new(CATALOG_NAME), Order::Asc)
                .build(SqliteQueryBuilder),
        )?;
        let rows = self
            .exec
            .fetch_all(stmt)
            .map_err(|e| self.to_error(CATALOG, e))?;
        rows.iter()
            .map(|row| match row.get(CATALOG_DEFINITION) {
                Some(SqlValue::Text(t)) => Ok(serde_json::from_str(t)?),
                other => Err(Error::backend(format!("bad catalog row: {other:?}"))),
            })
            .collect()
    }

    fn record_index(&mut self, def: &IndexDefinition) -> Result<()> {
        self.ensure_table(CATALOG)?;
        let stmt = Query::insert()
            .into_table(Alias::new(CATALOG))
            .columns([
                Alias::new(CATALOG_NAME),
                Alias::new(CATALOG_COLLECTION),
                Alias::new(CATALOG_DEFINITION),
            ])
            .values([
                def.name().into(),
                def.collection().into(),
                serde_json::to_string(def)?.into(),
            ])
            .map_err(|e| Error::backend(e.to_string()))?
            .on_conflict(
                OnConflict::column(Alias::new(CATALOG_NAME))
                    .update_columns([Alias::new(CATALOG_COLLECTION), Alias::new(CATALOG_DEFINITION)])
                    .to_owned(),
            )
            .build(SqliteQueryBuilder);
        self.run(CATALOG, stmt)?;
        Ok(())
    }

    fn forget_index(&mut self, def: &IndexDefinition) -> Result<()> {
        self.ensure_table(CATALOG)?;
        let stmt = Query::delete()
            .from_table(Alias::new(CATALOG))
            .and_where(Expr::col(Alias::new(CATALOG_NAME)).eq(def.name()))
            .build(SqliteQueryBuilder);
        self.run(CATALOG, stmt)?;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::Transaction("already in a transaction".into()));
        }
        self.exec.begin().map_err(|e| self.to_error("", e))?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Transaction("no open transaction".into()));
        }
        // a failed COMMIT leaves the transaction open for `rollback`
        self.exec.commit().map_err(|e| self.to_error("", e))?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Transaction("no open transaction".into()));
        }
        self.in_transaction = false;
        // tables created inside the transaction are gone again
        self.tables.clear();
        self.exec.rollback().map_err(|e| self.to_error("", e))
    }

    fn close(&mut self) -> Result<()> {
        self.exec.close().map_err(|e| self.to_error("", e))
    }
}

/// Page-at-a-time cursor over a compiled SELECT.
struct Pages<'a, E: SqlExec> {
    adapter: &'a mut SqlAdapter<E>,
    collection: String,
    query: SqlQuery,
    fetched: u64,
    buffer: VecDeque<Document>,
    done: bool,
}

impl<E: SqlExec> Pages<'_, E> {
    fn fill(&mut self) -> Result<()> {
        let page_size = self.adapter.page_size;
        let requested = self
            .query
            .limit()
            .map_or(page_size, |l| l.saturating_sub(self.fetched).min(page_size));
        if requested == 0 {
            self.done = true;
            return Ok(());
        }
        let stmt = statement(self.query.select(
            &self.collection,
            Some(requested),
            self.query.offset() + self.fetched,
        ))?;
        let rows = self
            .adapter
            .exec
            .fetch_all(stmt)
            .map_err(|e| self.adapter.to_error(&self.collection, e))?;
        if (rows.len() as u64) < requested {
            self.done = true;
        }
        self.fetched += rows.len() as u64;
        for row in &rows {
            self.buffer.push_back(decode_row(&self.collection, row)?);
        }
        Ok(())
    }
}

impl<E: SqlExec> Iterator for Pages<'_, E> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
