//! SQLite driver behind `adapt::backend::SqlExec`.
//! - One connection per executor, opened lazily and reopened after a
//!   connectivity failure.
//! - Write batches run in one `BEGIN IMMEDIATE` transaction with rollback on
//!   the first failing statement; inside an explicit transaction they run
//!   under a savepoint instead.

use super::{block_on, runtime};
use crate::error::Result;
use adapt::backend::sql::{SqlExec, SqlExecError, SqlRow, SqlValue};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row, Sqlite, SqliteConnection, Type, ValueRef};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

pub struct SqliteExec {
    runtime: Runtime,
    options: SqliteConnectOptions,
    timeout: Duration,
    conn: Option<SqliteConnection>,
    in_transaction: bool,
}

impl SqliteExec {
    /// Connect eagerly so a bad URL fails at open time.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout);
        let mut exec = Self {
            runtime: runtime()?,
            options,
            timeout,
            conn: None,
            in_transaction: false,
        };
        exec.ensure_connected()
            .map_err(|e| adapt::Error::BackendUnavailable(e.to_string()))?;
        debug!(url, "sqlite connected");
        Ok(exec)
    }

    fn ensure_connected(&mut self) -> Result<(), SqlExecError> {
        if self.conn.is_none() {
            let options = self.options.clone();
            let conn = run(&self.runtime, self.timeout, async move {
                options.connect().await.map_err(classify)
            })?;
            self.conn = Some(conn);
        }
        Ok(())
    }

    /// On connectivity loss, drop the connection so the next call
    /// reconnects.
    fn settle<T>(&mut self, res: Result<T, SqlExecError>) -> Result<T, SqlExecError> {
        if let Err(e @ SqlExecError::Unavailable(_)) = &res {
            warn!(error = %e, in_transaction = self.in_transaction, "sqlite connection dropped");
            self.conn = None;
            self.in_transaction = false;
        }
        res
    }

    fn control(&mut self, sql: &'static str) -> Result<(), SqlExecError> {
        self.ensure_connected()?;
        let Self {
            runtime, timeout, conn, ..
        } = &mut *self;
        let Some(conn) = conn.as_mut() else {
            return Err(SqlExecError::Unavailable("not connected".into()));
        };
        let res = run(runtime, *timeout, async move {
            sqlx::query(sql).execute(&mut *conn).await.map(|_| ()).map_err(classify)
        });
        self.settle(res)
    }
}

impl SqlExec for SqliteExec {
    fn execute(&mut self, statements: Vec<(String, Vec<SqlValue>)>) -> Result<u64, SqlExecError> {
        self.ensure_connected()?;
        let Self {
            runtime, timeout, conn, in_transaction, ..
        } = &mut *self;
        let Some(conn) = conn.as_mut() else {
            return Err(SqlExecError::Unavailable("not connected".into()));
        };
        let res = run(runtime, *timeout, exec_batch(conn, statements, *in_transaction));
        self.settle(res)
    }

    fn fetch_all(&mut self, statement: (String, Vec<SqlValue>)) -> Result<Vec<SqlRow>, SqlExecError> {
        self.ensure_connected()?;
        let Self {
            runtime, timeout, conn, ..
        } = &mut *self;
        let Some(conn) = conn.as_mut() else {
            return Err(SqlExecError::Unavailable("not connected".into()));
        };
        let (sql, binds) = statement;
        let res = run(runtime, *timeout, async move {
            let rows = bind_all(sqlx::query(&sql), binds)
                .fetch_all(&mut *conn)
                .await
                .map_err(classify)?;
            rows.iter().map(decode_row).collect()
        });
        self.settle(res)
    }

    fn begin(&mut self) -> Result<(), SqlExecError> {
        if self.in_transaction {
            return Err(SqlExecError::Statement("transaction already open".into()));
        }
        self.control("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        debug!("sqlite transaction opened");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SqlExecError> {
        if !self.in_transaction {
            return Err(SqlExecError::Statement("no open transaction".into()));
        }
        // a failed COMMIT (e.g. SQLITE_BUSY) leaves the transaction open
        self.control("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SqlExecError> {
        if !self.in_transaction {
            return Err(SqlExecError::Statement("no open transaction".into()));
        }
        self.in_transaction = false;
        self.control("ROLLBACK")
    }

    fn close(&mut self) -> Result<(), SqlExecError> {
        self.in_transaction = false;
        match self.conn.take() {
            Some(conn) => run(&self.runtime, self.timeout, async move {
                conn.close().await.map_err(classify)
            }),
            None => Ok(()),
        }
    }
}

fn run<T>(
    runtime: &Runtime,
    timeout: Duration,
    fut: impl Future<Output = Result<T, SqlExecError>>,
) -> Result<T, SqlExecError> {
    block_on(runtime, timeout, fut).unwrap_or_else(|| {
        Err(SqlExecError::Unavailable(format!(
            "sqlite call timed out after {} ms",
            timeout.as_millis()
        )))
    })
}

/// Execute a batch inside `BEGIN IMMEDIATE … COMMIT`, rolling back on the
/// first error. Inside an open transaction the batch is a savepoint, so a
/// failure undoes only this batch.
async fn exec_batch(
    conn: &mut SqliteConnection,
    statements: Vec<(String, Vec<SqlValue>)>,
    nested: bool,
) -> Result<u64, SqlExecError> {
    let (open, undo, close) = if nested {
        ("SAVEPOINT batch", "ROLLBACK TO batch; RELEASE batch", "RELEASE batch")
    } else {
        ("BEGIN IMMEDIATE", "ROLLBACK", "COMMIT")
    };
    let mut total = 0u64;
    sqlx::query(open).execute(&mut *conn).await.map_err(classify)?;

    for (sql, binds) in statements {
        match bind_all(sqlx::query(&sql), binds).execute(&mut *conn).await {
            Ok(res) => total += res.rows_affected(),
            Err(e) => {
                if let Err(undo_err) = sqlx::raw_sql(undo).execute(&mut *conn).await {
                    warn!(error = %undo_err, "sqlite batch rollback failed");
                }
                return Err(classify(e));
            }
        }
    }

    sqlx::query(close).execute(&mut *conn).await.map_err(classify)?;
    Ok(total)
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_all(mut q: SqliteQuery<'_>, binds: Vec<SqlValue>) -> SqliteQuery<'_> {
    for b in binds {
        q = match b {
            SqlValue::Null => q.bind(None::<i64>),
            SqlValue::Text(s) => q.bind(s),
            SqlValue::Int(i) => q.bind(i64::from(i)),
            SqlValue::Long(i) => q.bind(i),
            SqlValue::Bool(b) => q.bind(b),
            SqlValue::Double(f) => q.bind(f),
        };
    }
    q
}

/// Decode by runtime storage class; `json_extract` columns carry mixed types.
fn decode_row(row: &SqliteRow) -> Result<SqlRow, SqlExecError> {
    let mut out = HashMap::with_capacity(row.columns().len());
    for col in row.columns() {
        let name = col.name();
        let raw = row.try_get_raw(name).map_err(classify)?;
        if raw.is_null() {
            out.insert(name.to_string(), SqlValue::Null);
            continue;
        }
        let runtime = raw.type_info().into_owned();
        let val = if <i64 as Type<Sqlite>>::compatible(&runtime) {
            SqlValue::Long(row.try_get(name).map_err(classify)?)
        } else if <f64 as Type<Sqlite>>::compatible(&runtime) {
            SqlValue::Double(row.try_get(name).map_err(classify)?)
        } else if <String as Type<Sqlite>>::compatible(&runtime) {
            SqlValue::Text(row.try_get(name).map_err(classify)?)
        } else {
            return Err(SqlExecError::Statement(format!(
                "unhandled SQLite type for column `{name}`: {runtime:?}"
            )));
        };
        out.insert(name.to_string(), val);
    }
    Ok(out)
}

pub(crate) fn classify(e: sqlx::Error) -> SqlExecError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SqlExecError::UniqueViolation(db.message().to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SqlExecError::Unavailable(e.to_string()),
        _ => SqlExecError::Statement(e.to_string()),
    }
}
