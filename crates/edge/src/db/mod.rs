//! Driver ports for the synchronous store core.
//!
//! The core never assumes the caller is inside Tokio, so each driver owns a
//! private runtime and blocks on it with a deadline.

mod mongo;
mod sqlite;

pub use mongo::MongoDriver;
pub use sqlite::SqliteExec;

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Current-thread runtime: everything the driver needs runs inside
/// `block_on`.
pub(crate) fn runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)
}

/// One worker keeps driver background tasks (server monitors, pool
/// maintenance) alive between calls.
pub(crate) fn background_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("blitzdb-mongo")
        .enable_all()
        .build()
        .map_err(Error::Runtime)
}

/// `None` when `limit` elapsed first.
pub(crate) fn block_on<F: Future>(runtime: &Runtime, limit: Duration, fut: F) -> Option<F::Output> {
    runtime.block_on(async { tokio::time::timeout(limit, fut).await.ok() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_reports_elapsed_deadline() {
        let rt = runtime().unwrap();
        let slow = block_on(&rt, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            1
        });
        assert_eq!(slow, None);
        assert_eq!(block_on(&rt, Duration::from_secs(1), async { 2 }), Some(2));
    }
}
