//! Edge of blitzdb: configuration, real database drivers and the CLI.
//!
//! [`open`] turns a [`config::StoreConfig`] into a ready [`adapt::Store`].

pub mod cli;
pub mod config;
pub mod db;

mod error;

pub use config::{Descriptor, StoreConfig};
pub use error::{Error, Result};

use adapt::backend::{BackendAdapter, FileAdapter, MongoAdapter, SqlAdapter};
use adapt::Store;
use db::{MongoDriver, SqliteExec};
use tracing::debug;

/// Open the store selected by `config.url`.
#[tracing::instrument(skip_all, fields(url = %config.url))]
pub fn open(config: &StoreConfig) -> Result<Store> {
    let adapter: Box<dyn BackendAdapter> = match config.descriptor()? {
        Descriptor::Memory => Box::new(FileAdapter::memory()),
        Descriptor::File(root) => Box::new(FileAdapter::open(root)?),
        Descriptor::Sqlite(url) => Box::new(SqlAdapter::new(SqliteExec::connect(&url, config.timeout())?)),
        Descriptor::Mongo { url, database } => Box::new(MongoAdapter::new(MongoDriver::connect(
            &url,
            &database,
            config.timeout(),
        )?)),
    };
    debug!(kind = %adapter.kind(), "adapter ready");
    Ok(Store::open(adapter, config.options())?)
}
