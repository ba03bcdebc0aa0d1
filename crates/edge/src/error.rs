use adapt::Error as AdaptError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// The private driver runtime could not be built.
    #[error("runtime error: {0}")]
    Runtime(#[source] io::Error),

    #[error("connection timed out after {0} ms")]
    Timeout(u128),

    #[error("store error: {0}")]
    Store(#[from] AdaptError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
