//! MongoDB driver behind `adapt::backend::mongo::MongoExec`.
//!
//! The client's monitors run on a private one-worker runtime; every call is
//! bounded by the configured timeout.

use super::{background_runtime, block_on};
use crate::error::Result;
use adapt::backend::mongo::{MongoExec, MongoExecError};
use adapt::mql::MongoFind;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{Error as DriverError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use regex::Regex;
use serde_json::Value as Json;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

const DUPLICATE_KEY: i32 = 11000;
const NAMESPACE_NOT_FOUND: i32 = 26;
const INDEX_NOT_FOUND: i32 = 27;

static DUP_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"index: (\S+)").expect("valid duplicate-key pattern")
});

pub struct MongoDriver {
    runtime: Runtime,
    client: Client,
    db: Database,
    timeout: Duration,
}

impl MongoDriver {
    pub fn connect(url: &str, database: &str, timeout: Duration) -> Result<Self> {
        let runtime = background_runtime()?;
        let mut options = block_on(&runtime, timeout, async { ClientOptions::parse(url).await })
            .ok_or(crate::Error::Timeout(timeout.as_millis()))??;
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);
        options.app_name.get_or_insert_with(|| "blitzdb".to_string());
        let client = {
            let _rt = runtime.enter();
            Client::with_options(options)?
        };
        let db = client.database(database);
        debug!(database, "mongo client ready");
        Ok(Self {
            runtime,
            client,
            db,
            timeout,
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    fn run<T>(&self, fut: impl Future<Output = Result<T, DriverError>>) -> Result<T, MongoExecError> {
        match block_on(&self.runtime, self.timeout, fut) {
            Some(res) => res.map_err(classify),
            None => Err(MongoExecError::Unavailable(format!(
                "mongo call timed out after {} ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

impl MongoExec for MongoDriver {
    fn insert_one(&mut self, collection: &str, doc: Json) -> Result<(), MongoExecError> {
        let doc = to_bson(&doc)?;
        let coll = self.collection(collection);
        self.run(async move { coll.insert_one(doc).await.map(|_| ()) })
    }

    fn replace_one(&mut self, collection: &str, key: &str, doc: Json) -> Result<u64, MongoExecError> {
        let doc = to_bson(&doc)?;
        let coll = self.collection(collection);
        self.run(async move {
            coll.replace_one(doc! { "_id": key }, doc)
                .await
                .map(|r| r.matched_count)
        })
    }

    fn delete_one(&mut self, collection: &str, key: &str) -> Result<u64, MongoExecError> {
        let coll = self.collection(collection);
        self.run(async move {
            coll.delete_one(doc! { "_id": key })
                .await
                .map(|r| r.deleted_count)
        })
    }

    fn find(&mut self, collection: &str, find: &MongoFind) -> Result<Vec<Json>, MongoExecError> {
        if find.limit == Some(0) {
            return Ok(Vec::new());
        }
        let filter = to_bson(&find.filter)?;
        let mut sort = Document::new();
        for (path, dir) in &find.sort {
            sort.insert(path.clone(), *dir);
        }
        let coll = self.collection(collection);
        let (skip, limit) = (find.skip, find.limit);
        let docs = self.run(async move {
            let mut action = coll.find(filter).sort(sort).skip(skip);
            if let Some(limit) = limit {
                action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
            }
            action.await?.try_collect::<Vec<Document>>().await
        })?;
        Ok(docs
            .into_iter()
            .map(|d| Bson::Document(d).into_relaxed_extjson())
            .collect())
    }

    fn count(&mut self, collection: &str, filter: &Json) -> Result<u64, MongoExecError> {
        let filter = to_bson(filter)?;
        let coll = self.collection(collection);
        self.run(async move { coll.count_documents(filter).await })
    }

    /// Plain ascending index. Uniqueness is checked by the store because the
    /// server compares embedded objects by key order.
    fn create_index(&mut self, collection: &str, name: &str, path: &str) -> Result<(), MongoExecError> {
        let mut options = IndexOptions::default();
        options.name = Some(name.to_string());
        let model = IndexModel::builder()
            .keys(doc! { path: 1 })
            .options(options)
            .build();
        let coll = self.collection(collection);
        self.run(async move { coll.create_index(model).await.map(|_| ()) })
    }

    fn drop_index(&mut self, collection: &str, name: &str) -> Result<(), MongoExecError> {
        let coll = self.collection(collection);
        let name = name.to_string();
        self.run(async move {
            ignore_codes(
                coll.drop_index(name).await,
                &[NAMESPACE_NOT_FOUND, INDEX_NOT_FOUND],
            )
        })
    }

    fn drop_collection(&mut self, collection: &str) -> Result<(), MongoExecError> {
        let coll = self.collection(collection);
        self.run(async move { ignore_codes(coll.drop().await, &[NAMESPACE_NOT_FOUND]) })
    }

    fn close(&mut self) -> Result<(), MongoExecError> {
        let client = self.client.clone();
        self.run(async move {
            client.shutdown().await;
            Ok(())
        })
    }
}

fn to_bson(value: &Json) -> Result<Document, MongoExecError> {
    bson::to_document(value).map_err(|e| MongoExecError::Command(e.to_string()))
}

fn ignore_codes(res: Result<(), DriverError>, codes: &[i32]) -> Result<(), DriverError> {
    match res {
        Err(e) if matches!(&*e.kind, ErrorKind::Command(c) if codes.contains(&c.code)) => Ok(()),
        other => other,
    }
}

fn classify(e: DriverError) -> MongoExecError {
    let duplicate = |message: &str| MongoExecError::DuplicateKey {
        index: DUP_INDEX
            .captures(message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
    };
    match &*e.kind {
        ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY => duplicate(&w.message),
        ErrorKind::Command(c) if c.code == DUPLICATE_KEY => duplicate(&c.message),
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => MongoExecError::Unavailable(e.to_string()),
        _ => MongoExecError::Command(e.to_string()),
    }
}
