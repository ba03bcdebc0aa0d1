// crates/edge/src/cli.rs

use crate::config::StoreConfig;
use adapt::mql::{parse_filter, parse_query};
use adapt::{Filter, Query, Store};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{builder::ValueHint, Parser, Subcommand};
use domain::{Document, Key};
use serde_json::{Map, Value as Json};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info};

/// blitzdb command-line tool
#[derive(Parser, Debug)]
#[command(name = "blitzdb", version, about = "Backend-neutral document store")]
pub struct Cli {
    /// Connection descriptor: memory://, file://DIR, sqlite://FILE, mongodb://HOST/DB
    #[arg(long, global = true, env = "BLITZDB_URL", value_name = "URL")]
    pub url: Option<String>,

    /// Settings file (defaults to ./blitzdb.toml when present)
    #[arg(long, global = true, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Insert a document (JSON object); prints its key
    Put {
        collection: String,
        document: String,
        #[arg(long)]
        key: Option<String>,
        /// Replace an existing document with the same key
        #[arg(long)]
        overwrite: bool,
    },
    /// Print one document by key
    Get { collection: String, key: String },
    /// Delete a document by key
    Delete {
        collection: String,
        key: String,
        /// Fail when the key does not exist
        #[arg(long)]
        strict: bool,
    },
    /// Stream documents matching a query: {"filter":…, "sort":…, "limit":…, "skip":…}
    Find {
        collection: String,
        #[arg(default_value = "{}")]
        query: String,
    },
    /// Count documents matching a filter
    Count {
        collection: String,
        #[arg(default_value = "{}")]
        filter: String,
    },
    /// Manage secondary indexes
    #[command(subcommand)]
    Index(IndexCmd),
    /// Drop a collection with its indexes
    Drop { collection: String },
}

#[derive(Subcommand, Debug)]
pub enum IndexCmd {
    Create {
        collection: String,
        path: String,
        #[arg(long)]
        unique: bool,
    },
    Drop { collection: String, path: String },
    List { collection: String },
}

pub fn start() -> ExitCode {
    let cli = Cli::parse();
    debug!(command = ?cli.command, "command parsed");
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tracing::instrument(skip_all)]
fn run(cli: Cli) -> Result<()> {
    let then = Utc::now();
    let config = StoreConfig::load(cli.config.as_deref(), cli.url.as_deref())
        .context("loading settings (set --url or BLITZDB_URL)")?;
    let mut store = crate::open(&config)?;
    info!(
        "Store opened in {} milliseconds",
        Utc::now().timestamp_millis() - then.timestamp_millis()
    );

    let then = Utc::now();
    execute(&mut store, cli.command)?;
    info!(
        "Command finished in {} milliseconds",
        Utc::now().timestamp_millis() - then.timestamp_millis()
    );
    store.close()?;
    Ok(())
}

fn execute(store: &mut Store, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            collection,
            document,
            key,
            overwrite,
        } => {
            let mut doc = Document::from_json(json_arg(&document)?)?;
            if let Some(key) = key {
                doc = doc.with_key(key);
            }
            let stored = if overwrite {
                store.save(&collection, doc)?
            } else {
                store.insert(&collection, doc)?
            };
            if let Some(key) = stored.key() {
                println!("{key}");
            }
        }
        Commands::Get { collection, key } => {
            let doc = store.get(&collection, &Key::new(key))?;
            println!("{}", render(&doc));
        }
        Commands::Delete {
            collection,
            key,
            strict,
        } => {
            let key = Key::new(key);
            let deleted = if strict {
                store.delete_strict(&collection, &key)?
            } else {
                store.delete(&collection, &key)?
            };
            println!("{}", if deleted { "deleted" } else { "absent" });
        }
        Commands::Find { collection, query } => {
            let query: Query = parse_query(&json_arg(&query)?)?;
            for doc in store.find(&collection, &query)? {
                println!("{}", render(&doc?));
            }
        }
        Commands::Count { collection, filter } => {
            let filter: Filter = parse_filter(&json_arg(&filter)?)?;
            println!("{}", store.count(&collection, &Query::new(filter))?);
        }
        Commands::Index(IndexCmd::Create {
            collection,
            path,
            unique,
        }) => {
            let state = store.create_index(&collection, &path, unique)?;
            println!("{state:?}");
        }
        Commands::Index(IndexCmd::Drop { collection, path }) => {
            store.drop_index(&collection, &path)?;
        }
        Commands::Index(IndexCmd::List { collection }) => {
            for info in store.indexes(&collection) {
                let def = &info.definition;
                println!(
                    "{}\t{}\t{:?}{}{}",
                    def.name(),
                    def.path().as_str(),
                    info.state,
                    if def.unique { "\tunique" } else { "" },
                    if def.delegated { "\tnative" } else { "\temulated" },
                );
            }
        }
        Commands::Drop { collection } => store.drop_collection(&collection)?,
    }
    Ok(())
}

fn json_arg(raw: &str) -> Result<Json> {
    let value: Json = serde_json::from_str(raw).with_context(|| format!("not valid JSON: {raw}"))?;
    if !value.is_object() {
        bail!("expected a JSON object, got {raw}");
    }
    Ok(value)
}

/// Fields plus the key under `_id`.
fn render(doc: &Document) -> Json {
    let mut out = Map::with_capacity(doc.fields().len() + 1);
    if let Some(key) = doc.key() {
        out.insert("_id".into(), Json::from(key.as_str()));
    }
    out.extend(doc.fields().clone());
    Json::Object(out)
}
