// crates/edge/src/config.rs
//
// Store configuration: optional `blitzdb.toml` layered under `BLITZDB_*`
// environment variables, plus the connection descriptor grammar.

use crate::error::Result;
use adapt::{Error as AdaptError, IndexBuildMode, StoreOptions};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "blitzdb";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BUILD_BATCH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSetting {
    #[default]
    Immediate,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Connection descriptor, e.g. `file:///var/lib/blitz` or `sqlite://db.sqlite`.
    pub url: String,
    /// Mongo database; overrides the one in the URL path.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub index_build: BuildSetting,
    #[serde(default = "default_build_batch")]
    pub build_batch: usize,
    #[serde(default)]
    pub strict_delete: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_build_batch() -> usize {
    DEFAULT_BUILD_BATCH
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            index_build: BuildSetting::Immediate,
            build_batch: DEFAULT_BUILD_BATCH,
            strict_delete: false,
        }
    }

    /// Load from `file` (default `blitzdb.toml`, optional) and the
    /// environment (`BLITZDB_URL`, `BLITZDB_TIMEOUT_MS`, ...). Environment
    /// wins over the file; `url` wins over both.
    pub fn load(file: Option<&Path>, url: Option<&str>) -> Result<Self> {
        let file = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name("blitzdb").required(false),
        };
        let cfg = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("BLITZDB").try_parsing(true))
            .set_override_option("url", url)?
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            index_build: match self.index_build {
                BuildSetting::Immediate => IndexBuildMode::Immediate,
                BuildSetting::Incremental => IndexBuildMode::Incremental {
                    batch: self.build_batch,
                },
            },
            strict_delete: self.strict_delete,
        }
    }

    pub fn descriptor(&self) -> Result<Descriptor, AdaptError> {
        Descriptor::parse(&self.url, self.database.as_deref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Backend selected by a connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Memory,
    File(PathBuf),
    /// sqlx SQLite URL, passed through unchanged.
    Sqlite(String),
    Mongo { url: String, database: String },
}

impl Descriptor {
    pub fn parse(url: &str, database: Option<&str>) -> Result<Self, AdaptError> {
        let invalid = || AdaptError::InvalidDescriptor(url.to_string());
        if url == "memory://" || url == "memory:" {
            return Ok(Descriptor::Memory);
        }
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Descriptor::File(PathBuf::from(path)));
        }
        if url.starts_with("sqlite:") {
            if url == "sqlite:" || url == "sqlite://" {
                return Err(invalid());
            }
            return Ok(Descriptor::Sqlite(url.to_string()));
        }
        let rest = url
            .strip_prefix("mongodb://")
            .or_else(|| url.strip_prefix("mongodb+srv://"));
        if let Some(rest) = rest {
            let (hosts, path) = rest.split_once('/').unwrap_or((rest, ""));
            if hosts.is_empty() {
                return Err(invalid());
            }
            let from_url = path.split('?').next().unwrap_or_default();
            let database = match (database, from_url) {
                (Some(db), _) => db.to_string(),
                (None, "") => DEFAULT_DATABASE.to_string(),
                (None, db) => db.to_string(),
            };
            return Ok(Descriptor::Mongo {
                url: url.to_string(),
                database,
            });
        }
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_every_descriptor_kind() {
        assert_eq!(Descriptor::parse("memory://", None).unwrap(), Descriptor::Memory);
        assert_eq!(
            Descriptor::parse("file:///tmp/blitz", None).unwrap(),
            Descriptor::File(PathBuf::from("/tmp/blitz"))
        );
        assert_eq!(
            Descriptor::parse("sqlite::memory:", None).unwrap(),
            Descriptor::Sqlite("sqlite::memory:".into())
        );
        assert_eq!(
            Descriptor::parse("sqlite://data/db.sqlite", None).unwrap(),
            Descriptor::Sqlite("sqlite://data/db.sqlite".into())
        );
    }

    #[test]
    fn mongo_database_resolution() {
        let db = |url: &str, explicit: Option<&str>| match Descriptor::parse(url, explicit).unwrap() {
            Descriptor::Mongo { database, .. } => database,
            other => panic!("expected mongo, got {other:?}"),
        };
        assert_eq!(db("mongodb://localhost:27017", None), "blitzdb");
        assert_eq!(db("mongodb://localhost:27017/", None), "blitzdb");
        assert_eq!(db("mongodb://h1,h2/shop?replicaSet=rs0", None), "shop");
        assert_eq!(db("mongodb+srv://cluster.example.net/shop", Some("other")), "other");
    }

    #[test]
    fn rejects_unknown_or_empty_descriptors() {
        for bad in ["", "postgres://localhost/db", "file://", "sqlite://", "mongodb:///db"] {
            assert!(
                matches!(Descriptor::parse(bad, None), Err(AdaptError::InvalidDescriptor(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn options_follow_build_setting() {
        let mut cfg = StoreConfig::new("memory://");
        assert_eq!(cfg.options().index_build, IndexBuildMode::Immediate);
        cfg.index_build = BuildSetting::Incremental;
        cfg.build_batch = 7;
        assert_eq!(cfg.options().index_build, IndexBuildMode::Incremental { batch: 7 });
        assert_eq!(cfg.timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn loads_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blitzdb.toml");
        fs::write(
            &path,
            "url = \"sqlite::memory:\"\ntimeout_ms = 250\nindex_build = \"incremental\"\n",
        )
        .unwrap();
        let cfg = StoreConfig::load(Some(&path), None).unwrap();
        assert_eq!(cfg.url, "sqlite::memory:");
        assert_eq!(cfg.timeout_ms, 250);
        assert_eq!(cfg.index_build, BuildSetting::Incremental);
        assert_eq!(cfg.build_batch, DEFAULT_BUILD_BATCH);
        assert!(!cfg.strict_delete);

        let cfg = StoreConfig::load(Some(&path), Some("memory://")).unwrap();
        assert_eq!(cfg.url, "memory://");
    }
}
