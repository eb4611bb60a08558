//! Snapshot feed contracts + file-backed feeds handing product snapshots to ingestion.

pub mod catalog;

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pricewatch_core::ProductSnapshot;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub use catalog::{
    category_targets, flatten_categories, format_category_name, CatalogCategory, CatalogPayload,
    CategoryTarget,
};

pub const CRATE_NAME: &str = "pricewatch-feed";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of one cycle's worth of product snapshots.
///
/// The crawl layer sits behind this seam; ingestion only sees finished snapshots.
#[async_trait]
pub trait SnapshotFeed: Send + Sync {
    fn feed_id(&self) -> &str;

    async fn load(&self) -> Result<Vec<ProductSnapshot>, FeedError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Many(Vec<ProductSnapshot>),
    One(Box<ProductSnapshot>),
}

/// Reads a snapshot file holding either one product object or an array of them.
pub fn load_snapshot_file(path: impl AsRef<Path>) -> Result<Vec<ProductSnapshot>, FeedError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| FeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: SnapshotFile = serde_json::from_str(&data).map_err(|source| FeedError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match parsed {
        SnapshotFile::Many(items) => items,
        SnapshotFile::One(item) => vec![*item],
    })
}

/// Every `*.json` file of a directory, in file-name order.
#[derive(Debug, Clone)]
pub struct JsonDirFeed {
    dir: PathBuf,
}

impl JsonDirFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_paths(&self) -> Result<Vec<PathBuf>, FeedError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| FeedError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut paths = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl SnapshotFeed for JsonDirFeed {
    fn feed_id(&self) -> &str {
        "json-dir"
    }

    async fn load(&self) -> Result<Vec<ProductSnapshot>, FeedError> {
        let mut out = Vec::new();
        for path in self.snapshot_paths()? {
            let snapshots = load_snapshot_file(&path)?;
            debug!(path = %path.display(), count = snapshots.len(), "loaded snapshot file");
            out.extend(snapshots);
        }
        Ok(out)
    }
}

/// Feed over snapshots already in memory (replays, tests, piped input).
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    snapshots: Vec<ProductSnapshot>,
}

impl StaticFeed {
    pub fn new(snapshots: Vec<ProductSnapshot>) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl SnapshotFeed for StaticFeed {
    fn feed_id(&self) -> &str {
        "static"
    }

    async fn load(&self) -> Result<Vec<ProductSnapshot>, FeedError> {
        Ok(self.snapshots.clone())
    }
}
