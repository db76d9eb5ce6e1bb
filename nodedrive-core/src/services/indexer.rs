// src/services/indexer.rs
//! Published version history of nodes, as reported by an external indexer.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedVersion {
    /// Manifest hash the version was anchored with.
    pub manifest_hash: String,
    pub anchor_id: String,
    /// Block time of the anchor, when known.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

pub trait Indexer: Send + Sync {
    /// Published versions of `node_uuid`, oldest first.
    fn history(&self, node_uuid: &str) -> Result<Vec<PublishedVersion>>;

    /// Anchor time of the version whose manifest hash is `manifest_hash`.
    fn anchor_time(&self, node_uuid: &str, manifest_hash: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .history(node_uuid)?
            .into_iter()
            .find(|v| v.manifest_hash == manifest_hash)
            .and_then(|v| v.time))
    }
}

/// Locally recorded indexer, optionally backed by a JSON file of
/// `{ "<node uuid>": [PublishedVersion, ...] }` that every `record` rewrites.
#[derive(Debug, Default)]
pub struct StaticIndexer {
    versions: RwLock<HashMap<String, Vec<PublishedVersion>>>,
    path: Option<PathBuf>,
}

impl StaticIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` if it exists; later records are written back to it.
    pub fn open(path: &Path) -> Result<Self> {
        let versions = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading indexer file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing indexer file {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            versions: RwLock::new(versions),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn record(&self, node_uuid: &str, version: PublishedVersion) -> Result<()> {
        let mut map = self
            .versions
            .write()
            .map_err(|_| anyhow!("indexer lock poisoned"))?;
        let list = map.entry(node_uuid.to_string()).or_default();
        if list.iter().any(|v| v.manifest_hash == version.manifest_hash) {
            return Ok(());
        }
        list.push(version);
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&*map)?)
                .with_context(|| format!("writing indexer file {}", tmp.display()))?;
            fs::rename(&tmp, path)
                .with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
        }
        Ok(())
    }
}

impl Indexer for StaticIndexer {
    fn history(&self, node_uuid: &str) -> Result<Vec<PublishedVersion>> {
        let map = self
            .versions
            .read()
            .map_err(|_| anyhow!("indexer lock poisoned"))?;
        Ok(map.get(node_uuid).cloned().unwrap_or_default())
    }
}
