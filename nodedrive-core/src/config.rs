use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing;

use crate::manifest::model::ComponentKind;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub heal: HealConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.store.db_path = absolutize(root, &self.store.db_path);
        self.store.content_path = absolutize(root, &self.store.content_path);
        self.store.documents_path = absolutize(root, &self.store.documents_path);
        self.store.logbook_path = absolutize(root, &self.store.logbook_path);
        self.store.indexer_path = absolutize(root, &self.store.indexer_path);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "nodedrive".to_string()
    }

    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "StoreConfig::default_content_path")]
    pub content_path: PathBuf,
    #[serde(default = "StoreConfig::default_documents_path")]
    pub documents_path: PathBuf,
    #[serde(default = "StoreConfig::default_logbook_path")]
    pub logbook_path: PathBuf,
    /// Published version history (JSON), loaded at open and rewritten on publish.
    #[serde(default = "StoreConfig::default_indexer_path")]
    pub indexer_path: PathBuf,
}

impl StoreConfig {
    fn default_db_path() -> PathBuf {
        PathBuf::from("cache/references.db")
    }

    fn default_content_path() -> PathBuf {
        PathBuf::from("objects")
    }

    fn default_documents_path() -> PathBuf {
        PathBuf::from("documents")
    }

    fn default_logbook_path() -> PathBuf {
        PathBuf::from("logbook")
    }

    fn default_indexer_path() -> PathBuf {
        PathBuf::from("cache/published.json")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_db_path(),
            content_path: Self::default_content_path(),
            documents_path: Self::default_documents_path(),
            logbook_path: Self::default_logbook_path(),
            indexer_path: Self::default_indexer_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveConfig {
    /// Classification for paths no manifest component (or ancestor) types.
    #[serde(default = "DriveConfig::default_type")]
    pub default_type: ComponentKind,
}

impl DriveConfig {
    fn default_type() -> ComponentKind {
        ComponentKind::Unknown
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            default_type: Self::default_type(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealConfig {
    #[serde(default)]
    pub mark_externals: bool,
    #[serde(default = "HealConfig::default_prune_duration_days")]
    pub prune_duration_days: u32,
    /// Inclusive start index for `heal-all` sweeps (over nodes ordered by id).
    #[serde(default)]
    pub batch_start: Option<usize>,
    /// Exclusive end index for `heal-all` sweeps.
    #[serde(default)]
    pub batch_end: Option<usize>,
}

impl HealConfig {
    fn default_prune_duration_days() -> u32 {
        30
    }
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            mark_externals: false,
            prune_duration_days: Self::default_prune_duration_days(),
            batch_start: None,
            batch_end: None,
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
