// nodedrive-core/src/commands/init.rs

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

// ---------- single global init gate ----------

static INIT: OnceCell<InitReport> = OnceCell::new();

/// Idempotent global initializer for the root named by `NODEDRIVE_ROOT`.
pub fn ensure_initialized_once() -> Result<&'static InitReport> {
    INIT.get_or_try_init(ensure_initialized)
}

/// Resolve the workspace root. Override via NODEDRIVE_ROOT (tests, tooling).
pub fn nodedrive_root() -> PathBuf {
    std::env::var_os("NODEDRIVE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".nodedrive"))
}

pub fn ensure_initialized() -> Result<InitReport> {
    ensure_initialized_at(&nodedrive_root())
}

/// Create the directory skeleton, default config and logbook under `root`.
/// Existing files are left untouched.
pub fn ensure_initialized_at(root: &Path) -> Result<InitReport> {
    let root = root.to_path_buf();
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(&root, "", &mut created, &mut existed)?;
    ensure_dir(&root, "objects", &mut created, &mut existed)?;
    ensure_dir(&root, "documents", &mut created, &mut existed)?;
    ensure_dir(&root, "cache", &mut created, &mut existed)?;
    ensure_dir(&root, "logbook", &mut created, &mut existed)?;

    ensure_file(
        &root,
        "config.toml",
        Some(DEFAULT_CONFIG_TOML),
        &mut created,
        &mut existed,
    )?;

    initialize_logbook_files(&root, &mut created, &mut existed)?;

    tracing::debug!(root = %root.display(), created = created.len(), "workspace initialized");
    Ok(InitReport { root, created, existed })
}

fn ensure_dir(
    base: &Path,
    rel: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let label = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(label);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: Option<&str>,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    write_atomic(&p, content_if_absent.unwrap_or("").as_bytes())?;
    created.push(rel_file.to_string());
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all({:?})", parent))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .with_context(|| format!("open temp file {:?}", tmp))?;
        f.write_all(bytes)?;
        f.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

fn initialize_logbook_files(
    root: &Path,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let init_event = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "event": "system_init",
        "agent": "system",
        "data": { "version": env!("CARGO_PKG_VERSION") }
    })
    .to_string()
        + "\n";

    ensure_file(root, "logbook.jsonl", Some(&init_event), created, existed)?;
    ensure_file(&root.join("logbook"), "actions.jsonl", Some(&init_event), created, existed)?;
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[system]
name = "nodedrive"
version = "0.1.0"

[store]
db_path = "cache/references.db"
content_path = "objects"
documents_path = "documents"
logbook_path = "logbook"
indexer_path = "cache/published.json"

[drive]
default_type = "unknown"

[heal]
mark_externals = false
prune_duration_days = 30
"#;
