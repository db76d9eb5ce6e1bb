// src/manifest/document.rs
//! Replicated document container for manifests.
//!
//! The dispatcher only needs `find → handle`, `handle.doc()` and
//! `handle.change(mutator, meta)`. [`FsDocumentStore`] provides them on disk:
//! - One folder per document: `<root>/<document_id>/`
//! - `head.json` holds the current snapshot, replaced atomically on every change.
//! - `changes.jsonl` is the append-only change history (time, actor, message, hash).
//! - Writers on one document are serialized by a per-document mutex, so two
//!   dispatchers touching disjoint fields both survive; same-field edits resolve
//!   last-writer-wins.
//! - A change whose result hashes identical to the head writes nothing.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::manifest::model::ManifestDocument;
use crate::utils::path as pathutil;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn generate() -> Self {
        DocumentId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

/// Attribution attached to every committed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMeta {
    pub time: DateTime<Utc>,
    pub message: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub time: DateTime<Utc>,
    pub message: String,
    pub actor: String,
    pub snapshot_hash: String,
}

pub trait DocumentHandle: Send + Sync {
    fn id(&self) -> &DocumentId;

    /// False while the document cannot be read or written (not yet synced,
    /// missing head, ...). Callers treat this as retryable.
    fn is_ready(&self) -> bool;

    /// Current snapshot, or `None` when not ready.
    fn doc(&self) -> Result<Option<ManifestDocument>>;

    /// Apply `mutator` to the latest snapshot and commit the result as one change.
    fn change(
        &self,
        mutator: &mut dyn FnMut(&mut ManifestDocument),
        meta: ChangeMeta,
    ) -> Result<ManifestDocument>;

    fn history(&self) -> Result<Vec<ChangeRecord>>;
}

pub trait DocumentStore: Send + Sync {
    fn create(&self, initial: &ManifestDocument, meta: ChangeMeta) -> Result<DocumentId>;

    /// `Ok(None)` when no such document is known to this store.
    fn find(&self, id: &DocumentId) -> Result<Option<Arc<dyn DocumentHandle>>>;
}

// ---------- filesystem store ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeadFile {
    seq: u64,
    snapshot_hash: String,
    updated_at: DateTime<Utc>,
    document: ManifestDocument,
}

pub struct FsDocumentStore {
    root: PathBuf,
    handles: Mutex<HashMap<DocumentId, Arc<FsDocumentHandle>>>,
}

impl FsDocumentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create_dir_all({:?})", root))?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn doc_dir(&self, id: &DocumentId) -> PathBuf {
        self.root.join(pathutil::sanitize(id.as_str()))
    }

    fn handle_for(&self, id: &DocumentId) -> Result<Arc<FsDocumentHandle>> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| anyhow!("document handle cache poisoned"))?;
        let h = handles.entry(id.clone()).or_insert_with(|| {
            Arc::new(FsDocumentHandle {
                id: id.clone(),
                root: self.root.clone(),
                dir: self.doc_dir(id),
                lock: Mutex::new(()),
            })
        });
        Ok(h.clone())
    }
}

impl DocumentStore for FsDocumentStore {
    fn create(&self, initial: &ManifestDocument, meta: ChangeMeta) -> Result<DocumentId> {
        let id = DocumentId::generate();
        let handle = self.handle_for(&id)?;
        let _guard = handle.lock()?;
        fs::create_dir_all(&handle.dir)
            .with_context(|| format!("create_dir_all({:?})", handle.dir))?;
        handle.commit(0, initial, &meta)?;
        tracing::debug!(document = %id, "document created");
        Ok(id)
    }

    fn find(&self, id: &DocumentId) -> Result<Option<Arc<dyn DocumentHandle>>> {
        if !self.doc_dir(id).is_dir() {
            return Ok(None);
        }
        let handle: Arc<dyn DocumentHandle> = self.handle_for(id)?;
        Ok(Some(handle))
    }
}

pub struct FsDocumentHandle {
    id: DocumentId,
    root: PathBuf,
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FsDocumentHandle {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("document {} lock poisoned", self.id))
    }

    fn head_path(&self) -> PathBuf {
        self.dir.join("head.json")
    }

    fn changes_path(&self) -> PathBuf {
        self.dir.join("changes.jsonl")
    }

    fn read_head(&self) -> Result<Option<HeadFile>> {
        let p = self.head_path();
        if !p.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&p).with_context(|| format!("read {:?}", p))?;
        let head: HeadFile =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {:?}", p))?;
        Ok(Some(head))
    }

    fn commit(&self, seq: u64, doc: &ManifestDocument, meta: &ChangeMeta) -> Result<HeadFile> {
        let head = HeadFile {
            seq,
            snapshot_hash: doc.snapshot_hash()?,
            updated_at: meta.time,
            document: doc.clone(),
        };
        let record = ChangeRecord {
            seq,
            time: meta.time,
            message: meta.message.clone(),
            actor: meta.actor.clone(),
            snapshot_hash: head.snapshot_hash.clone(),
        };
        let head_path = self.head_path();
        pathutil::assert_within_root_abs(&self.root, &head_path)?;
        write_atomic(&head_path, &serde_json::to_vec_pretty(&head)?)?;
        append_line(&self.changes_path(), &serde_json::to_vec(&record)?)?;
        Ok(head)
    }
}

impl DocumentHandle for FsDocumentHandle {
    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn is_ready(&self) -> bool {
        self.head_path().is_file()
    }

    fn doc(&self) -> Result<Option<ManifestDocument>> {
        let _guard = self.lock()?;
        Ok(self.read_head()?.map(|h| h.document))
    }

    fn change(
        &self,
        mutator: &mut dyn FnMut(&mut ManifestDocument),
        meta: ChangeMeta,
    ) -> Result<ManifestDocument> {
        let _guard = self.lock()?;
        let head = self
            .read_head()?
            .ok_or_else(|| anyhow!("document {} has no head", self.id))?;
        let mut doc = head.document.clone();
        mutator(&mut doc);
        if doc.snapshot_hash()? == head.snapshot_hash {
            // idempotent: nothing to write
            return Ok(doc);
        }
        let head = self.commit(head.seq + 1, &doc, &meta)?;
        Ok(head.document)
    }

    fn history(&self) -> Result<Vec<ChangeRecord>> {
        let _guard = self.lock()?;
        let p = self.changes_path();
        if !p.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&p).with_context(|| format!("read {:?}", p))?;
        let mut out = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            out.push(serde_json::from_str::<ChangeRecord>(line)?);
        }
        Ok(out)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all({:?})", parent))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("open temp file {:?}", tmp))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

fn append_line(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {:?}", path))?;
    f.write_all(bytes)?;
    f.write_all(b"\n")?;
    Ok(())
}
