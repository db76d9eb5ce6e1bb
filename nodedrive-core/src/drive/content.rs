// src/drive/content.rs
//! Content-addressed drive storage.
//!
//! - Files are blobs addressed by `blake3(bytes)`.
//! - Directories are sorted link lists (`name`, `hash`, `size`, `kind`), stored
//!   as JSON and addressed by the hash of that encoding.
//! - Objects are immutable. Every edit (rename, move, add, remove) writes new
//!   directory objects from the edited directory up to the root and reports
//!   which directory hashes were replaced along the way.
//!
//! [`ContentStore`] only requires the four object primitives; tree listing and
//! link surgery are provided on top of them.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::path::{self as pathutil, ROOT_ALIAS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One named child of a directory object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub hash: String,
    /// Byte size of a file, cumulative size of a directory.
    pub size: u64,
    pub kind: EntryKind,
}

/// Recursive listing produced by [`ContentStore::get_directory_tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub kind: EntryKind,
    /// Owned by another node and only referenced here.
    pub external: bool,
    pub children: Vec<TreeEntry>,
}

impl TreeEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Metadata for a hash this drive references but another node owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEntry {
    pub size: u64,
    pub directory: bool,
    /// Where the stand-in sits; `None` matches the hash at any path.
    #[serde(default)]
    pub path: Option<String>,
}

/// Externally owned hash → stand-in metadata.
pub type ExternalMap = HashMap<String, ExternalEntry>;

/// Result of a DAG edit: the new root and every directory hash it replaced
/// (old → new), root included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkUpdate {
    pub new_root: String,
    pub changed: BTreeMap<String, String>,
}

pub trait ContentStore: Send + Sync {
    fn put_blob(&self, bytes: &[u8]) -> Result<String>;

    fn get_blob(&self, hash: &str) -> Result<Vec<u8>>;

    fn put_directory(&self, links: &[Link]) -> Result<String>;

    /// `Ok(None)` when `hash` is not a directory known to this store.
    fn get_directory(&self, hash: &str) -> Result<Option<Vec<Link>>>;

    fn empty_directory(&self) -> Result<String> {
        self.put_directory(&[])
    }

    /// Depth-first listing of the drive rooted at `root_hash`.
    ///
    /// Hashes present in `externals` are marked external. An external
    /// directory this store can read is walked; otherwise the map's metadata
    /// stands in for it.
    fn get_directory_tree(&self, root_hash: &str, externals: &ExternalMap) -> Result<TreeEntry> {
        let links = self
            .get_directory(root_hash)?
            .ok_or_else(|| anyhow!("root directory not found: {root_hash}"))?;
        walk_dir(self, ROOT_ALIAS, ROOT_ALIAS, root_hash, links, externals, false)
    }

    /// Rename `old_name` to `new_name` inside the directory at `parent_path`.
    fn rename_link(
        &self,
        root_hash: &str,
        parent_path: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<LinkUpdate> {
        pathutil::validate_segment(new_name)?;
        rewrite_dir(self, root_hash, parent_path, false, |links| {
            if links.iter().any(|l| l.name == new_name) {
                anyhow::bail!("link already exists: {new_name}");
            }
            let link = links
                .iter_mut()
                .find(|l| l.name == old_name)
                .ok_or_else(|| anyhow!("link not found: {old_name}"))?;
            link.name = new_name.to_string();
            Ok(())
        })
    }

    /// Detach the entry at `path`; returns its link and the rewritten root.
    fn remove_link(&self, root_hash: &str, path: &str) -> Result<(Link, LinkUpdate)> {
        let parent = pathutil::parent(path).ok_or_else(|| anyhow!("cannot remove the root"))?;
        let name = pathutil::file_name(path);
        let mut removed = None;
        let update = rewrite_dir(self, root_hash, &parent, false, |links| {
            let pos = links
                .iter()
                .position(|l| l.name == name)
                .ok_or_else(|| anyhow!("link not found: {name}"))?;
            removed = Some(links.remove(pos));
            Ok(())
        })?;
        let link = removed.ok_or_else(|| anyhow!("link not found: {path}"))?;
        Ok((link, update))
    }

    /// Attach `link` inside `parent_path`, creating missing directories.
    fn insert_link(&self, root_hash: &str, parent_path: &str, link: Link) -> Result<LinkUpdate> {
        pathutil::validate_segment(&link.name)?;
        rewrite_dir(self, root_hash, parent_path, true, |links| {
            if links.iter().any(|l| l.name == link.name) {
                anyhow::bail!("link already exists: {}", link.name);
            }
            links.push(link);
            Ok(())
        })
    }

    /// Move the entry at `from_path` to `to_path`.
    fn move_link(&self, root_hash: &str, from_path: &str, to_path: &str) -> Result<LinkUpdate> {
        if pathutil::is_within(to_path, from_path) {
            anyhow::bail!("cannot move {from_path} beneath itself");
        }
        let parent = pathutil::parent(to_path).ok_or_else(|| anyhow!("cannot move onto the root"))?;
        let (mut link, first) = self.remove_link(root_hash, from_path)?;
        link.name = pathutil::file_name(to_path);
        let second = self.insert_link(&first.new_root, &parent, link)?;
        Ok(LinkUpdate {
            new_root: second.new_root,
            changed: compose_changes(first.changed, second.changed),
        })
    }

    /// Write `bytes` at `path` (replacing any file of that name).
    fn put_file(&self, root_hash: &str, path: &str, bytes: &[u8]) -> Result<LinkUpdate> {
        let path = pathutil::validate_drive_path(path)?;
        let parent = pathutil::parent(&path).ok_or_else(|| anyhow!("cannot write onto the root"))?;
        let link = Link {
            name: pathutil::file_name(&path),
            hash: self.put_blob(bytes)?,
            size: bytes.len() as u64,
            kind: EntryKind::File,
        };
        rewrite_dir(self, root_hash, &parent, true, |links| {
            if let Some(existing) = links.iter_mut().find(|l| l.name == link.name) {
                if existing.kind == EntryKind::Directory {
                    anyhow::bail!("a directory named {} already exists", link.name);
                }
                *existing = link;
            } else {
                links.push(link);
            }
            Ok(())
        })
    }

    /// Build a fresh drive from `(path, bytes)` pairs; returns its root hash.
    fn put_tree(&self, files: &[(&str, &[u8])]) -> Result<String> {
        let mut root = self.empty_directory()?;
        for (path, bytes) in files {
            root = self.put_file(&root, path, bytes)?.new_root;
        }
        Ok(root)
    }
}

fn walk_dir<S: ContentStore + ?Sized>(
    store: &S,
    name: &str,
    path: &str,
    hash: &str,
    links: Vec<Link>,
    externals: &ExternalMap,
    external: bool,
) -> Result<TreeEntry> {
    let mut children = Vec::with_capacity(links.len());
    let mut size = 0u64;
    for link in links {
        let child_path = format!("{path}/{}", link.name);
        let stand_in = externals.get(&link.hash).filter(|e| {
            e.path
                .as_deref()
                .is_none_or(|p| pathutil::neutralize(p) == pathutil::neutralize(&child_path))
        });
        let child = if let Some(stand_in) = stand_in {
            let listing = if stand_in.directory {
                store.get_directory(&link.hash)?
            } else {
                None
            };
            match listing {
                Some(sub) => {
                    walk_dir(store, &link.name, &child_path, &link.hash, sub, externals, true)?
                }
                None => TreeEntry {
                    name: link.name.clone(),
                    path: child_path,
                    hash: link.hash.clone(),
                    size: if stand_in.size > 0 { stand_in.size } else { link.size },
                    kind: if stand_in.directory {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    external: true,
                    children: Vec::new(),
                },
            }
        } else {
            match link.kind {
                EntryKind::Directory => {
                    let sub = store
                        .get_directory(&link.hash)?
                        .ok_or_else(|| anyhow!("directory object missing: {} ({})", child_path, link.hash))?;
                    walk_dir(store, &link.name, &child_path, &link.hash, sub, externals, external)?
                }
                EntryKind::File => TreeEntry {
                    name: link.name.clone(),
                    path: child_path,
                    hash: link.hash.clone(),
                    size: link.size,
                    kind: EntryKind::File,
                    external,
                    children: Vec::new(),
                },
            }
        };
        size += child.size;
        children.push(child);
    }
    Ok(TreeEntry {
        name: name.to_string(),
        path: path.to_string(),
        hash: hash.to_string(),
        size,
        kind: EntryKind::Directory,
        external,
        children,
    })
}

/// Edit the directory at `dir_path` and rehash every directory up to the root.
fn rewrite_dir<S, F>(
    store: &S,
    root_hash: &str,
    dir_path: &str,
    create_missing: bool,
    edit: F,
) -> Result<LinkUpdate>
where
    S: ContentStore + ?Sized,
    F: FnOnce(&mut Vec<Link>) -> Result<()>,
{
    let target = pathutil::validate_drive_path(dir_path)?;
    let root_links = store
        .get_directory(root_hash)?
        .ok_or_else(|| anyhow!("root directory not found: {root_hash}"))?;

    // (name in parent, hash before the edit, links)
    let mut chain: Vec<(String, Option<String>, Vec<Link>)> =
        vec![(ROOT_ALIAS.to_string(), Some(root_hash.to_string()), root_links)];
    for seg in target.split('/').skip(1) {
        let parent_links = &chain[chain.len() - 1].2;
        let next = match parent_links.iter().find(|l| l.name == seg) {
            Some(l) if l.kind == EntryKind::Directory => {
                let sub = store
                    .get_directory(&l.hash)?
                    .with_context(|| format!("directory object missing: {} ({})", seg, l.hash))?;
                (seg.to_string(), Some(l.hash.clone()), sub)
            }
            Some(_) => anyhow::bail!("not a directory: {seg} in {target}"),
            None if create_missing => (seg.to_string(), None, Vec::new()),
            None => anyhow::bail!("directory not found: {target}"),
        };
        chain.push(next);
    }

    let last = chain.len() - 1;
    edit(&mut chain[last].2)?;

    let mut changed = BTreeMap::new();
    let mut child: Option<Link> = None;
    for (name, old_hash, mut links) in chain.into_iter().rev() {
        if let Some(c) = child.take() {
            match links.iter_mut().find(|l| l.name == c.name) {
                Some(slot) => *slot = c,
                None => links.push(c),
            }
        }
        let new_hash = store.put_directory(&links)?;
        if let Some(old) = old_hash {
            if old != new_hash {
                changed.insert(old, new_hash.clone());
            }
        }
        child = Some(Link {
            name,
            hash: new_hash,
            size: links.iter().map(|l| l.size).sum(),
            kind: EntryKind::Directory,
        });
    }
    let new_root = child
        .map(|l| l.hash)
        .ok_or_else(|| anyhow!("empty rewrite chain"))?;
    Ok(LinkUpdate { new_root, changed })
}

/// Chain two old→new maps produced by consecutive edits.
fn compose_changes(
    first: BTreeMap<String, String>,
    second: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let intermediate: HashSet<String> = first.values().cloned().collect();
    let mut out = BTreeMap::new();
    for (old, mid) in first {
        let new = second.get(&mid).cloned().unwrap_or(mid);
        out.insert(old, new);
    }
    for (old, new) in second {
        if !intermediate.contains(&old) {
            out.entry(old).or_insert(new);
        }
    }
    out
}

// ---------- filesystem store ----------

#[derive(Serialize, Deserialize)]
struct DirNode {
    links: Vec<Link>,
}

/// Filesystem-backed content store (no DB).
#[derive(Debug, Clone)]
pub struct DagStore {
    /// Directory holding `blobs/<hash>` and `dirs/<hash>.json`.
    root: PathBuf,
}

impl DagStore {
    // Conservative per-object size cap to avoid disk exhaustion from a single write.
    const MAX_OBJECT_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("dirs"))?;
        Ok(Self { root })
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        check_hash(hash)?;
        Ok(self.root.join("blobs").join(hash))
    }

    fn dir_path(&self, hash: &str) -> Result<PathBuf> {
        check_hash(hash)?;
        Ok(self.root.join("dirs").join(format!("{hash}.json")))
    }
}

impl ContentStore for DagStore {
    fn put_blob(&self, bytes: &[u8]) -> Result<String> {
        if bytes.len() > Self::MAX_OBJECT_BYTES {
            anyhow::bail!(
                "object too large: {} bytes (max {})",
                bytes.len(),
                Self::MAX_OBJECT_BYTES
            );
        }
        let hash = blake3::hash(bytes).to_hex().to_string();
        let path = self.blob_path(&hash)?;
        // Write object once (idempotent)
        if !path.exists() {
            write_atomic(&path, bytes)?;
            tracing::trace!(hash = %hash, bytes = bytes.len(), "blob written");
        }
        Ok(hash)
    }

    fn get_blob(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash)?;
        let meta = fs::metadata(&path).with_context(|| format!("blob not found: {hash}"))?;
        if meta.len() > Self::MAX_OBJECT_BYTES as u64 {
            anyhow::bail!(
                "object too large to read safely: {} bytes (max {})",
                meta.len(),
                Self::MAX_OBJECT_BYTES
            );
        }
        fs::read(&path).with_context(|| format!("read {:?}", path))
    }

    fn put_directory(&self, links: &[Link]) -> Result<String> {
        let mut links = links.to_vec();
        links.sort_by(|a, b| a.name.cmp(&b.name));
        let encoded = serde_json::to_vec(&DirNode { links })?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"dir\n");
        hasher.update(&encoded);
        let hash = hasher.finalize().to_hex().to_string();
        let path = self.dir_path(&hash)?;
        if !path.exists() {
            write_atomic(&path, &encoded)?;
        }
        Ok(hash)
    }

    fn get_directory(&self, hash: &str) -> Result<Option<Vec<Link>>> {
        let path = self.dir_path(hash)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("read {:?}", path))?;
        let node: DirNode =
            serde_json::from_slice(&bytes).with_context(|| format!("parse directory {hash}"))?;
        Ok(Some(node.links))
    }
}

fn check_hash(hash: &str) -> Result<()> {
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("malformed content hash: {hash:?}");
    }
    Ok(())
}

/// Atomically write bytes to a file.
/// Uses a `.tmp` file then renames for crash-safety.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
