// src/utils/path.rs
//! Drive path helpers.
//!
//! Drive paths are `/`-separated and rooted at the data bucket alias `root`.
//! Clients send the same location as `/root/a/b`, `root/a/b` or `a/b`;
//! [`neutralize`] maps all of them to one key (`root/a/b`) so comparisons and
//! lookups never depend on which spelling a caller used.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Alias of the data bucket directory at the top of every drive.
pub const ROOT_ALIAS: &str = "root";

/// Collapse a raw path: backslashes become `/`, empty and `.` segments are dropped.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical `root/...` form of a drive path.
///
/// `neutralize("/root/a/b") == neutralize("root/a/b") == neutralize("a/b")`.
pub fn neutralize(path: &str) -> String {
    let norm = normalize(path);
    if norm.is_empty() || norm == ROOT_ALIAS {
        return ROOT_ALIAS.to_string();
    }
    if norm.starts_with("root/") {
        norm
    } else {
        format!("{ROOT_ALIAS}/{norm}")
    }
}

/// Like [`neutralize`], but also treats a leading root hash as the root alias
/// (listings produced by hash-addressed gateways start with the root hash).
pub fn neutralize_with_root(path: &str, root_hash: &str) -> String {
    let norm = normalize(path);
    if !root_hash.is_empty() {
        if norm == root_hash {
            return ROOT_ALIAS.to_string();
        }
        if let Some(rest) = norm.strip_prefix(root_hash).and_then(|r| r.strip_prefix('/')) {
            return neutralize(rest);
        }
    }
    neutralize(&norm)
}

/// Parent of a neutralized path; `None` for the root itself.
pub fn parent(path: &str) -> Option<String> {
    let p = neutralize(path);
    p.rsplit_once('/').map(|(head, _)| head.to_string())
}

/// Final segment of a path.
pub fn file_name(path: &str) -> String {
    let p = neutralize(path);
    match p.rsplit_once('/') {
        Some((_, tail)) => tail.to_string(),
        None => p,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    neutralize(&format!("{}/{}", neutralize(parent), name))
}

/// True if `path` equals `prefix` or is nested beneath it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    let p = neutralize(path);
    let pre = neutralize(prefix);
    p == pre || p.starts_with(&format!("{pre}/"))
}

/// Move `path` from under `old_prefix` to under `new_prefix`, keeping its suffix.
/// Returns `None` when `path` is not within `old_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    let p = neutralize(path);
    let old = neutralize(old_prefix);
    let new = neutralize(new_prefix);
    if p == old {
        return Some(new);
    }
    p.strip_prefix(&format!("{old}/"))
        .map(|suffix| format!("{new}/{suffix}"))
}

/// Lowercased extension with its leading dot (`".png"`), if any.
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// Normalize a user-supplied extension key (`"PNG"`, `".png"` → `".png"`).
pub fn normalize_extension(ext: &str) -> String {
    let e = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    format!(".{e}")
}

/// Reject names that cannot be a single drive path segment.
pub fn validate_segment(name: &str) -> Result<()> {
    let n = name.trim();
    if n.is_empty() || n == "." || n == ".." {
        anyhow::bail!("invalid name: {name:?}");
    }
    if n.contains('/') || n.contains('\\') {
        anyhow::bail!("name must not contain separators: {name:?}");
    }
    Ok(())
}

/// Reject drive paths that try to climb out of the data bucket.
pub fn validate_drive_path(path: &str) -> Result<String> {
    let norm = normalize(path);
    if norm.split('/').any(|seg| seg == "..") {
        anyhow::bail!("parent segments are not allowed: {path:?}");
    }
    Ok(neutralize(&norm))
}

/// Ensure that a candidate absolute path resolves (or its parent resolves) to a
/// location contained within the canonicalized `root_abs`. Returns the
/// canonicalized path that was checked.
///
/// For creation paths that don't exist yet, this canonicalizes the parent and
/// rejoins the leaf to prevent symlink escapes.
pub fn assert_within_root_abs(root_abs: &Path, candidate_abs: &Path) -> Result<PathBuf> {
    let root = root_abs
        .canonicalize()
        .with_context(|| format!("canonicalize root {:?}", root_abs))?;

    let resolved = match candidate_abs.canonicalize() {
        Ok(c) => c,
        Err(_) => {
            let parent = candidate_abs
                .parent()
                .ok_or_else(|| anyhow::anyhow!("invalid path: no parent"))?;
            let leaf = candidate_abs
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("invalid path: no file name"))?;
            let canon_parent = parent
                .canonicalize()
                .with_context(|| format!("canonicalize parent {:?}", parent))?;
            canon_parent.join(leaf)
        }
    };

    if !resolved.starts_with(&root) {
        anyhow::bail!("path escapes root: path={:?} root={:?}", candidate_abs, root);
    }
    Ok(resolved)
}

/// Filesystem-safe form of an identifier (used for per-document directories).
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
