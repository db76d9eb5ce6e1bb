// src/drive/reconciler.rs
//! Annotated drive listing.
//!
//! Walks the content tree (local and external subtrees alike) and decorates each
//! entry with what the reference index knows about it: publish status, a
//! best-effort timestamp, the inherited component type and an access status.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::drive::content::{ContentStore, ExternalMap, TreeEntry};
use crate::drive::path_index::TypeResolver;
use crate::manifest::model::ComponentKind;
use crate::services::references::ReferenceRow;
use crate::utils::path as pathutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatus {
    Public,
    Private,
    /// A directory with some, but not all, content published.
    Partial,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveObject {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub directory: bool,
    pub external: bool,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub published: bool,
    pub access: AccessStatus,
    pub last_modified: Option<DateTime<Utc>>,
    pub children: Vec<DriveObject>,
}

/// Everything one reconcile call reads; nothing is fetched behind the caller's back.
pub struct ReconcileInput<'a> {
    pub root_hash: &'a str,
    pub externals: &'a ExternalMap,
    /// Draft rows of the node.
    pub private_rows: &'a [ReferenceRow],
    /// Public rows of every published version of the node.
    pub public_rows: &'a [ReferenceRow],
    pub types: &'a TypeResolver,
    /// Anchor block time per published version id.
    pub anchor_times: &'a HashMap<i64, DateTime<Utc>>,
}

pub struct DriveReconciler {
    content: Arc<dyn ContentStore>,
}

struct RowLookup<'a> {
    public_by_hash: HashMap<&'a str, &'a ReferenceRow>,
    private_by_path: HashMap<String, &'a ReferenceRow>,
    private_by_hash: HashMap<&'a str, &'a ReferenceRow>,
    anchor_times: &'a HashMap<i64, DateTime<Utc>>,
    types: &'a TypeResolver,
}

impl DriveReconciler {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }

    pub fn reconcile(&self, input: &ReconcileInput<'_>) -> Result<DriveObject> {
        let tree = self
            .content
            .get_directory_tree(input.root_hash, input.externals)?;

        let mut public_by_hash: HashMap<&str, &ReferenceRow> = HashMap::new();
        for row in input.public_rows {
            // earliest publication wins the timestamp
            public_by_hash
                .entry(row.hash.as_str())
                .and_modify(|cur| {
                    if row.created_at < cur.created_at {
                        *cur = row;
                    }
                })
                .or_insert(row);
        }
        let lookup = RowLookup {
            public_by_hash,
            private_by_path: input
                .private_rows
                .iter()
                .map(|r| (pathutil::neutralize(&r.path), r))
                .collect(),
            private_by_hash: input.private_rows.iter().map(|r| (r.hash.as_str(), r)).collect(),
            anchor_times: input.anchor_times,
            types: input.types,
        };

        let annotated = annotate(&tree, &lookup);
        tracing::debug!(
            root = %input.root_hash,
            size = annotated.size,
            published = annotated.published,
            "drive reconciled"
        );
        Ok(annotated)
    }
}

fn annotate(entry: &TreeEntry, lookup: &RowLookup<'_>) -> DriveObject {
    let path = pathutil::neutralize(&entry.path);
    let children: Vec<DriveObject> = entry.children.iter().map(|c| annotate(c, lookup)).collect();

    let public_row = lookup.public_by_hash.get(entry.hash.as_str()).copied();
    let published = public_row.is_some();
    let last_modified = match public_row {
        Some(row) => Some(
            lookup
                .anchor_times
                .get(&row.version_id)
                .copied()
                .unwrap_or(row.created_at),
        ),
        None => lookup
            .private_by_path
            .get(&path)
            .copied()
            .or_else(|| lookup.private_by_hash.get(entry.hash.as_str()).copied())
            .map(|row| row.updated_at),
    };

    let access = if entry.external {
        AccessStatus::External
    } else if published {
        AccessStatus::Public
    } else if children
        .iter()
        .any(|c| matches!(c.access, AccessStatus::Public | AccessStatus::Partial))
    {
        AccessStatus::Partial
    } else {
        AccessStatus::Private
    };

    DriveObject {
        name: entry.name.clone(),
        kind: lookup.types.resolve(&path),
        path,
        hash: entry.hash.clone(),
        size: entry.size,
        directory: entry.is_directory(),
        external: entry.external,
        published,
        access,
        last_modified,
        children,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Present in both with a different hash.
    pub modified: Vec<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compare two annotated trees by neutralized path.
pub fn diff(before: &DriveObject, after: &DriveObject) -> TreeDiff {
    let a = hashes_by_path(before);
    let b = hashes_by_path(after);
    let mut out = TreeDiff::default();
    for (path, hash) in &a {
        match b.get(path) {
            None => out.removed.push(path.clone()),
            Some(other) if other != hash => out.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    out.added = b.keys().filter(|p| !a.contains_key(*p)).cloned().collect();
    out
}

fn hashes_by_path(root: &DriveObject) -> BTreeMap<String, String> {
    fn walk(o: &DriveObject, out: &mut BTreeMap<String, String>) {
        out.insert(pathutil::neutralize(&o.path), o.hash.clone());
        for c in &o.children {
            walk(c, out);
        }
    }
    let mut out = BTreeMap::new();
    walk(root, &mut out);
    out
}
