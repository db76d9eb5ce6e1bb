// src/drive/path_index.rs
//! Flat views of a drive tree and type inheritance.
//!
//! `flatten` turns the recursive listing into `neutral path → entry`;
//! `TypeResolver` classifies any path by its nearest typed ancestor.

use std::collections::BTreeMap;

use crate::drive::content::{ExternalEntry, ExternalMap, TreeEntry};
use crate::manifest::model::{ComponentKind, ComponentType, ManifestDocument};
use crate::utils::path::{self as pathutil, ROOT_ALIAS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub path: String,
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub directory: bool,
    pub external: bool,
    /// The data bucket itself.
    pub root: bool,
}

/// Every entry of `tree` (root included) keyed by neutralized path.
pub fn flatten(tree: &TreeEntry) -> BTreeMap<String, FlatEntry> {
    let mut out = BTreeMap::new();
    visit(tree, &mut out);
    out
}

fn visit(entry: &TreeEntry, out: &mut BTreeMap<String, FlatEntry>) {
    let path = pathutil::neutralize(&entry.path);
    out.insert(
        path.clone(),
        FlatEntry {
            root: path == ROOT_ALIAS,
            path,
            name: entry.name.clone(),
            hash: entry.hash.clone(),
            size: entry.size,
            directory: entry.is_directory(),
            external: entry.external,
        },
    );
    for child in &entry.children {
        visit(child, out);
    }
}

/// Resolves the component kind of a drive path.
///
/// The nearest ancestor (or the path itself) with a declared type decides:
/// - a single kind applies to the whole subtree;
/// - an extension mapping classifies by the path's extension, and a miss
///   falls back to the default kind.
///
/// The root data bucket's own kind applies to the root only.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    types: BTreeMap<String, ComponentType>,
    fallback: ComponentKind,
}

impl TypeResolver {
    pub fn new(types: BTreeMap<String, ComponentType>, fallback: ComponentKind) -> Self {
        let types = types
            .into_iter()
            .map(|(p, t)| (pathutil::neutralize(&p), t))
            .collect();
        Self { types, fallback }
    }

    pub fn from_manifest(doc: &ManifestDocument, fallback: ComponentKind) -> Self {
        Self::new(doc.path_type_map(), fallback)
    }

    pub fn resolve(&self, path: &str) -> ComponentKind {
        let path = pathutil::neutralize(path);
        let mut cursor = Some(path.clone());
        while let Some(candidate) = cursor {
            if let Some(declared) = self.types.get(&candidate) {
                match declared {
                    ComponentType::Kind(ComponentKind::DataBucket)
                        if candidate == ROOT_ALIAS && path != ROOT_ALIAS => {}
                    ComponentType::Kind(kind) => return *kind,
                    ComponentType::ByExtension(map) => {
                        return pathutil::extension(&path)
                            .and_then(|ext| map.get(&ext).copied())
                            .unwrap_or(self.fallback);
                    }
                }
            }
            cursor = pathutil::parent(&candidate);
        }
        self.fallback
    }
}

/// Stand-ins for components flagged `payload.external = true`.
///
/// Such components point at content another node owns; `payload.size` and
/// `payload.directory` describe it when this drive cannot read it.
pub fn external_map(doc: &ManifestDocument) -> ExternalMap {
    doc.components
        .iter()
        .filter(|c| c.payload.get("external").and_then(|v| v.as_bool()) == Some(true))
        .filter_map(|c| {
            let hash = c.cid()?.to_string();
            let entry = ExternalEntry {
                size: c.payload.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                directory: c
                    .payload
                    .get("directory")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                path: Some(pathutil::neutralize(&c.path)),
            };
            Some((hash, entry))
        })
        .collect()
}
