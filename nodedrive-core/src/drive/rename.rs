// src/drive/rename.rs
//! Rename and move of drive entries.
//!
//! Pipeline (run under the node's lock, shared with healing):
//! 1. compute the destination path;
//! 2. reject it if the current tree (or manifest) already has it;
//! 3. rewrite the DAG link, yielding a new root and the replaced ancestor hashes;
//! 4. build the manifest actions (component paths, ancestor hashes, data bucket root);
//! 5. recompute the required rows against the previewed manifest and match every
//!    one to an existing row by its new or pre-rename path;
//! 6. write the rows and commit the manifest in one SQLite transaction, with the
//!    manifest dispatch as the commit gate.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::drive::content::{ContentStore, LinkUpdate};
use crate::drive::healer::{HealOptions, HealTarget, ReferenceHealer};
use crate::drive::path_index;
use crate::error::{DriveError, DriveResult};
use crate::manifest::actions::ManifestAction;
use crate::manifest::dispatcher::{self, ActionDispatcher};
use crate::manifest::document::DocumentId;
use crate::manifest::model::ManifestDocument;
use crate::services::audit::record_action;
use crate::services::references::{Node, RefScope, ReferenceRow, ReferenceStore};
use crate::utils::path::{self as pathutil, ROOT_ALIAS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameOutcome {
    pub old_path: String,
    pub new_path: String,
    pub manifest: ManifestDocument,
    pub root_hash: String,
    /// Directory hashes replaced by the edit (old → new).
    pub changed: BTreeMap<String, String>,
    pub rows_updated: usize,
    pub rows_inserted: usize,
}

pub struct RenameMoveOrchestrator {
    content: Arc<dyn ContentStore>,
    dispatcher: ActionDispatcher,
    healer: Arc<ReferenceHealer>,
    refs: Arc<ReferenceStore>,
    opts: HealOptions,
}

impl RenameMoveOrchestrator {
    pub fn new(
        content: Arc<dyn ContentStore>,
        dispatcher: ActionDispatcher,
        healer: Arc<ReferenceHealer>,
        refs: Arc<ReferenceStore>,
        opts: HealOptions,
    ) -> Self {
        Self {
            content,
            dispatcher,
            healer,
            refs,
            opts,
        }
    }

    /// Rename the entry at `old_path` to `new_name` within its directory.
    pub fn rename(&self, node: &Node, old_path: &str, new_name: &str) -> DriveResult<RenameOutcome> {
        pathutil::validate_segment(new_name).map_err(|e| DriveError::InvalidPath(e.to_string()))?;
        let old_path = checked_path(old_path)?;
        let parent = pathutil::parent(&old_path)
            .ok_or_else(|| DriveError::InvalidPath(old_path.clone()))?;
        let new_path = pathutil::join(&parent, new_name);
        let old_name = pathutil::file_name(&old_path);

        self.relocate(node, &old_path, &new_path, |root| {
            self.content.rename_link(root, &parent, &old_name, new_name)
        })
    }

    /// Move the entry at `old_path` to `new_path`, creating missing directories.
    pub fn move_path(&self, node: &Node, old_path: &str, new_path: &str) -> DriveResult<RenameOutcome> {
        let old_path = checked_path(old_path)?;
        let new_path = checked_path(new_path)?;
        if pathutil::is_within(&new_path, &old_path) {
            return Err(DriveError::InvalidPath(format!(
                "cannot move {old_path} beneath itself ({new_path})"
            )));
        }
        self.relocate(node, &old_path, &new_path, |root| {
            self.content.move_link(root, &old_path, &new_path)
        })
    }

    fn relocate<F>(
        &self,
        node: &Node,
        old_path: &str,
        new_path: &str,
        dag_op: F,
    ) -> DriveResult<RenameOutcome>
    where
        F: FnOnce(&str) -> anyhow::Result<LinkUpdate>,
    {
        self.healer
            .node_locks()
            .with_node(node.id, || self.relocate_locked(node, old_path, new_path, dag_op))
    }

    fn relocate_locked<F>(
        &self,
        node: &Node,
        old_path: &str,
        new_path: &str,
        dag_op: F,
    ) -> DriveResult<RenameOutcome>
    where
        F: FnOnce(&str) -> anyhow::Result<LinkUpdate>,
    {
        let target = self.healer.draft_target(node)?;
        let externals = path_index::external_map(&target.manifest);
        let tree = self.content.get_directory_tree(&target.root_hash, &externals)?;
        let before = path_index::flatten(&tree);

        if !before.contains_key(old_path) {
            return Err(DriveError::PathNotFound(old_path.to_string()));
        }
        if before.contains_key(new_path) || target.manifest.position_by_path(new_path).is_some() {
            tracing::info!(node = %node.uuid, from = %old_path, to = %new_path, "rename rejected: collision");
            return Err(DriveError::Collision {
                path: new_path.to_string(),
            });
        }

        let update = dag_op(&target.root_hash)?;

        let mut bucket = target
            .manifest
            .data_bucket()
            .cloned()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?;
        bucket.set_cid(&update.new_root);
        let mut actions = vec![ManifestAction::RenameComponentPath {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        }];
        if !update.changed.is_empty() {
            actions.push(ManifestAction::UpdateComponentHashes {
                rewrites: update.changed.clone(),
            });
        }
        actions.push(ManifestAction::UpsertComponent { component: bucket });

        let preview = HealTarget {
            manifest: dispatcher::apply(&target.manifest, &actions),
            root_hash: update.new_root.clone(),
            ..target.clone()
        };
        let required = self.healer.required_rows(&preview, &self.opts)?;
        let current = self.refs.list_references(RefScope::Private, node.id, None)?;
        let (updates, inserts) = match_rows(
            node,
            &required,
            &current,
            &before,
            old_path,
            new_path,
            self.opts.mark_externals,
        )?;

        let doc_id = DocumentId(node.document_id.clone());
        let manifest = self.refs.rewrite_references(
            RefScope::Private,
            &inserts,
            &updates,
            || -> DriveResult<ManifestDocument> {
                self.dispatcher
                    .dispatch(&doc_id, &actions)?
                    .ok_or_else(|| DriveError::NotReady(doc_id.to_string()))
            },
        )?;

        tracing::info!(
            node = %node.uuid,
            from = %old_path,
            to = %new_path,
            root = %update.new_root,
            rows = updates.len(),
            "drive entry relocated"
        );
        record_action(
            "orchestrator",
            "relocate_committed",
            &json!({
                "node": node.uuid,
                "from": old_path,
                "to": new_path,
                "root": update.new_root,
                "rows_updated": updates.len(),
                "rows_inserted": inserts.len(),
            }),
            "medium",
        );

        Ok(RenameOutcome {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
            manifest,
            root_hash: update.new_root,
            changed: update.changed,
            rows_updated: updates.len(),
            rows_inserted: inserts.len(),
        })
    }
}

fn checked_path(path: &str) -> DriveResult<String> {
    let p = pathutil::validate_drive_path(path).map_err(|e| DriveError::InvalidPath(e.to_string()))?;
    if p == ROOT_ALIAS {
        return Err(DriveError::InvalidPath("the data bucket root cannot be relocated".into()));
    }
    Ok(p)
}

/// Pair each required row with the existing row it replaces.
///
/// Returns `(updates, inserts)`. Inserts are only allowed for directories a
/// move created; any other unmatched row is an integrity gap. Without
/// `mark_externals` a matched row keeps its recorded `external` flag.
fn match_rows(
    node: &Node,
    required: &[ReferenceRow],
    current: &[ReferenceRow],
    before: &BTreeMap<String, path_index::FlatEntry>,
    old_path: &str,
    new_path: &str,
    mark_externals: bool,
) -> DriveResult<(Vec<ReferenceRow>, Vec<ReferenceRow>)> {
    let by_path: HashMap<String, &ReferenceRow> = current
        .iter()
        .map(|r| (pathutil::neutralize(&r.path), r))
        .collect();

    let mut used = HashSet::new();
    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    for req in required {
        let prior = pathutil::rebase(&req.path, new_path, old_path);
        let existing = prior
            .as_deref()
            .and_then(|p| by_path.get(p))
            .or_else(|| by_path.get(&req.path))
            .copied()
            .filter(|r| r.id.is_some_and(|id| !used.contains(&id)));

        match existing {
            Some(row) => {
                if let Some(id) = row.id {
                    used.insert(id);
                }
                let mut next = req.clone();
                next.id = row.id;
                next.created_at = row.created_at;
                next.updated_at = row.updated_at;
                if !mark_externals {
                    next.external = row.external || req.external;
                }
                if &next != row {
                    updates.push(next);
                }
            }
            None if req.directory && prior.is_none() && !before.contains_key(&req.path) => {
                inserts.push(req.clone());
            }
            None => {
                tracing::error!(
                    node = %node.uuid,
                    path = %req.path,
                    "integrity gap: required row has no existing counterpart"
                );
                record_action(
                    "orchestrator",
                    "integrity_gap",
                    &json!({ "node": node.uuid, "path": req.path }),
                    "high",
                );
                return Err(DriveError::IntegrityGap {
                    node: node.uuid.clone(),
                    path: req.path.clone(),
                });
            }
        }
    }
    Ok((updates, inserts))
}
