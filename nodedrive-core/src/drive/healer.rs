// src/drive/healer.rs
//! Reference healing.
//!
//! The *required* rows of a node version are recomputed from scratch: flatten
//! the drive tree, classify every path by type inheritance. They are compared
//! with the *current* rows keyed by `(hash, neutral path)`:
//! - required but absent → missing (heal inserts it);
//! - present but not required → orphaned (heal moves it to the prune ledger);
//! - present in both → kept as is. Size drift is reported, and corrected only
//!   when `mark_externals` is on; that mode also resolves the external flag.
//!
//! A heal always works on one [`HealTarget`], a manifest and the tree root it
//! names, read together, so pruning never mixes versions.

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::CoreConfig;
use crate::drive::content::ContentStore;
use crate::drive::locks::NodeLocks;
use crate::drive::path_index::{self, TypeResolver};
use crate::error::{DriveError, DriveResult};
use crate::manifest::document::{DocumentId, DocumentStore};
use crate::manifest::model::{ComponentKind, ManifestDocument};
use crate::services::audit::record_action;
use crate::services::indexer::Indexer;
use crate::services::references::{HealWrite, Node, NodeVersion, RefScope, ReferenceRow, ReferenceStore};
use crate::utils::logbook;
use crate::utils::path as pathutil;

/// A manifest and the drive root it describes, read as one pairing.
#[derive(Debug, Clone)]
pub struct HealTarget {
    pub node: Node,
    /// Version the rows are stamped with.
    pub version: NodeVersion,
    pub manifest: ManifestDocument,
    pub root_hash: String,
    pub scope: RefScope,
}

#[derive(Debug, Clone)]
pub struct HealOptions {
    pub mark_externals: bool,
    pub prune_duration_days: u32,
    pub default_type: ComponentKind,
}

impl Default for HealOptions {
    fn default() -> Self {
        Self {
            mark_externals: false,
            prune_duration_days: 30,
            default_type: ComponentKind::Unknown,
        }
    }
}

impl HealOptions {
    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self {
            mark_externals: cfg.heal.mark_externals,
            prune_duration_days: cfg.heal.prune_duration_days,
            default_type: cfg.drive.default_type,
        }
    }
}

/// A row present in both sets whose secondary fields disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    pub path: String,
    pub hash: String,
    pub recorded_size: u64,
    pub actual_size: u64,
    pub recorded_external: bool,
    pub actual_external: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub missing: Vec<ReferenceRow>,
    pub orphaned: Vec<ReferenceRow>,
    pub drift: Vec<Drift>,
    /// Current rows whose corrected form `mark_externals` would write.
    #[serde(skip)]
    corrected: Vec<ReferenceRow>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty() && self.drift.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealReport {
    pub node: String,
    pub version_id: i64,
    pub scope: RefScope,
    pub inserted: usize,
    pub pruned: usize,
    pub updated: usize,
    /// Drift found but left alone (no `mark_externals`).
    pub drift_reported: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchHealSummary {
    pub total: usize,
    pub healed: Vec<HealReport>,
    pub failed: Vec<NodeFailure>,
    pub cancelled: bool,
}

pub struct ReferenceHealer {
    content: Arc<dyn ContentStore>,
    documents: Arc<dyn DocumentStore>,
    refs: Arc<ReferenceStore>,
    indexer: Arc<dyn Indexer>,
    locks: Arc<NodeLocks>,
    logbook_dir: Option<PathBuf>,
}

impl ReferenceHealer {
    pub fn new(
        content: Arc<dyn ContentStore>,
        documents: Arc<dyn DocumentStore>,
        refs: Arc<ReferenceStore>,
        indexer: Arc<dyn Indexer>,
    ) -> Self {
        Self {
            content,
            documents,
            refs,
            indexer,
            locks: Arc::new(NodeLocks::new()),
            logbook_dir: None,
        }
    }

    /// Per-node locks shared with every writer of draft rows.
    pub fn node_locks(&self) -> &Arc<NodeLocks> {
        &self.locks
    }

    /// Emit batch summaries to `<dir>/logbook.jsonl`.
    pub fn with_logbook(mut self, dir: PathBuf) -> Self {
        self.logbook_dir = Some(dir);
        self
    }

    // ---------- targets ----------

    /// Current draft manifest of `node` with its data root, stamped with the
    /// node's latest version.
    pub fn draft_target(&self, node: &Node) -> DriveResult<HealTarget> {
        let doc_id = DocumentId(node.document_id.clone());
        let handle = self
            .documents
            .find(&doc_id)?
            .ok_or_else(|| DriveError::NotReady(node.document_id.clone()))?;
        if !handle.is_ready() {
            return Err(DriveError::NotReady(node.document_id.clone()));
        }
        let manifest = handle
            .doc()?
            .ok_or_else(|| DriveError::NotReady(node.document_id.clone()))?;
        let root_hash = manifest
            .data_root()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?
            .to_string();
        let version = self
            .refs
            .latest_version(node.id)?
            .ok_or_else(|| anyhow!("node {} has no version", node.uuid))?;
        Ok(HealTarget {
            node: node.clone(),
            version,
            manifest,
            root_hash,
            scope: RefScope::Private,
        })
    }

    /// The manifest a published version was cut from, read back from the
    /// content store by its manifest hash.
    pub fn published_target(&self, node: &Node, version: &NodeVersion) -> DriveResult<HealTarget> {
        let manifest = self.load_manifest(&version.manifest_hash)?;
        let root_hash = manifest
            .data_root()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?
            .to_string();
        if root_hash != version.data_root {
            return Err(anyhow!(
                "version {} of node {} names root {} but its manifest names {}",
                version.id,
                node.uuid,
                version.data_root,
                root_hash
            )
            .into());
        }
        Ok(HealTarget {
            node: node.clone(),
            version: version.clone(),
            manifest,
            root_hash,
            scope: RefScope::Public,
        })
    }

    fn load_manifest(&self, manifest_hash: &str) -> DriveResult<ManifestDocument> {
        let bytes = self
            .content
            .get_blob(manifest_hash)
            .with_context(|| format!("manifest {manifest_hash} not in content store"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // ---------- required rows ----------

    /// Rows the index must hold for `target`.
    pub fn required_rows(
        &self,
        target: &HealTarget,
        opts: &HealOptions,
    ) -> DriveResult<Vec<ReferenceRow>> {
        let externals = path_index::external_map(&target.manifest);
        let tree = self.content.get_directory_tree(&target.root_hash, &externals)?;
        let types = TypeResolver::from_manifest(&target.manifest, opts.default_type);
        let now = Utc::now();

        let mut rows = Vec::new();
        for (path, entry) in path_index::flatten(&tree) {
            let mut external = entry.external;
            if opts.mark_externals && !external && !entry.root {
                external = self.refs.owner_of_hash(&entry.hash, target.node.id)?.is_some();
            }
            rows.push(ReferenceRow {
                id: None,
                node_id: target.node.id,
                version_id: target.version.id,
                hash: entry.hash,
                root_hash: target.root_hash.clone(),
                kind: types.resolve(&path),
                path,
                name: entry.name,
                size: entry.size,
                directory: entry.directory,
                root: entry.root,
                external,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(rows)
    }

    fn current_rows(&self, target: &HealTarget) -> DriveResult<Vec<ReferenceRow>> {
        let version = match target.scope {
            RefScope::Private => None,
            RefScope::Public => Some(target.version.id),
        };
        Ok(self.refs.list_references(target.scope, target.node.id, version)?)
    }

    // ---------- validate / heal ----------

    pub fn validate(&self, target: &HealTarget, opts: &HealOptions) -> DriveResult<ValidationReport> {
        let required = self.required_rows(target, opts)?;
        let current = self.current_rows(target)?;
        Ok(compare(required, current, opts.mark_externals))
    }

    pub fn heal(&self, target: &HealTarget, opts: &HealOptions) -> DriveResult<HealReport> {
        let report = self.validate(target, opts)?;
        for d in &report.drift {
            tracing::warn!(
                node = %target.node.uuid,
                path = %d.path,
                recorded = d.recorded_size,
                actual = d.actual_size,
                "reference drift"
            );
        }

        let update = if opts.mark_externals {
            report.corrected.clone()
        } else {
            Vec::new()
        };
        let write = HealWrite {
            insert: report.missing.clone(),
            update,
            prune: report.orphaned.clone(),
            prune_duration_days: opts.prune_duration_days,
            prune_description: format!(
                "orphaned {} reference (version {})",
                target.scope.as_str(),
                target.version.id
            ),
        };
        if !write.insert.is_empty() || !write.update.is_empty() || !write.prune.is_empty() {
            self.refs.apply_heal(target.scope, &write)?;
        }

        let out = HealReport {
            node: target.node.uuid.clone(),
            version_id: target.version.id,
            scope: target.scope,
            inserted: write.insert.len(),
            pruned: write.prune.len(),
            updated: write.update.len(),
            drift_reported: if opts.mark_externals { 0 } else { report.drift.len() },
        };
        tracing::info!(
            node = %out.node,
            scope = out.scope.as_str(),
            inserted = out.inserted,
            pruned = out.pruned,
            updated = out.updated,
            "references healed"
        );
        record_action(
            "healer",
            "heal_applied",
            &json!({
                "node": out.node,
                "scope": out.scope.as_str(),
                "version": out.version_id,
                "inserted": out.inserted,
                "pruned": out.pruned,
                "updated": out.updated,
            }),
            if out.pruned > 0 { "medium" } else { "low" },
        );
        Ok(out)
    }

    /// Read the draft target of `node` and heal it under the node's lock.
    pub fn heal_node(&self, node: &Node, opts: &HealOptions) -> DriveResult<HealReport> {
        self.locks.with_node(node.id, || {
            let target = self.draft_target(node)?;
            self.heal(&target, opts)
        })
    }

    /// Heal the draft rows of every node in `[start, end)` (by node id order).
    ///
    /// A failing node is logged and recorded; the sweep continues. `cancel` is
    /// checked before each node.
    pub fn heal_all(
        &self,
        start: Option<usize>,
        end: Option<usize>,
        opts: &HealOptions,
        cancel: &AtomicBool,
    ) -> DriveResult<BatchHealSummary> {
        let nodes = self.refs.list_nodes()?;
        let end = end.unwrap_or(nodes.len()).min(nodes.len());
        let start = start.unwrap_or(0).min(end);
        let batch = &nodes[start..end];

        let mut summary = BatchHealSummary {
            total: batch.len(),
            ..Default::default()
        };
        for node in batch {
            if cancel.load(Ordering::Relaxed) {
                tracing::warn!(node = %node.uuid, "batch heal cancelled");
                summary.cancelled = true;
                break;
            }
            match self.heal_node(node, opts) {
                Ok(report) => summary.healed.push(report),
                Err(e) => {
                    tracing::error!(node = %node.uuid, error = %e, "heal failed for node");
                    summary.failed.push(NodeFailure {
                        node: node.uuid.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(dir) = &self.logbook_dir {
            let data = json!({
                "range": [start, end],
                "total": summary.total,
                "healed": summary.healed.len(),
                "failed": summary.failed.len(),
                "cancelled": summary.cancelled,
            });
            if let Err(e) = logbook::emit_event(dir, "heal_all", data, &Utc::now().to_rfc3339()) {
                tracing::warn!(error = %e, "could not write batch heal summary");
            }
        }
        Ok(summary)
    }

    /// Backfill public rows for every version the indexer lists for `node`.
    ///
    /// Versions unknown to the registry are registered from their manifest.
    pub fn heal_public_history(&self, node: &Node, opts: &HealOptions) -> DriveResult<Vec<HealReport>> {
        let mut reports = Vec::new();
        for published in self.indexer.history(&node.uuid)? {
            let version = match self
                .refs
                .version_by_manifest_hash(node.id, &published.manifest_hash)?
                .filter(|v| v.anchor_id.is_some())
            {
                Some(v) => v,
                None => {
                    let manifest = self.load_manifest(&published.manifest_hash)?;
                    let data_root = manifest
                        .data_root()
                        .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?;
                    tracing::info!(
                        node = %node.uuid,
                        manifest = %published.manifest_hash,
                        "registering published version"
                    );
                    self.refs.create_version(
                        node.id,
                        &published.manifest_hash,
                        data_root,
                        Some(&published.anchor_id),
                    )?
                }
            };
            let target = self.published_target(node, &version)?;
            reports.push(self.heal(&target, opts)?);
        }
        Ok(reports)
    }
}

fn row_key(hash: &str, path: &str) -> (String, String) {
    (hash.to_string(), pathutil::neutralize(path))
}

/// Without `mark_externals` ownership is never resolved, so a stored
/// `external` flag is taken as recorded and only size can drift.
fn compare(required: Vec<ReferenceRow>, current: Vec<ReferenceRow>, mark_externals: bool) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut by_key: HashMap<(String, String), ReferenceRow> = HashMap::new();
    for row in current {
        let key = row_key(&row.hash, &row.path);
        if by_key.contains_key(&key) {
            // duplicate of a row already kept
            report.orphaned.push(row);
        } else {
            by_key.insert(key, row);
        }
    }

    let mut required_keys = HashSet::new();
    for req in required {
        let key = row_key(&req.hash, &req.path);
        required_keys.insert(key.clone());
        match by_key.get(&key) {
            None => report.missing.push(req),
            Some(cur) => {
                let external = if mark_externals { req.external } else { cur.external };
                if cur.size != req.size || cur.external != external {
                    report.drift.push(Drift {
                        path: req.path.clone(),
                        hash: req.hash.clone(),
                        recorded_size: cur.size,
                        actual_size: req.size,
                        recorded_external: cur.external,
                        actual_external: external,
                    });
                    let mut fixed = cur.clone();
                    fixed.size = req.size;
                    fixed.external = external;
                    report.corrected.push(fixed);
                }
            }
        }
    }

    let mut leftovers: Vec<ReferenceRow> = by_key
        .into_iter()
        .filter(|(k, _)| !required_keys.contains(k))
        .map(|(_, row)| row)
        .collect();
    leftovers.sort_by(|a, b| a.path.cmp(&b.path));
    report.orphaned.extend(leftovers);
    report
}
