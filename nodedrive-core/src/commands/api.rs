// src/commands/api.rs
use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::commands::init::{ensure_initialized_at, ensure_initialized_once};
use crate::config::CoreConfig;
use crate::drive::content::{ContentStore, DagStore};
use crate::drive::healer::{BatchHealSummary, HealOptions, HealReport, ReferenceHealer, ValidationReport};
use crate::drive::path_index::{self, TypeResolver};
use crate::drive::reconciler::{DriveObject, DriveReconciler, ReconcileInput};
use crate::drive::rename::{RenameMoveOrchestrator, RenameOutcome};
use crate::error::{DriveError, DriveResult};
use crate::manifest::actions::ManifestAction;
use crate::manifest::dispatcher::ActionDispatcher;
use crate::manifest::document::{ChangeMeta, DocumentId, DocumentStore, FsDocumentStore};
use crate::manifest::model::ManifestDocument;
use crate::services::audit::{self, record_action};
use crate::services::indexer::{Indexer, PublishedVersion, StaticIndexer};
use crate::services::references::{Node, NodeVersion, RefScope, ReferenceStore};
use crate::utils::path as pathutil;

/// One handle over a workspace root: stores, dispatcher, healer and
/// rename pipeline wired from `config.toml`.
pub struct Commands {
    root: PathBuf,
    cfg: CoreConfig,
    content: Arc<dyn ContentStore>,
    documents: Arc<dyn DocumentStore>,
    refs: Arc<ReferenceStore>,
    indexer: Arc<StaticIndexer>,
    dispatcher: ActionDispatcher,
    healer: Arc<ReferenceHealer>,
    reconciler: DriveReconciler,
    orchestrator: RenameMoveOrchestrator,
    opts: HealOptions,
}

impl Commands {
    /// Open (initializing if needed) the workspace at `root`.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let report = ensure_initialized_at(root)?;
        let cfg = CoreConfig::load(&report.root)?;
        audit::install(&cfg.store.logbook_path);

        let content: Arc<dyn ContentStore> = Arc::new(DagStore::open(&cfg.store.content_path)?);
        let documents: Arc<dyn DocumentStore> =
            Arc::new(FsDocumentStore::open(&cfg.store.documents_path)?);
        let refs = Arc::new(ReferenceStore::open(&cfg.store.db_path)?);
        let indexer = Arc::new(StaticIndexer::open(&cfg.store.indexer_path)?);
        let dispatcher = ActionDispatcher::new(documents.clone(), cfg.system.name.clone());
        let healer = Arc::new(
            ReferenceHealer::new(
                content.clone(),
                documents.clone(),
                refs.clone(),
                indexer.clone(),
            )
            .with_logbook(report.root.clone()),
        );
        let opts = HealOptions::from_config(&cfg);
        let orchestrator = RenameMoveOrchestrator::new(
            content.clone(),
            dispatcher.clone(),
            healer.clone(),
            refs.clone(),
            opts.clone(),
        );

        Ok(Self {
            root: report.root,
            reconciler: DriveReconciler::new(content.clone()),
            cfg,
            content,
            documents,
            refs,
            indexer,
            dispatcher,
            healer,
            orchestrator,
            opts,
        })
    }

    /// Open the workspace named by `NODEDRIVE_ROOT` (default `.nodedrive`).
    pub fn from_env() -> anyhow::Result<Self> {
        let report = ensure_initialized_once()?;
        Self::open(&report.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn references(&self) -> &Arc<ReferenceStore> {
        &self.refs
    }

    pub fn indexer(&self) -> &Arc<StaticIndexer> {
        &self.indexer
    }

    // ---------- nodes ----------

    /// Create a node whose drive holds `files`, with a fresh manifest and
    /// healed draft rows.
    pub fn create_node(&self, owner: &str, title: &str, files: &[(&str, &[u8])]) -> DriveResult<Node> {
        let root_hash = self.content.put_tree(files)?;
        let manifest = ManifestDocument::with_data_bucket(title, &root_hash);
        let doc_id = self.documents.create(
            &manifest,
            ChangeMeta {
                time: Utc::now(),
                message: "Create Node".into(),
                actor: self.cfg.system.name.clone(),
            },
        )?;
        let node = self.refs.create_node(owner, doc_id.as_str())?;
        self.refs
            .create_version(node.id, &manifest.snapshot_hash()?, &root_hash, None)?;

        let target = self.healer.draft_target(&node)?;
        self.healer.heal(&target, &self.opts)?;

        tracing::info!(node = %node.uuid, root = %root_hash, files = files.len(), "node created");
        record_action(
            "commands",
            "node_created",
            &json!({ "node": node.uuid, "document": doc_id.as_str(), "root": root_hash }),
            "low",
        );
        Ok(node)
    }

    pub fn node(&self, uuid: &str) -> DriveResult<Node> {
        self.refs
            .node_by_uuid(uuid)?
            .ok_or_else(|| DriveError::NodeNotFound(uuid.to_string()))
    }

    pub fn list_nodes(&self) -> DriveResult<Vec<Node>> {
        Ok(self.refs.list_nodes()?)
    }

    // ---------- manifest ----------

    pub fn manifest(&self, uuid: &str) -> DriveResult<ManifestDocument> {
        let node = self.node(uuid)?;
        let handle = self
            .documents
            .find(&DocumentId(node.document_id.clone()))?
            .ok_or_else(|| DriveError::NotReady(node.document_id.clone()))?;
        handle
            .doc()?
            .ok_or_else(|| DriveError::NotReady(node.document_id.clone()))
    }

    /// Dispatch `actions` against the node's manifest (`Ok(None)` when not ready).
    pub fn dispatch(&self, uuid: &str, actions: &[ManifestAction]) -> DriveResult<Option<ManifestDocument>> {
        let node = self.node(uuid)?;
        self.dispatcher
            .dispatch(&DocumentId(node.document_id.clone()), actions)
    }

    // ---------- drive ----------

    /// Annotated drive of the node's current draft.
    pub fn tree(&self, uuid: &str) -> DriveResult<DriveObject> {
        let node = self.node(uuid)?;
        let manifest = self.manifest(uuid)?;
        let root_hash = manifest
            .data_root()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?;
        let externals = path_index::external_map(&manifest);
        let private_rows = self.refs.list_references(RefScope::Private, node.id, None)?;
        let public_rows = self.refs.list_references(RefScope::Public, node.id, None)?;
        let types = TypeResolver::from_manifest(&manifest, self.cfg.drive.default_type);

        let mut anchor_times = HashMap::new();
        for v in self.refs.versions(node.id)? {
            if v.anchor_id.is_none() {
                continue;
            }
            if let Some(t) = self.indexer.anchor_time(&node.uuid, &v.manifest_hash)? {
                anchor_times.insert(v.id, t);
            }
        }

        Ok(self.reconciler.reconcile(&ReconcileInput {
            root_hash,
            externals: &externals,
            private_rows: &private_rows,
            public_rows: &public_rows,
            types: &types,
            anchor_times: &anchor_times,
        })?)
    }

    /// Write `files` into the node's drive and heal its draft rows.
    pub fn add_files(&self, uuid: &str, files: &[(&str, &[u8])]) -> DriveResult<ManifestDocument> {
        let node = self.node(uuid)?;
        self.healer
            .node_locks()
            .with_node(node.id, || self.add_files_locked(&node, files))
    }

    fn add_files_locked(&self, node: &Node, files: &[(&str, &[u8])]) -> DriveResult<ManifestDocument> {
        let manifest = self.manifest(&node.uuid)?;
        let mut root = manifest
            .data_root()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?
            .to_string();
        let mut rewrites = std::collections::BTreeMap::new();
        for (path, bytes) in files {
            let update = self
                .content
                .put_file(&root, path, bytes)
                .map_err(|e| DriveError::InvalidPath(format!("{path}: {e}")))?;
            for (old, new) in update.changed {
                rewrites.insert(old, new);
            }
            root = update.new_root;
        }
        self.commit_root(node, &manifest, &root, rewrites, Vec::new())
    }

    /// Remove `path` (and everything under it) from the drive and manifest.
    /// The rows it leaves behind are pruned into the ledger by the heal.
    pub fn remove_path(&self, uuid: &str, path: &str) -> DriveResult<ManifestDocument> {
        let node = self.node(uuid)?;
        let path = pathutil::validate_drive_path(path).map_err(|e| DriveError::InvalidPath(e.to_string()))?;
        self.healer
            .node_locks()
            .with_node(node.id, || self.remove_path_locked(&node, &path))
    }

    fn remove_path_locked(&self, node: &Node, path: &str) -> DriveResult<ManifestDocument> {
        let manifest = self.manifest(&node.uuid)?;
        let root = manifest
            .data_root()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?;
        let (_, update) = self
            .content
            .remove_link(root, path)
            .map_err(|_| DriveError::PathNotFound(path.to_string()))?;
        let doomed: Vec<String> = manifest
            .components
            .iter()
            .filter(|c| !c.is_data_bucket() && pathutil::is_within(&c.path, path))
            .map(|c| c.path.clone())
            .collect();
        let actions = vec![ManifestAction::DeleteComponents { paths: doomed }];
        self.commit_root(node, &manifest, &update.new_root, update.changed, actions)
    }

    /// Dispatch the new root and heal; the caller holds the node's lock.
    fn commit_root(
        &self,
        node: &Node,
        manifest: &ManifestDocument,
        new_root: &str,
        rewrites: std::collections::BTreeMap<String, String>,
        mut actions: Vec<ManifestAction>,
    ) -> DriveResult<ManifestDocument> {
        let mut bucket = manifest
            .data_bucket()
            .cloned()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?;
        bucket.set_cid(new_root);
        if !rewrites.is_empty() {
            actions.push(ManifestAction::UpdateComponentHashes { rewrites });
        }
        actions.push(ManifestAction::UpsertComponent { component: bucket });

        let doc = self
            .dispatcher
            .dispatch(&DocumentId(node.document_id.clone()), &actions)?
            .ok_or_else(|| DriveError::NotReady(node.document_id.clone()))?;
        let target = self.healer.draft_target(node)?;
        self.healer.heal(&target, &self.opts)?;
        Ok(doc)
    }

    pub fn rename(&self, uuid: &str, old_path: &str, new_name: &str) -> DriveResult<RenameOutcome> {
        let node = self.node(uuid)?;
        self.orchestrator.rename(&node, old_path, new_name)
    }

    pub fn move_path(&self, uuid: &str, old_path: &str, new_path: &str) -> DriveResult<RenameOutcome> {
        let node = self.node(uuid)?;
        self.orchestrator.move_path(&node, old_path, new_path)
    }

    // ---------- healing ----------

    pub fn validate(&self, uuid: &str) -> DriveResult<ValidationReport> {
        let node = self.node(uuid)?;
        let target = self.healer.draft_target(&node)?;
        self.healer.validate(&target, &self.opts)
    }

    pub fn heal(&self, uuid: &str) -> DriveResult<HealReport> {
        let node = self.node(uuid)?;
        self.healer.heal_node(&node, &self.opts)
    }

    /// Heal every node in `[start, end)`; unset bounds come from `[heal]`.
    pub fn heal_all(
        &self,
        start: Option<usize>,
        end: Option<usize>,
        cancel: &AtomicBool,
    ) -> DriveResult<BatchHealSummary> {
        self.healer.heal_all(
            start.or(self.cfg.heal.batch_start),
            end.or(self.cfg.heal.batch_end),
            &self.opts,
            cancel,
        )
    }

    pub fn heal_public_history(&self, uuid: &str) -> DriveResult<Vec<HealReport>> {
        let node = self.node(uuid)?;
        self.healer.heal_public_history(&node, &self.opts)
    }

    // ---------- publishing ----------

    /// Freeze the current manifest as a published version under `anchor_id`
    /// and write its public rows.
    pub fn publish(&self, uuid: &str, anchor_id: &str) -> DriveResult<NodeVersion> {
        let node = self.node(uuid)?;
        let manifest = self.manifest(uuid)?;
        let data_root = manifest
            .data_root()
            .ok_or_else(|| DriveError::MissingDataBucket(node.uuid.clone()))?;
        let manifest_hash = self.content.put_blob(&serde_json::to_vec(&manifest)?)?;
        if self
            .refs
            .version_by_manifest_hash(node.id, &manifest_hash)?
            .is_some_and(|v| v.anchor_id.is_some())
        {
            return Err(anyhow!("manifest {manifest_hash} is already published").into());
        }
        let version = self
            .refs
            .create_version(node.id, &manifest_hash, data_root, Some(anchor_id))?;
        self.indexer.record(
            &node.uuid,
            PublishedVersion {
                manifest_hash: manifest_hash.clone(),
                anchor_id: anchor_id.to_string(),
                time: Some(Utc::now()),
            },
        )?;
        let target = self.healer.published_target(&node, &version)?;
        self.healer.heal(&target, &self.opts)?;

        record_action(
            "commands",
            "version_published",
            &json!({ "node": node.uuid, "version": version.id, "manifest": manifest_hash }),
            "medium",
        );
        Ok(version)
    }
}
