// src/services/references.rs
//! Relational reference index (single SQLite writer).
//!
//! - Owns one SQLite connection (WAL); every row write goes through here.
//! - `nodes` / `node_versions`: which document and which data root a node has.
//! - `data_references`: draft rows for a node's current drive.
//! - `public_data_references`: rows describing one published version.
//! - `cid_prune_list`: ledger of rows removed by healing or deletion.
//!
//! Bulk writes (`create_many`, `delete_many`, `update_many`, `apply_heal`,
//! `rewrite_references`) each run in one transaction.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::manifest::model::ComponentKind;

/// Partition of the reference index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefScope {
    /// Draft rows, keyed by node.
    Private,
    /// Rows of a published version, keyed by node and version.
    Public,
}

impl RefScope {
    fn table(&self) -> &'static str {
        match self {
            RefScope::Private => "data_references",
            RefScope::Public => "public_data_references",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefScope::Private => "private",
            RefScope::Public => "public",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: i64,
    pub uuid: String,
    pub owner_id: String,
    pub document_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersion {
    pub id: i64,
    pub node_id: i64,
    /// Content hash of the manifest snapshot this version was cut from.
    pub manifest_hash: String,
    pub data_root: String,
    /// Anchor (on-chain or otherwise) this version was published under.
    pub anchor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRow {
    /// `None` until inserted.
    pub id: Option<i64>,
    pub node_id: i64,
    pub version_id: i64,
    pub hash: String,
    pub root_hash: String,
    /// Neutralized drive path.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub directory: bool,
    pub root: bool,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub external: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneEntry {
    pub id: i64,
    pub hash: String,
    pub path: String,
    pub size: u64,
    pub directory: bool,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub node_id: i64,
    pub duration_days: u32,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// One batch of corrections produced by the healer.
#[derive(Debug, Clone, Default)]
pub struct HealWrite {
    pub insert: Vec<ReferenceRow>,
    pub update: Vec<ReferenceRow>,
    pub prune: Vec<ReferenceRow>,
    pub prune_duration_days: u32,
    pub prune_description: String,
}

const ROW_COLUMNS: &str = "id, node_id, version_id, hash, root_hash, path, name, size, \
                           directory, root, type, external, created_at, updated_at";

/// ReferenceStore is the single authority for writing to SQLite.
pub struct ReferenceStore {
    db: Mutex<Connection>,
}

impl ReferenceStore {
    /// Open/create the SQLite DB and ensure schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(db_path)
            .with_context(|| format!("open reference db {}", db_path.display()))?;
        Self::init(db)
    }

    /// Throwaway store for tools and tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS nodes (
              id           INTEGER PRIMARY KEY AUTOINCREMENT,
              uuid         TEXT NOT NULL UNIQUE,
              owner_id     TEXT NOT NULL,
              document_id  TEXT NOT NULL,
              created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_versions (
              id             INTEGER PRIMARY KEY AUTOINCREMENT,
              node_id        INTEGER NOT NULL REFERENCES nodes(id),
              manifest_hash  TEXT NOT NULL,
              data_root      TEXT NOT NULL,
              anchor_id      TEXT,            -- set once published
              created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_versions_node ON node_versions(node_id);

            CREATE TABLE IF NOT EXISTS data_references (
              id          INTEGER PRIMARY KEY AUTOINCREMENT,
              node_id     INTEGER NOT NULL REFERENCES nodes(id),
              version_id  INTEGER NOT NULL,
              hash        TEXT NOT NULL,
              root_hash   TEXT NOT NULL,
              path        TEXT NOT NULL,    -- neutralized (root/...)
              name        TEXT NOT NULL,
              size        INTEGER NOT NULL,
              directory   INTEGER NOT NULL,
              root        INTEGER NOT NULL,
              type        TEXT NOT NULL,
              external    INTEGER NOT NULL,
              created_at  TEXT NOT NULL,
              updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_refs_node ON data_references(node_id);
            CREATE INDEX IF NOT EXISTS idx_refs_hash ON data_references(hash);

            CREATE TABLE IF NOT EXISTS public_data_references (
              id          INTEGER PRIMARY KEY AUTOINCREMENT,
              node_id     INTEGER NOT NULL REFERENCES nodes(id),
              version_id  INTEGER NOT NULL REFERENCES node_versions(id),
              hash        TEXT NOT NULL,
              root_hash   TEXT NOT NULL,
              path        TEXT NOT NULL,
              name        TEXT NOT NULL,
              size        INTEGER NOT NULL,
              directory   INTEGER NOT NULL,
              root        INTEGER NOT NULL,
              type        TEXT NOT NULL,
              external    INTEGER NOT NULL,
              created_at  TEXT NOT NULL,
              updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pub_refs_node_version
              ON public_data_references(node_id, version_id);
            CREATE INDEX IF NOT EXISTS idx_pub_refs_hash ON public_data_references(hash);

            CREATE TABLE IF NOT EXISTS cid_prune_list (
              id             INTEGER PRIMARY KEY AUTOINCREMENT,
              hash           TEXT NOT NULL,
              path           TEXT NOT NULL,
              size           INTEGER NOT NULL,
              directory      INTEGER NOT NULL,
              type           TEXT NOT NULL,
              node_id        INTEGER NOT NULL,
              duration_days  INTEGER NOT NULL,
              description    TEXT NOT NULL,
              created_at     TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("reference db lock poisoned"))
    }

    // ---------- nodes ----------

    pub fn create_node(&self, owner_id: &str, document_id: &str) -> Result<Node> {
        let db = self.lock()?;
        let uuid = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        db.execute(
            "INSERT INTO nodes(uuid, owner_id, document_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![uuid, owner_id, document_id, now],
        )?;
        Ok(Node {
            id: db.last_insert_rowid(),
            uuid,
            owner_id: owner_id.to_string(),
            document_id: document_id.to_string(),
            created_at: now,
        })
    }

    pub fn node_by_uuid(&self, uuid: &str) -> Result<Option<Node>> {
        let db = self.lock()?;
        let node = db
            .query_row(
                "SELECT id, uuid, owner_id, document_id, created_at FROM nodes WHERE uuid=?1",
                [uuid],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// All nodes ordered by id (the order batch heals index into).
    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let db = self.lock()?;
        let mut stmt =
            db.prepare("SELECT id, uuid, owner_id, document_id, created_at FROM nodes ORDER BY id")?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    // ---------- versions ----------

    pub fn create_version(
        &self,
        node_id: i64,
        manifest_hash: &str,
        data_root: &str,
        anchor_id: Option<&str>,
    ) -> Result<NodeVersion> {
        let db = self.lock()?;
        let now = Utc::now();
        db.execute(
            "INSERT INTO node_versions(node_id, manifest_hash, data_root, anchor_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![node_id, manifest_hash, data_root, anchor_id, now],
        )?;
        Ok(NodeVersion {
            id: db.last_insert_rowid(),
            node_id,
            manifest_hash: manifest_hash.to_string(),
            data_root: data_root.to_string(),
            anchor_id: anchor_id.map(str::to_string),
            created_at: now,
        })
    }

    pub fn latest_version(&self, node_id: i64) -> Result<Option<NodeVersion>> {
        let db = self.lock()?;
        let v = db
            .query_row(
                "SELECT id, node_id, manifest_hash, data_root, anchor_id, created_at
                 FROM node_versions WHERE node_id=?1 ORDER BY id DESC LIMIT 1",
                [node_id],
                version_from_row,
            )
            .optional()?;
        Ok(v)
    }

    /// Versions of a node, oldest first.
    pub fn versions(&self, node_id: i64) -> Result<Vec<NodeVersion>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, node_id, manifest_hash, data_root, anchor_id, created_at
             FROM node_versions WHERE node_id=?1 ORDER BY id",
        )?;
        let versions = stmt
            .query_map([node_id], version_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    pub fn version_by_manifest_hash(
        &self,
        node_id: i64,
        manifest_hash: &str,
    ) -> Result<Option<NodeVersion>> {
        let db = self.lock()?;
        let v = db
            .query_row(
                "SELECT id, node_id, manifest_hash, data_root, anchor_id, created_at
                 FROM node_versions WHERE node_id=?1 AND manifest_hash=?2
                 ORDER BY anchor_id IS NULL, id DESC LIMIT 1",
                params![node_id, manifest_hash],
                version_from_row,
            )
            .optional()?;
        Ok(v)
    }

    // ---------- reference rows ----------

    /// Rows of `node_id` in `scope`; `version_id = None` lists every version.
    pub fn list_references(
        &self,
        scope: RefScope,
        node_id: i64,
        version_id: Option<i64>,
    ) -> Result<Vec<ReferenceRow>> {
        let db = self.lock()?;
        let rows = match version_id {
            Some(v) => {
                let sql = format!(
                    "SELECT {ROW_COLUMNS} FROM {} WHERE node_id=?1 AND version_id=?2 ORDER BY path",
                    scope.table()
                );
                let mut stmt = db.prepare(&sql)?;
                stmt.query_map(params![node_id, v], reference_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {ROW_COLUMNS} FROM {} WHERE node_id=?1 ORDER BY path",
                    scope.table()
                );
                let mut stmt = db.prepare(&sql)?;
                stmt.query_map([node_id], reference_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    /// Node that logically owns `hash`, when that is not `node_id`.
    ///
    /// Ownership goes to the earliest claim in the draft index: the node whose
    /// oldest row for the hash was created first, lowest node id on a tie. The
    /// `external` flag of existing rows does not take part.
    pub fn owner_of_hash(&self, hash: &str, node_id: i64) -> Result<Option<i64>> {
        let db = self.lock()?;
        let owner = db
            .query_row(
                "SELECT node_id FROM data_references WHERE hash=?1
                 GROUP BY node_id
                 ORDER BY MIN(created_at), node_id LIMIT 1",
                [hash],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        Ok(owner.filter(|owner| *owner != node_id))
    }

    pub fn create_many(&self, scope: RefScope, rows: &[ReferenceRow]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        insert_rows(&tx, scope, rows)?;
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn delete_many(&self, scope: RefScope, ids: &[i64]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let n = delete_rows(&tx, scope, ids)?;
        tx.commit()?;
        Ok(n)
    }

    /// Rewrite every mutable column of the given rows (matched by `id`).
    pub fn update_many(&self, scope: RefScope, rows: &[ReferenceRow]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let n = update_rows(&tx, scope, rows)?;
        tx.commit()?;
        Ok(n)
    }

    /// Apply a heal in one transaction: inserts, updates, then orphans moved
    /// to the prune ledger and deleted.
    pub fn apply_heal(&self, scope: RefScope, write: &HealWrite) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        insert_rows(&tx, scope, &write.insert)?;
        update_rows(&tx, scope, &write.update)?;
        prune_rows(&tx, scope, &write.prune, write.prune_duration_days, &write.prune_description)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert `inserts`, update `updates` and run `gate` inside one transaction.
    ///
    /// The row writes are committed only when `gate` returns `Ok`; any error
    /// (from the writes or from `gate`) rolls everything back.
    pub fn rewrite_references<T, E, F>(
        &self,
        scope: RefScope,
        inserts: &[ReferenceRow],
        updates: &[ReferenceRow],
        gate: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        let mut db = self.lock().map_err(E::from)?;
        let tx = db.transaction().map_err(|e| E::from(anyhow::Error::from(e)))?;
        insert_rows(&tx, scope, inserts).map_err(E::from)?;
        update_rows(&tx, scope, updates).map_err(E::from)?;
        let out = gate()?;
        tx.commit().map_err(|e| E::from(anyhow::Error::from(e)))?;
        Ok(out)
    }

    pub fn prune_list(&self, node_id: i64) -> Result<Vec<PruneEntry>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, hash, path, size, directory, type, node_id, duration_days, description, created_at
             FROM cid_prune_list WHERE node_id=?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map([node_id], |r| {
                Ok(PruneEntry {
                    id: r.get(0)?,
                    hash: r.get(1)?,
                    path: r.get(2)?,
                    size: r.get::<_, i64>(3)? as u64,
                    directory: r.get(4)?,
                    kind: parse_kind(&r.get::<_, String>(5)?),
                    node_id: r.get(6)?,
                    duration_days: r.get(7)?,
                    description: r.get(8)?,
                    created_at: r.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

fn insert_rows(tx: &Transaction<'_>, scope: RefScope, rows: &[ReferenceRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "INSERT INTO {}(node_id, version_id, hash, root_hash, path, name, size, directory, root,
                        type, external, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        scope.table()
    );
    let mut stmt = tx.prepare(&sql)?;
    for r in rows {
        stmt.execute(params![
            r.node_id,
            r.version_id,
            r.hash,
            r.root_hash,
            r.path,
            r.name,
            r.size as i64,
            r.directory,
            r.root,
            r.kind.as_str(),
            r.external,
            r.created_at,
            r.updated_at,
        ])?;
    }
    Ok(())
}

fn update_rows(tx: &Transaction<'_>, scope: RefScope, rows: &[ReferenceRow]) -> Result<usize> {
    let sql = format!(
        "UPDATE {} SET version_id=?1, hash=?2, root_hash=?3, path=?4, name=?5, size=?6,
                       directory=?7, root=?8, type=?9, external=?10, updated_at=?11
         WHERE id=?12",
        scope.table()
    );
    let mut stmt = tx.prepare(&sql)?;
    let now = Utc::now();
    let mut n = 0;
    for r in rows {
        let id = r.id.ok_or_else(|| anyhow!("cannot update unsaved row at {}", r.path))?;
        n += stmt.execute(params![
            r.version_id,
            r.hash,
            r.root_hash,
            r.path,
            r.name,
            r.size as i64,
            r.directory,
            r.root,
            r.kind.as_str(),
            r.external,
            now,
            id,
        ])?;
    }
    Ok(n)
}

fn delete_rows(tx: &Transaction<'_>, scope: RefScope, ids: &[i64]) -> Result<usize> {
    let sql = format!("DELETE FROM {} WHERE id=?1", scope.table());
    let mut stmt = tx.prepare(&sql)?;
    let mut n = 0;
    for id in ids {
        n += stmt.execute([id])?;
    }
    Ok(n)
}

fn prune_rows(
    tx: &Transaction<'_>,
    scope: RefScope,
    rows: &[ReferenceRow],
    duration_days: u32,
    description: &str,
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let now = Utc::now();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO cid_prune_list(hash, path, size, directory, type, node_id,
                                        duration_days, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for r in rows {
            stmt.execute(params![
                r.hash,
                r.path,
                r.size as i64,
                r.directory,
                r.kind.as_str(),
                r.node_id,
                duration_days,
                description,
                now,
            ])?;
        }
    }
    let ids: Vec<i64> = rows.iter().filter_map(|r| r.id).collect();
    delete_rows(tx, scope, &ids)
}

fn parse_kind(s: &str) -> ComponentKind {
    ComponentKind::parse(s).unwrap_or(ComponentKind::Unknown)
}

fn node_from_row(r: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: r.get(0)?,
        uuid: r.get(1)?,
        owner_id: r.get(2)?,
        document_id: r.get(3)?,
        created_at: r.get(4)?,
    })
}

fn version_from_row(r: &Row<'_>) -> rusqlite::Result<NodeVersion> {
    Ok(NodeVersion {
        id: r.get(0)?,
        node_id: r.get(1)?,
        manifest_hash: r.get(2)?,
        data_root: r.get(3)?,
        anchor_id: r.get(4)?,
        created_at: r.get(5)?,
    })
}

fn reference_from_row(r: &Row<'_>) -> rusqlite::Result<ReferenceRow> {
    Ok(ReferenceRow {
        id: Some(r.get(0)?),
        node_id: r.get(1)?,
        version_id: r.get(2)?,
        hash: r.get(3)?,
        root_hash: r.get(4)?,
        path: r.get(5)?,
        name: r.get(6)?,
        size: r.get::<_, i64>(7)? as u64,
        directory: r.get(8)?,
        root: r.get(9)?,
        kind: parse_kind(&r.get::<_, String>(10)?),
        external: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}
