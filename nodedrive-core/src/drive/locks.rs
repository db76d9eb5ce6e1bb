// src/drive/locks.rs
//! Per-node critical sections.
//!
//! Anything that reads a node's manifest and tree and then rewrites its draft
//! rows (rename, move, heal, drive edits) runs inside [`NodeLocks::with_node`],
//! so a heal never prunes against a snapshot a concurrent rename has replaced.
//! Locks are not reentrant.

use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::DriveResult;

#[derive(Default)]
pub struct NodeLocks {
    table: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock of `node_id`.
    pub fn with_node<T>(&self, node_id: i64, f: impl FnOnce() -> DriveResult<T>) -> DriveResult<T> {
        let lock = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| anyhow!("node lock table poisoned"))?;
            table.entry(node_id).or_default().clone()
        };
        let _guard = lock
            .lock()
            .map_err(|_| anyhow!("lock for node {node_id} poisoned"))?;
        f()
    }
}
