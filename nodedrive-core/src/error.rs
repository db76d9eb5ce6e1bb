// src/error.rs
//! Error taxonomy surfaced by the dispatcher, healer and rename pipeline.
//!
//! - `NotReady` and `Collision` are recoverable and returned to the caller as-is.
//! - `IntegrityGap` aborts the enclosing operation for that node.
//! - `UnknownAction` is a programming error; it must never be swallowed.
//! - Collaborator internals speak `anyhow` and land in `Other`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("document {0} is not ready")]
    NotReady(String),

    #[error("path already exists: {path}")]
    Collision { path: String },

    #[error("node {node} has incomplete reference history: no existing row for {path}")]
    IntegrityGap { node: String, path: String },

    #[error("unknown manifest action: {0}")]
    UnknownAction(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("manifest for node {0} has no data bucket")]
    MissingDataBucket(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriveError {
    /// True for conditions a caller should retry after re-fetching state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriveError::NotReady(_))
    }

    /// True for conditions the end user can fix (pick another name, etc.).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            DriveError::Collision { .. } | DriveError::InvalidPath(_) | DriveError::PathNotFound(_)
        )
    }
}

pub type DriveResult<T> = Result<T, DriveError>;
