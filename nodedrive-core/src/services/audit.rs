//! services/audit.rs
//! Action logbook: one JSON line per dispatch, heal, prune or rename.
//!
//! - Writes `actions.jsonl` under the logbook directory installed at startup.
//! - Best effort: a missing or unwritable logbook never fails the caller.

use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

static LOGBOOK_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Point the audit log at `dir` (first caller wins; later calls are ignored).
pub fn install(dir: &Path) {
    if LOGBOOK_DIR.set(dir.to_path_buf()).is_ok() {
        let _ = fs::create_dir_all(dir);
        tracing::debug!(dir = %dir.display(), "audit logbook installed");
    }
}

/// Record a generic action event.
///
/// # Arguments
/// * `agent`: Logical component name (e.g., `"dispatcher"`, `"healer"`).
/// * `action`: Short verb label (e.g., `"dispatch_committed"`, `"heal_applied"`).
/// * `details`: Arbitrary JSON payload (node, paths, counts, ...).
/// * `severity`: `"low" | "medium" | "high"`, for quick triage.
pub fn record_action(agent: &str, action: &str, details: &Value, severity: &str) {
    let Some(dir) = LOGBOOK_DIR.get() else {
        return;
    };
    let entry = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "event": "action",
        "agent": agent,
        "action": action,
        "severity": severity,
        "details": details
    });
    append_jsonl(dir.join("actions.jsonl"), &entry);
}

fn append_jsonl<P: AsRef<Path>, S: Serialize>(path: P, val: &S) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let Ok(line) = serde_json::to_string(val) else {
        return;
    };
    match fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut f) => {
            let _ = writeln!(f, "{}", line);
        }
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "audit append failed"),
    }
}
