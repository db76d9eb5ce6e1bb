// src/utils/logbook.rs
use anyhow::Result;
use serde_json::Value;
use std::{fs, io::Write, path::Path};

/// Append one `{timestamp, event, data}` line to `<base>/logbook.jsonl`.
pub fn emit_event(base: &Path, event: &str, data: Value, ts: &str) -> Result<()> {
    fs::create_dir_all(base)?;
    let log_path = base.join("logbook.jsonl");
    let line = serde_json::json!({
        "timestamp": ts,
        "event": event,
        "data": data
    });
    let json = serde_json::to_string(&line)?;
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(f, "{}", json)?;
    Ok(())
}
