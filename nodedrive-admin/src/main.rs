use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use nodedrive_core::commands::{Commands, ensure_initialized, ensure_initialized_at};
use nodedrive_core::manifest::ManifestAction;

#[derive(Parser)]
#[command(
    name = "nodedrive-admin",
    about = "Maintenance tools for nodedrive manifests, drives and reference rows"
)]
struct Cli {
    /// Workspace root (defaults to `.nodedrive`)
    #[arg(long, env = "NODEDRIVE_ROOT")]
    root: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the workspace skeleton and default config.toml
    Init,
    /// Create a node whose drive holds the files under --dir
    CreateNode {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List every node in id order (the order heal-all ranges index into)
    Nodes,
    /// Store the files under --dir as a drive and print its root hash
    PutTree {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Dispatch manifest actions read from a JSON file (object or array)
    Dispatch {
        #[arg(long)]
        node: String,
        #[arg(long)]
        actions: PathBuf,
    },
    /// Write the files under --dir into a node's drive (replacing same-named files)
    AddFiles {
        #[arg(long)]
        node: String,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Remove a drive entry (and everything beneath it) from a node
    Remove {
        #[arg(long)]
        node: String,
        #[arg(long)]
        path: String,
    },
    /// Publish the node's current manifest under an anchor id
    Publish {
        #[arg(long)]
        node: String,
        #[arg(long)]
        anchor: String,
    },
    /// Print the annotated drive of a node
    Tree {
        #[arg(long)]
        node: String,
    },
    /// Report reference discrepancies of a node without touching them
    Validate {
        #[arg(long)]
        node: String,
    },
    /// Repair the draft reference rows of a node
    Heal {
        #[arg(long)]
        node: String,
    },
    /// Heal every node, optionally restricted to [start, end)
    HealAll {
        #[arg(long)]
        start: Option<usize>,
        #[arg(long)]
        end: Option<usize>,
    },
    /// Backfill public rows for every published version of a node
    HealHistory {
        #[arg(long)]
        node: String,
    },
    /// Rename a drive entry within its directory
    Rename {
        #[arg(long)]
        node: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        name: String,
    },
    /// Move a drive entry to a new path
    Move {
        #[arg(long)]
        node: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Cmd::Init = cli.cmd {
        let report = match &cli.root {
            Some(root) => ensure_initialized_at(root)?,
            None => ensure_initialized()?,
        };
        println!(
            "initialized {} (created {}, existing {})",
            report.root.display(),
            report.created.len(),
            report.existed.len()
        );
        return Ok(());
    }

    let cmds = match &cli.root {
        Some(root) => Commands::open(root)?,
        None => Commands::from_env()?,
    };
    match cli.cmd {
        Cmd::Init => Ok(()),
        Cmd::CreateNode { owner, title, dir } => {
            let files = match dir {
                Some(d) => read_files(&d)?,
                None => Vec::new(),
            };
            let borrowed = as_pairs(&files);
            print_json(&cmds.create_node(&owner, &title, &borrowed)?)
        }
        Cmd::Nodes => print_json(&cmds.list_nodes()?),
        Cmd::PutTree { dir } => {
            let files = read_files(&dir)?;
            let root = cmds.content().put_tree(&as_pairs(&files))?;
            println!("{root}");
            Ok(())
        }
        Cmd::Dispatch { node, actions } => {
            let text = fs::read_to_string(&actions)
                .with_context(|| format!("reading actions file {}", actions.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing actions file {}", actions.display()))?;
            let parsed = ManifestAction::list_from_json(value)?;
            match cmds.dispatch(&node, &parsed)? {
                Some(doc) => print_json(&doc),
                None => anyhow::bail!("document for node {node} is not ready; retry later"),
            }
        }
        Cmd::AddFiles { node, dir } => {
            let files = read_files(&dir)?;
            print_json(&cmds.add_files(&node, &as_pairs(&files))?)
        }
        Cmd::Remove { node, path } => print_json(&cmds.remove_path(&node, &path)?),
        Cmd::Publish { node, anchor } => print_json(&cmds.publish(&node, &anchor)?),
        Cmd::Tree { node } => print_json(&cmds.tree(&node)?),
        Cmd::Validate { node } => print_json(&cmds.validate(&node)?),
        Cmd::Heal { node } => print_json(&cmds.heal(&node)?),
        Cmd::HealAll { start, end } => {
            let cancel = install_cancel_flag()?;
            let summary = cmds.heal_all(start, end, &cancel)?;
            if summary.cancelled {
                tracing::warn!(healed = summary.healed.len(), "heal-all interrupted");
            }
            if !summary.failed.is_empty() {
                tracing::warn!(failed = summary.failed.len(), "some nodes failed to heal");
            }
            print_json(&summary)
        }
        Cmd::HealHistory { node } => print_json(&cmds.heal_public_history(&node)?),
        Cmd::Rename { node, path, name } => print_json(&cmds.rename(&node, &path, &name)?),
        Cmd::Move { node, from, to } => print_json(&cmds.move_path(&node, &from, &to)?),
    }
}

/// Flag raised by the first SIGINT/SIGTERM; the sweep stops at the next node.
/// A second signal exits immediately.
fn install_cancel_flag() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(sig, 130, Arc::clone(&cancel))
            .with_context(|| format!("installing shutdown handler for signal {sig}"))?;
        signal_hook::flag::register(sig, Arc::clone(&cancel))
            .with_context(|| format!("installing cancel handler for signal {sig}"))?;
    }
    Ok(cancel)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Every regular file under `dir` as (drive path relative to `dir`, bytes).
fn read_files(dir: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let bytes = fs::read(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        out.push((rel, bytes));
    }
    Ok(out)
}

fn as_pairs(files: &[(String, Vec<u8>)]) -> Vec<(&str, &[u8])> {
    files
        .iter()
        .map(|(p, b)| (p.as_str(), b.as_slice()))
        .collect()
}
