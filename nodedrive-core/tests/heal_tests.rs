use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use nodedrive_core::DriveError;
use nodedrive_core::commands::Commands;
use nodedrive_core::services::indexer::{Indexer, PublishedVersion};
use nodedrive_core::services::references::{RefScope, ReferenceRow};

fn paper_files() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("a.txt", b"alpha".as_slice()),
        ("docs/notes.md", b"# notes".as_slice()),
        ("docs/paper.pdf", b"%PDF-1.7".as_slice()),
    ]
}

fn rows_by_path(cmds: &Commands, scope: RefScope, node_id: i64) -> Result<BTreeMap<String, ReferenceRow>> {
    Ok(cmds
        .references()
        .list_references(scope, node_id, None)?
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect())
}

#[test]
fn heal_converges_after_rows_go_missing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    let node = cmds.create_node("owner-1", "Paper", &paper_files())?;

    let rows = rows_by_path(&cmds, RefScope::Private, node.id)?;
    let paths: Vec<&str> = rows.keys().map(String::as_str).collect();
    assert_eq!(
        paths,
        vec!["root", "root/a.txt", "root/docs", "root/docs/notes.md", "root/docs/paper.pdf"]
    );
    assert!(rows["root"].root);
    assert!(rows["root/docs"].directory);
    assert!(cmds.validate(&node.uuid)?.is_clean());

    let doomed: Vec<i64> = ["root/a.txt", "root/docs"]
        .iter()
        .filter_map(|p| rows[*p].id)
        .collect();
    cmds.references().delete_many(RefScope::Private, &doomed)?;

    let report = cmds.validate(&node.uuid)?;
    assert_eq!(report.missing.len(), 2);
    assert!(report.orphaned.is_empty());

    let healed = cmds.heal(&node.uuid)?;
    assert_eq!(healed.inserted, 2);
    assert_eq!(healed.pruned, 0);
    assert!(cmds.validate(&node.uuid)?.is_clean());

    // a second heal has nothing left to do
    let again = cmds.heal(&node.uuid)?;
    assert_eq!((again.inserted, again.pruned, again.updated), (0, 0, 0));
    Ok(())
}

#[test]
fn orphaned_and_duplicate_rows_move_to_the_prune_ledger() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    let node = cmds.create_node("owner-1", "Paper", &paper_files())?;
    let rows = rows_by_path(&cmds, RefScope::Private, node.id)?;

    let mut ghost = rows["root/a.txt"].clone();
    ghost.id = None;
    ghost.path = "root/ghost.txt".into();
    ghost.name = "ghost.txt".into();
    let mut duplicate = rows["root/docs/notes.md"].clone();
    duplicate.id = None;
    cmds.references()
        .create_many(RefScope::Private, &[ghost, duplicate])?;

    let report = cmds.validate(&node.uuid)?;
    assert!(report.missing.is_empty());
    assert_eq!(report.orphaned.len(), 2);

    let healed = cmds.heal(&node.uuid)?;
    assert_eq!(healed.pruned, 2);
    assert!(cmds.validate(&node.uuid)?.is_clean());

    let after = cmds
        .references()
        .list_references(RefScope::Private, node.id, None)?;
    assert_eq!(after.len(), 5);
    assert_eq!(after.iter().filter(|r| r.path == "root/docs/notes.md").count(), 1);

    let ledger = cmds.references().prune_list(node.id)?;
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().any(|e| e.path == "root/ghost.txt"));
    assert!(ledger.iter().all(|e| e.duration_days == 30));
    Ok(())
}

#[test]
fn removing_a_directory_prunes_its_rows() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    let node = cmds.create_node("owner-1", "Paper", &paper_files())?;

    let doc = cmds.remove_path(&node.uuid, "/root/docs")?;
    assert!(doc.data_root().is_some());

    let rows = rows_by_path(&cmds, RefScope::Private, node.id)?;
    assert_eq!(rows.keys().cloned().collect::<Vec<_>>(), vec!["root", "root/a.txt"]);

    let mut pruned: Vec<String> = cmds
        .references()
        .prune_list(node.id)?
        .into_iter()
        .map(|e| e.path)
        .collect();
    pruned.sort();
    assert!(pruned.contains(&"root/docs".to_string()));
    assert!(pruned.contains(&"root/docs/notes.md".to_string()));
    assert!(pruned.contains(&"root/docs/paper.pdf".to_string()));

    let err = cmds.remove_path(&node.uuid, "root/docs").expect_err("already gone");
    assert!(matches!(err, DriveError::PathNotFound(_)));
    Ok(())
}

#[test]
fn mark_externals_flags_content_owned_by_another_node() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    fs::write(
        tmp.path().join("config.toml"),
        "[heal]\nmark_externals = true\nprune_duration_days = 7\n",
    )?;
    let cmds = Commands::open(tmp.path())?;
    assert!(cmds.config().heal.mark_externals);

    let owner = cmds.create_node("owner-1", "Source", &[("shared.csv", b"1,2,3\n".as_slice())])?;
    let borrower = cmds.create_node(
        "owner-2",
        "Reuse",
        &[
            ("shared.csv", b"1,2,3\n".as_slice()),
            ("mine.txt", b"local".as_slice()),
        ],
    )?;

    let owned = rows_by_path(&cmds, RefScope::Private, owner.id)?;
    assert!(!owned["root/shared.csv"].external);

    let borrowed = rows_by_path(&cmds, RefScope::Private, borrower.id)?;
    assert!(borrowed["root/shared.csv"].external);
    assert!(!borrowed["root/mine.txt"].external);
    assert!(!borrowed["root"].external);

    // the owner's flag does not flip once the borrower exists
    let healed = cmds.heal(&owner.uuid)?;
    assert_eq!(healed.updated, 0);
    assert!(cmds.validate(&owner.uuid)?.is_clean());
    Ok(())
}

#[test]
fn heal_all_survives_a_broken_node_and_honours_cancel() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    cmds.create_node("owner-1", "One", &paper_files())?;
    // a node whose manifest document never existed
    let broken = cmds.references().create_node("owner-2", "missing-document")?;
    cmds.create_node("owner-3", "Three", &[("x.bin", b"x".as_slice())])?;

    let summary = cmds.heal_all(None, None, &AtomicBool::new(false))?;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.healed.len(), 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].node, broken.uuid);
    assert!(!summary.cancelled);

    let ranged = cmds.heal_all(Some(1), Some(2), &AtomicBool::new(false))?;
    assert_eq!(ranged.total, 1);
    assert_eq!(ranged.failed.len(), 1);

    let cancelled = cmds.heal_all(None, None, &AtomicBool::new(true))?;
    assert!(cancelled.cancelled);
    assert!(cancelled.healed.is_empty());

    let logbook = fs::read_to_string(cmds.root().join("logbook.jsonl"))?;
    assert_eq!(logbook.lines().filter(|l| l.contains("\"heal_all\"")).count(), 3);
    Ok(())
}

#[test]
fn publish_writes_public_rows_and_annotates_the_tree() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    let node = cmds.create_node("owner-1", "Paper", &paper_files())?;

    let before = cmds.tree(&node.uuid)?;
    assert!(!before.published);

    let version = cmds.publish(&node.uuid, "anchor-1")?;
    assert_eq!(version.anchor_id.as_deref(), Some("anchor-1"));
    let public = cmds
        .references()
        .list_references(RefScope::Public, node.id, Some(version.id))?;
    assert_eq!(public.len(), 5);

    let tree = cmds.tree(&node.uuid)?;
    assert!(tree.published);
    let paper = tree
        .children
        .iter()
        .find(|c| c.name == "docs")
        .and_then(|d| d.children.iter().find(|c| c.name == "paper.pdf"))
        .expect("paper.pdf listed");
    assert!(paper.published);
    assert!(paper.last_modified.is_some());

    let err = cmds.publish(&node.uuid, "anchor-again").expect_err("same manifest");
    assert!(err.to_string().contains("already published"));
    Ok(())
}

#[test]
fn public_history_backfills_and_registers_versions() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    let node = cmds.create_node("owner-1", "Paper", &paper_files())?;
    let v1 = cmds.publish(&node.uuid, "anchor-1")?;

    // lose the public rows of v1
    let ids: Vec<i64> = cmds
        .references()
        .list_references(RefScope::Public, node.id, Some(v1.id))?
        .into_iter()
        .filter_map(|r| r.id)
        .collect();
    cmds.references().delete_many(RefScope::Public, &ids)?;

    // a second version the indexer knows about but the registry does not
    let manifest = cmds.add_files(&node.uuid, &[("c.txt", b"gamma".as_slice())])?;
    let hash = cmds.content().put_blob(&serde_json::to_vec(&manifest)?)?;
    cmds.indexer().record(
        &node.uuid,
        PublishedVersion {
            manifest_hash: hash.clone(),
            anchor_id: "anchor-2".into(),
            time: None,
        },
    )?;

    let reports = cmds.heal_public_history(&node.uuid)?;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].version_id, v1.id);
    assert_eq!(reports[0].inserted, 5);
    assert_eq!(reports[1].inserted, 6);
    assert!(reports.iter().all(|r| r.scope == RefScope::Public));

    let v2 = cmds
        .references()
        .version_by_manifest_hash(node.id, &hash)?
        .expect("registered");
    assert_eq!(v2.anchor_id.as_deref(), Some("anchor-2"));

    // running it again is a no-op
    let rerun = cmds.heal_public_history(&node.uuid)?;
    assert!(rerun.iter().all(|r| r.inserted == 0 && r.pruned == 0));
    assert_eq!(cmds.references().versions(node.id)?.len(), 3);
    Ok(())
}

#[test]
fn published_history_outlives_the_process() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (uuid, version) = {
        let cmds = Commands::open(tmp.path())?;
        let node = cmds.create_node("owner-1", "Paper", &paper_files())?;
        let version = cmds.publish(&node.uuid, "anchor-1")?;
        (node.uuid, version)
    };

    let cmds = Commands::open(tmp.path())?;
    let history = cmds.indexer().history(&uuid)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].anchor_id, "anchor-1");
    assert_eq!(history[0].manifest_hash, version.manifest_hash);

    let reports = cmds.heal_public_history(&uuid)?;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].version_id, version.id);
    assert_eq!((reports[0].inserted, reports[0].pruned), (0, 0));
    Ok(())
}

#[test]
fn late_external_sweep_flags_the_borrower_and_default_mode_stays_clean() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (owner, borrower) = {
        let cmds = Commands::open(tmp.path())?;
        assert!(!cmds.config().heal.mark_externals);
        let owner = cmds.create_node("owner-1", "Source", &[("shared.csv", b"1,2,3\n".as_slice())])?;
        let borrower = cmds.create_node(
            "owner-2",
            "Reuse",
            &[
                ("copy.csv", b"1,2,3\n".as_slice()),
                ("mine.txt", b"local".as_slice()),
            ],
        )?;
        (owner, borrower)
    };

    fs::write(tmp.path().join("config.toml"), "[heal]\nmark_externals = true\n")?;
    {
        let cmds = Commands::open(tmp.path())?;
        let summary = cmds.heal_all(None, None, &AtomicBool::new(false))?;
        assert!(summary.failed.is_empty());

        assert!(!rows_by_path(&cmds, RefScope::Private, owner.id)?["root/shared.csv"].external);
        let borrowed = rows_by_path(&cmds, RefScope::Private, borrower.id)?;
        assert!(borrowed["root/copy.csv"].external);
        assert!(!borrowed["root/mine.txt"].external);

        // the flags are stable under a second sweep
        let again = cmds.heal_all(None, None, &AtomicBool::new(false))?;
        assert!(again.healed.iter().all(|r| r.updated == 0));
    }

    fs::write(tmp.path().join("config.toml"), "[heal]\nmark_externals = false\n")?;
    let cmds = Commands::open(tmp.path())?;
    assert!(cmds.validate(&owner.uuid)?.is_clean());
    assert!(cmds.validate(&borrower.uuid)?.is_clean());
    let healed = cmds.heal(&borrower.uuid)?;
    assert_eq!((healed.updated, healed.drift_reported), (0, 0));

    // a rename outside the sweep keeps the recorded flag
    cmds.rename(&borrower.uuid, "root/copy.csv", "reused.csv")?;
    assert!(rows_by_path(&cmds, RefScope::Private, borrower.id)?["root/reused.csv"].external);
    assert!(cmds.validate(&borrower.uuid)?.is_clean());
    Ok(())
}
