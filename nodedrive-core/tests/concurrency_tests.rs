use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use nodedrive_core::commands::Commands;
use nodedrive_core::drive::NodeLocks;
use nodedrive_core::services::references::RefScope;

#[test]
fn same_node_sections_never_overlap() {
    let locks = NodeLocks::new();
    let inside = AtomicUsize::new(0);
    let overlaps = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..20 {
                    locks
                        .with_node(7, || {
                            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .expect("section");
                }
            });
        }
    });
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn different_nodes_do_not_block_each_other() {
    let locks = NodeLocks::new();
    let out = locks
        .with_node(1, || locks.with_node(2, || Ok("nested")))
        .expect("nested sections on distinct nodes");
    assert_eq!(out, "nested");
}

#[test]
fn heals_interleaved_with_renames_never_prune_renamed_rows() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cmds = Commands::open(tmp.path())?;
    let node = cmds.create_node(
        "owner-1",
        "Paper",
        &[
            ("docs/notes.md", b"# notes".as_slice()),
            ("other.txt", b"other".as_slice()),
        ],
    )?;
    let original = cmds
        .references()
        .list_references(RefScope::Private, node.id, None)?
        .into_iter()
        .find(|r| r.path == "root/other.txt")
        .and_then(|r| r.id);

    thread::scope(|s| {
        let renamer = s.spawn(|| -> Result<()> {
            for i in 0..12 {
                let (from, to) = if i % 2 == 0 {
                    ("root/other.txt", "renamed.txt")
                } else {
                    ("root/renamed.txt", "other.txt")
                };
                cmds.rename(&node.uuid, from, to)?;
            }
            Ok(())
        });
        let healer = s.spawn(|| -> Result<()> {
            for _ in 0..12 {
                let report = cmds.heal(&node.uuid)?;
                assert_eq!((report.inserted, report.pruned), (0, 0));
            }
            Ok(())
        });
        renamer.join().expect("renamer thread")?;
        healer.join().expect("healer thread")
    })?;

    assert!(cmds.references().prune_list(node.id)?.is_empty());
    let rows = cmds
        .references()
        .list_references(RefScope::Private, node.id, None)?;
    let other = rows.iter().find(|r| r.path == "root/other.txt").expect("row back in place");
    assert_eq!(other.id, original);
    assert!(cmds.validate(&node.uuid)?.is_clean());
    Ok(())
}
