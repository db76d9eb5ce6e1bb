use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};

use nodedrive_core::manifest::ComponentKind;
use nodedrive_core::services::references::{HealWrite, RefScope, ReferenceRow, ReferenceStore};

fn row(node_id: i64, version_id: i64, path: &str, hash: &str) -> ReferenceRow {
    let now = Utc::now();
    ReferenceRow {
        id: None,
        node_id,
        version_id,
        hash: hash.to_string(),
        root_hash: "r0".into(),
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        size: 10,
        directory: false,
        root: false,
        kind: ComponentKind::Data,
        external: false,
        created_at: now,
        updated_at: now,
    }
}

#[test]
fn bulk_writes_round_trip_through_sqlite() -> Result<()> {
    let store = ReferenceStore::open_in_memory()?;
    let node = store.create_node("owner", "doc-1")?;
    let v = store.create_version(node.id, "m1", "r0", None)?;

    store.create_many(
        RefScope::Private,
        &[row(node.id, v.id, "root/a.csv", "h1"), row(node.id, v.id, "root/b.csv", "h2")],
    )?;
    let mut rows = store.list_references(RefScope::Private, node.id, None)?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.id.is_some() && r.kind == ComponentKind::Data));

    rows[0].size = 99;
    rows[0].kind = ComponentKind::Code;
    assert_eq!(store.update_many(RefScope::Private, &rows[..1])?, 1);
    let updated = store.list_references(RefScope::Private, node.id, Some(v.id))?;
    assert_eq!(updated[0].size, 99);
    assert_eq!(updated[0].kind, ComponentKind::Code);
    assert!(updated[0].updated_at >= rows[0].updated_at);

    // unsaved rows cannot be updated
    assert!(store.update_many(RefScope::Private, &[row(node.id, v.id, "root/c.csv", "h3")]).is_err());

    let ids: Vec<i64> = updated.iter().filter_map(|r| r.id).collect();
    assert_eq!(store.delete_many(RefScope::Private, &ids)?, 2);
    assert!(store.list_references(RefScope::Private, node.id, None)?.is_empty());
    Ok(())
}

#[test]
fn scopes_are_separate_tables() -> Result<()> {
    let store = ReferenceStore::open_in_memory()?;
    let node = store.create_node("owner", "doc-1")?;
    let draft = store.create_version(node.id, "m1", "r0", None)?;
    let published = store.create_version(node.id, "m1", "r0", Some("anchor-1"))?;

    store.create_many(RefScope::Public, &[row(node.id, published.id, "root/a.csv", "h1")])?;
    assert!(store.list_references(RefScope::Private, node.id, None)?.is_empty());
    assert_eq!(store.list_references(RefScope::Public, node.id, Some(published.id))?.len(), 1);
    assert!(store.list_references(RefScope::Public, node.id, Some(draft.id))?.is_empty());

    // the anchored version wins a shared manifest hash
    let found = store.version_by_manifest_hash(node.id, "m1")?.ok_or_else(|| anyhow!("version"))?;
    assert_eq!(found.id, published.id);
    assert_eq!(store.latest_version(node.id)?.map(|v| v.id), Some(published.id));
    assert_eq!(store.versions(node.id)?.len(), 2);
    Ok(())
}

#[test]
fn apply_heal_moves_orphans_into_the_ledger() -> Result<()> {
    let store = ReferenceStore::open_in_memory()?;
    let node = store.create_node("owner", "doc-1")?;
    let v = store.create_version(node.id, "m1", "r0", None)?;
    store.create_many(RefScope::Private, &[row(node.id, v.id, "root/stale.csv", "h9")])?;
    let stale = store.list_references(RefScope::Private, node.id, None)?;

    store.apply_heal(
        RefScope::Private,
        &HealWrite {
            insert: vec![row(node.id, v.id, "root/fresh.csv", "h1")],
            update: Vec::new(),
            prune: stale,
            prune_duration_days: 14,
            prune_description: "orphaned private reference".into(),
        },
    )?;

    let rows = store.list_references(RefScope::Private, node.id, None)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, "root/fresh.csv");

    let ledger = store.prune_list(node.id)?;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].path, "root/stale.csv");
    assert_eq!(ledger[0].hash, "h9");
    assert_eq!(ledger[0].duration_days, 14);
    assert_eq!(ledger[0].kind, ComponentKind::Data);
    Ok(())
}

#[test]
fn failed_gate_rolls_back_row_rewrites() -> Result<()> {
    let store = ReferenceStore::open_in_memory()?;
    let node = store.create_node("owner", "doc-1")?;
    let v = store.create_version(node.id, "m1", "r0", None)?;
    store.create_many(RefScope::Private, &[row(node.id, v.id, "root/a.csv", "h1")])?;
    let mut moved = store.list_references(RefScope::Private, node.id, None)?;
    moved[0].path = "root/b.csv".into();

    let res: Result<()> = store.rewrite_references(
        RefScope::Private,
        &[row(node.id, v.id, "root/dir", "d1")],
        &moved,
        || Err(anyhow!("document not ready")),
    );
    assert!(res.is_err());
    let rows = store.list_references(RefScope::Private, node.id, None)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, "root/a.csv");

    let committed: Result<&str> =
        store.rewrite_references(RefScope::Private, &[], &moved, || Ok("committed"));
    assert_eq!(committed?, "committed");
    let rows = store.list_references(RefScope::Private, node.id, None)?;
    assert_eq!(rows[0].path, "root/b.csv");
    assert_eq!(rows[0].id, moved[0].id);
    Ok(())
}

#[test]
fn ownership_goes_to_the_earliest_claim() -> Result<()> {
    let store = ReferenceStore::open_in_memory()?;
    let a = store.create_node("owner-a", "doc-a")?;
    let b = store.create_node("owner-b", "doc-b")?;
    let c = store.create_node("owner-c", "doc-c")?;
    let va = store.create_version(a.id, "ma", "ra", None)?;
    let vb = store.create_version(b.id, "mb", "rb", None)?;
    let vc = store.create_version(c.id, "mc", "rc", None)?;

    let t0 = Utc::now() - Duration::hours(1);
    let mut first = row(a.id, va.id, "root/shared.csv", "shared");
    first.created_at = t0;
    // a stale flag on the first claimant does not hand ownership away
    first.external = true;
    let mut second = row(b.id, vb.id, "root/copy.csv", "shared");
    second.created_at = t0 + Duration::minutes(5);
    store.create_many(RefScope::Private, &[second, first])?;

    assert_eq!(store.owner_of_hash("shared", b.id)?, Some(a.id));
    assert_eq!(store.owner_of_hash("shared", a.id)?, None);
    // a node without rows yet sees the earliest claimant as owner
    assert_eq!(store.owner_of_hash("shared", c.id)?, Some(a.id));
    assert_eq!(store.owner_of_hash("unknown", a.id)?, None);

    // same instant: the lower node id wins
    let mut tied_b = row(b.id, vb.id, "root/t.csv", "tied");
    let mut tied_c = row(c.id, vc.id, "root/t.csv", "tied");
    tied_b.created_at = t0;
    tied_c.created_at = t0;
    store.create_many(RefScope::Private, &[tied_c, tied_b])?;
    assert_eq!(store.owner_of_hash("tied", c.id)?, Some(b.id));
    assert_eq!(store.owner_of_hash("tied", b.id)?, None);

    let nodes = store.list_nodes()?;
    assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![a.id, b.id, c.id]);
    assert_eq!(store.node_by_uuid(&b.uuid)?.map(|n| n.document_id), Some("doc-b".to_string()));
    Ok(())
}
