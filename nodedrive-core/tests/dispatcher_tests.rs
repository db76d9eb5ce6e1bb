use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use serde_json::json;

use nodedrive_core::DriveError;
use nodedrive_core::manifest::dispatcher::apply;
use nodedrive_core::manifest::document::{ChangeMeta, ChangeRecord};
use nodedrive_core::manifest::model::{
    Author, ComponentSubtype, ExternalIdentifier, Reference, ReferenceKind,
};
use nodedrive_core::manifest::{
    ActionDispatcher, Component, ComponentKind, ComponentRef, ComponentType, ContributorRef,
    DocumentHandle, DocumentId, DocumentStore, FsDocumentStore, ManifestAction, ManifestDocument,
};

fn base() -> ManifestDocument {
    ManifestDocument::with_data_bucket("Paper", "roothash")
}

fn meta() -> ChangeMeta {
    ChangeMeta {
        time: Utc::now(),
        message: "Create".into(),
        actor: "test".into(),
    }
}

#[test]
fn add_components_is_idempotent() {
    let add = ManifestAction::AddComponents {
        components: vec![
            Component::new("paper.pdf", "root/paper.pdf", ComponentKind::Pdf),
            Component::new("code", "/root/code", ComponentKind::Code),
        ],
    };
    let once = apply(&base(), std::slice::from_ref(&add));
    let twice = apply(&once, std::slice::from_ref(&add));
    assert_eq!(once.components.len(), 3);
    assert_eq!(once, twice);
}

#[test]
fn add_drops_duplicates_within_one_batch() {
    let doc = apply(
        &base(),
        &[ManifestAction::AddComponents {
            components: vec![
                Component::new("first", "root/a.pdf", ComponentKind::Pdf),
                Component::new("second", "/root/a.pdf", ComponentKind::Data),
            ],
        }],
    );
    let matching: Vec<_> = doc.components.iter().filter(|c| c.path == "root/a.pdf").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].name, "first");
}

#[test]
fn add_never_reuses_a_component_id() {
    let paper = Component::new("paper.pdf", "root/paper.pdf", ComponentKind::Pdf);
    let doc = apply(&base(), &[ManifestAction::AddComponents { components: vec![paper.clone()] }]);

    let mut copy = paper.clone();
    copy.path = "root/copy.pdf".into();
    copy.name = "copy.pdf".into();
    let mut twin = copy.clone();
    twin.path = "root/twin.pdf".into();
    let doc = apply(&doc, &[ManifestAction::AddComponents { components: vec![copy, twin] }]);

    assert_eq!(doc.components.len(), 4);
    let mut ids: Vec<&str> = doc.components.iter().map(|c| c.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(doc.component_by_path("root/paper.pdf").map(|c| c.id.as_str()), Some(paper.id.as_str()));
    assert!(doc.component_by_path("root/copy.pdf").is_some_and(|c| c.id != paper.id));
}

#[test]
fn paths_stay_unique_across_add_and_upsert() {
    let a = Component::new("a", "root/a.csv", ComponentKind::Data);
    let b = Component::new("b", "root/b.csv", ComponentKind::Data);
    // upsert of b that tries to take a's path
    let mut b_moved = b.clone();
    b_moved.path = "a.csv".into();

    let doc = apply(
        &base(),
        &[
            ManifestAction::AddComponents { components: vec![a.clone(), b.clone()] },
            ManifestAction::UpsertComponent { component: Component::new("a2", "/root/a.csv", ComponentKind::Code) },
            ManifestAction::UpsertComponent { component: b_moved },
            ManifestAction::AddComponents { components: vec![a] },
        ],
    );

    let mut paths: Vec<&str> = doc.components.iter().map(|c| c.path.as_str()).collect();
    let total = paths.len();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), total, "duplicate paths in {paths:?}");
    assert_eq!(doc.component_by_path("root/b.csv").map(|c| c.id.clone()), Some(b.id));
    assert_eq!(
        doc.component_by_path("root/a.csv").map(|c| c.component_type.clone()),
        Some(ComponentType::Kind(ComponentKind::Code))
    );
}

#[test]
fn upsert_merges_payload_shallowly() {
    let mut original = Component::new("fig", "root/fig.png", ComponentKind::Data).with_cid("cid-1");
    original.payload.insert("title".into(), json!("Figure 1"));
    let doc = apply(&base(), &[ManifestAction::AddComponents { components: vec![original.clone()] }]);

    let mut update = original.clone();
    update.name = "figure".into();
    update.payload.clear();
    update.payload.insert("cid".into(), json!("cid-2"));
    let doc = apply(&doc, &[ManifestAction::UpsertComponent { component: update }]);

    let c = doc.component_by_path("root/fig.png").expect("component");
    assert_eq!(c.id, original.id);
    assert_eq!(c.name, "figure");
    assert_eq!(c.cid(), Some("cid-2"));
    assert_eq!(c.payload.get("title"), Some(&json!("Figure 1")));
}

#[test]
fn prefix_rename_rewrites_nested_components_only() {
    let doc = apply(
        &base(),
        &[ManifestAction::AddComponents {
            components: vec![
                Component::new("data", "root/data", ComponentKind::Data),
                Component::new("a.csv", "root/data/a.csv", ComponentKind::Data),
                Component::new("b.csv", "root/data/sub/b.csv", ComponentKind::Data),
                Component::new("database", "root/database", ComponentKind::Data),
                Component::new("other.txt", "root/other.txt", ComponentKind::Unknown),
            ],
        }],
    );
    let doc = apply(
        &doc,
        &[ManifestAction::RenameComponentPath {
            old_path: "/root/data".into(),
            new_path: "root/dataset".into(),
        }],
    );

    let paths: Vec<&str> = doc.components.iter().map(|c| c.path.as_str()).collect();
    assert!(paths.contains(&"root/dataset"));
    assert!(paths.contains(&"root/dataset/a.csv"));
    assert!(paths.contains(&"root/dataset/sub/b.csv"));
    assert!(paths.contains(&"root/database"));
    assert!(paths.contains(&"root/other.txt"));
    assert!(!paths.iter().any(|p| p.starts_with("root/data/")));
    assert_eq!(doc.component_by_path("root/dataset").map(|c| c.name.as_str()), Some("dataset"));
    assert_eq!(doc.component_by_path("root/dataset/a.csv").map(|c| c.name.as_str()), Some("a.csv"));
}

#[test]
fn assign_type_converts_then_merges_extension_maps() {
    let doc = apply(
        &base(),
        &[
            ManifestAction::AssignComponentType {
                path: "root/data".into(),
                component_type: ComponentKind::Data.into(),
            },
            ManifestAction::AssignComponentType {
                path: "root/data".into(),
                component_type: ComponentType::by_extension([("csv", ComponentKind::Data)]),
            },
            ManifestAction::AssignComponentType {
                path: "root/data".into(),
                component_type: ComponentType::by_extension([(".py", ComponentKind::Code)]),
            },
        ],
    );
    let c = doc.component_by_path("root/data").expect("appended component");
    assert_eq!(c.name, "data");
    let ComponentType::ByExtension(map) = &c.component_type else {
        panic!("expected extension mapping, got {:?}", c.component_type);
    };
    assert_eq!(map.get(".csv"), Some(&ComponentKind::Data));
    assert_eq!(map.get(".py"), Some(&ComponentKind::Code));

    let doc = apply(
        &doc,
        &[ManifestAction::AssignComponentType {
            path: "root/data".into(),
            component_type: ComponentKind::Code.into(),
        }],
    );
    assert_eq!(
        doc.component_by_path("root/data").map(|c| c.component_type.clone()),
        Some(ComponentType::Kind(ComponentKind::Code))
    );
}

#[test]
fn subtype_survives_only_on_kinds_that_carry_one() {
    let doc = apply(
        &base(),
        &[ManifestAction::AddComponents {
            components: vec![
                Component::new("paper.pdf", "root/paper.pdf", ComponentKind::Pdf)
                    .with_subtype(ComponentSubtype::Preprint),
                Component::new("table.csv", "root/table.csv", ComponentKind::Data)
                    .with_subtype(ComponentSubtype::Poster),
            ],
        }],
    );
    assert_eq!(
        doc.component_by_path("root/paper.pdf").and_then(|c| c.subtype),
        Some(ComponentSubtype::Preprint)
    );
    assert_eq!(doc.component_by_path("root/table.csv").and_then(|c| c.subtype), None);

    // retyping a document as data drops its subtype
    let doc = apply(
        &doc,
        &[ManifestAction::AssignComponentType {
            path: "root/paper.pdf".into(),
            component_type: ComponentKind::Data.into(),
        }],
    );
    assert_eq!(doc.component_by_path("root/paper.pdf").and_then(|c| c.subtype), None);
}

#[test]
fn pin_and_unpin_by_identity() {
    let pdf = Component::new("paper.pdf", "root/paper.pdf", ComponentKind::Pdf);
    let doc = apply(&base(), &[ManifestAction::AddComponents { components: vec![pdf.clone()] }]);

    let pinned = apply(&doc, &[ManifestAction::PinComponent { target: ComponentRef::Id(pdf.id.clone()) }]);
    assert!(pinned.component_by_path("root/paper.pdf").expect("pdf").starred);

    let unpinned = apply(
        &pinned,
        &[ManifestAction::UnpinComponent { target: ComponentRef::Path("/root/paper.pdf".into()) }],
    );
    assert!(!unpinned.component_by_path("root/paper.pdf").expect("pdf").starred);

    // legacy positional form still works, out-of-range is a no-op
    let by_index = apply(&doc, &[ManifestAction::PinComponent { target: ComponentRef::Index(1) }]);
    assert!(by_index.components[1].starred);
    let out_of_range = apply(&doc, &[ManifestAction::PinComponent { target: ComponentRef::Index(9) }]);
    assert_eq!(out_of_range, doc);
}

#[test]
fn dpid_is_set_once_and_clock_updates_only_on_change() {
    let first = ExternalIdentifier { prefix: "beta".into(), id: "46".into() };
    let second = ExternalIdentifier { prefix: "beta".into(), id: "99".into() };
    let doc = apply(
        &base(),
        &[
            ManifestAction::PublishDpid { dpid: first.clone() },
            ManifestAction::PublishDpid { dpid: second.clone() },
        ],
    );
    assert_eq!(doc.dpid, Some(first));

    let doc = apply(&doc, &[ManifestAction::RemoveDpid, ManifestAction::PublishDpid { dpid: second.clone() }]);
    assert_eq!(doc.dpid, Some(second));

    let clocked = apply(&doc, &[ManifestAction::SetDriveClock { time: "1700000000".into() }]);
    let again = apply(&clocked, &[ManifestAction::SetDriveClock { time: "1700000000".into() }]);
    assert_eq!(clocked, again);
    assert_eq!(again.drive_clock.as_deref(), Some("1700000000"));
}

#[test]
fn keyword_and_field_removal_is_case_insensitive() {
    let doc = apply(
        &base(),
        &[
            ManifestAction::AddKeywords { keywords: vec!["Genomics".into(), "CRISPR".into(), "Genomics".into()] },
            ManifestAction::AddKeywords { keywords: vec!["genomics".into()] },
            ManifestAction::AddResearchField { field: "Biology".into() },
            ManifestAction::AddTopics { topics: vec!["Gene Editing".into()] },
        ],
    );
    // exact-match dedupe on add
    assert_eq!(doc.keywords, vec!["Genomics", "CRISPR", "genomics"]);

    let doc = apply(
        &doc,
        &[
            ManifestAction::RemoveKeywords { keywords: vec!["GENOMICS".into()] },
            ManifestAction::RemoveResearchField { field: "biology".into() },
            ManifestAction::RemoveTopics { topics: vec!["gene editing".into()] },
        ],
    );
    assert_eq!(doc.keywords, vec!["CRISPR"]);
    assert!(doc.research_fields.is_empty());
    assert!(doc.topics.is_empty());

    let doc = apply(
        &doc,
        &[
            ManifestAction::AddKeywords { keywords: vec!["Ökologie".into(), "Ökologie-Daten".into()] },
            ManifestAction::RemoveKeywords { keywords: vec!["ökologie".into()] },
        ],
    );
    assert_eq!(doc.keywords, vec!["CRISPR", "Ökologie-Daten"]);

    let doc = apply(
        &doc,
        &[ManifestAction::UpdateResearchFields { research_fields: vec!["Physics".into(), "Physics".into()] }],
    );
    assert_eq!(doc.research_fields, vec!["Physics"]);
}

#[test]
fn contributors_are_removed_by_id() {
    let ada = Author::new("Ada");
    let grace = Author::new("Grace");
    let doc = apply(
        &base(),
        &[ManifestAction::AddContributors { authors: vec![ada.clone(), grace.clone()] }],
    );
    let doc = apply(&doc, &[ManifestAction::RemoveContributor { target: ContributorRef::Id(ada.id.clone()) }]);
    assert_eq!(doc.authors, vec![grace.clone()]);

    let doc = apply(&doc, &[ManifestAction::RemoveContributor { target: ContributorRef::Id("nobody".into()) }]);
    assert_eq!(doc.authors.len(), 1);

    let doc = apply(&doc, &[ManifestAction::SetContributors { authors: vec![ada.clone()] }]);
    assert_eq!(doc.authors, vec![ada]);
}

#[test]
fn references_are_keyed_by_id() {
    let doi = Reference { id: "10.1000/xyz".into(), kind: ReferenceKind::Doi, title: None };
    let url = Reference { id: "https://example.org".into(), kind: ReferenceKind::Url, title: Some("Site".into()) };
    let doc = apply(
        &base(),
        &[
            ManifestAction::AddReference { reference: doi.clone() },
            ManifestAction::AddReferences { references: vec![doi.clone(), url.clone()] },
        ],
    );
    assert_eq!(doc.references, vec![doi.clone(), url.clone()]);

    let doc = apply(&doc, &[ManifestAction::DeleteReference { id: doi.id.clone() }]);
    assert_eq!(doc.references, vec![url]);

    let doc = apply(&doc, &[ManifestAction::SetReferences { references: vec![doi.clone(), doi.clone()] }]);
    assert_eq!(doc.references, vec![doi]);
}

#[test]
fn component_hashes_are_rewritten_from_map() {
    let doc = apply(
        &base(),
        &[ManifestAction::AddComponents {
            components: vec![Component::new("data", "root/data", ComponentKind::Data).with_cid("old-dir")],
        }],
    );
    let mut rewrites = BTreeMap::new();
    rewrites.insert("old-dir".to_string(), "new-dir".to_string());
    rewrites.insert("roothash".to_string(), "newroot".to_string());
    let doc = apply(&doc, &[ManifestAction::UpdateComponentHashes { rewrites }]);
    assert_eq!(doc.component_by_path("root/data").and_then(|c| c.cid()), Some("new-dir"));
    assert_eq!(doc.data_root(), Some("newroot"));
}

#[test]
fn unknown_action_kind_fails_fast() {
    let err = ManifestAction::from_json(json!({ "type": "Explode Manifest", "path": "root" }))
        .expect_err("unknown kind must fail");
    assert!(matches!(err, DriveError::UnknownAction(ref k) if k == "Explode Manifest"));

    let parsed = ManifestAction::list_from_json(json!([
        { "type": "Update Title", "title": "New" },
        { "type": "Add Keywords", "keywords": ["a"] }
    ]))
    .expect("known kinds parse");
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].label(), "Update Title");
}

// ---------- document store behavior ----------

struct NeverReady {
    id: DocumentId,
    changes: AtomicUsize,
}

impl DocumentHandle for NeverReady {
    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn doc(&self) -> anyhow::Result<Option<ManifestDocument>> {
        Ok(None)
    }

    fn change(
        &self,
        _mutator: &mut dyn FnMut(&mut ManifestDocument),
        _meta: ChangeMeta,
    ) -> anyhow::Result<ManifestDocument> {
        self.changes.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("not ready")
    }

    fn history(&self) -> anyhow::Result<Vec<ChangeRecord>> {
        Ok(Vec::new())
    }
}

struct SyncingStore {
    handle: Arc<NeverReady>,
}

impl DocumentStore for SyncingStore {
    fn create(&self, _initial: &ManifestDocument, _meta: ChangeMeta) -> anyhow::Result<DocumentId> {
        Ok(self.handle.id.clone())
    }

    fn find(&self, _id: &DocumentId) -> anyhow::Result<Option<Arc<dyn DocumentHandle>>> {
        let handle: Arc<dyn DocumentHandle> = self.handle.clone();
        Ok(Some(handle))
    }
}

#[test]
fn dispatch_on_unready_document_is_a_retryable_noop() {
    let handle = Arc::new(NeverReady {
        id: DocumentId::from("doc-1"),
        changes: AtomicUsize::new(0),
    });
    let dispatcher = ActionDispatcher::new(Arc::new(SyncingStore { handle: handle.clone() }), "test");
    let out = dispatcher
        .dispatch(&DocumentId::from("doc-1"), &[ManifestAction::UpdateTitle { title: "x".into() }])
        .expect("no error when not ready");
    assert!(out.is_none());
    assert_eq!(handle.changes.load(Ordering::SeqCst), 0);
}

#[test]
fn dispatch_commits_one_change_per_call() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(FsDocumentStore::open(tmp.path().join("documents"))?);
    let id = store.create(&base(), meta())?;
    let dispatcher = ActionDispatcher::new(store.clone(), "test");

    let doc = dispatcher
        .dispatch(
            &id,
            &[
                ManifestAction::UpdateTitle { title: "Better Paper".into() },
                ManifestAction::AddKeywords { keywords: vec!["rust".into()] },
            ],
        )?
        .expect("ready");
    assert_eq!(doc.title, "Better Paper");

    let handle = store.find(&id)?.expect("handle");
    let history = handle.history()?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].message, "Update Title, Add Keywords");
    assert_eq!(history[1].actor, "test");
    assert_eq!(history[1].snapshot_hash, doc.snapshot_hash()?);

    // a no-op dispatch writes nothing
    dispatcher.dispatch(&id, &[ManifestAction::UpdateTitle { title: "Better Paper".into() }])?;
    assert_eq!(handle.history()?.len(), 2);

    // unknown document
    assert!(dispatcher.dispatch(&DocumentId::from("missing"), &[])?.is_none());
    Ok(())
}

#[test]
fn concurrent_dispatchers_on_disjoint_fields_both_survive() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(FsDocumentStore::open(tmp.path().join("documents"))?);
    let id = store.create(&base(), meta())?;

    let mut workers = Vec::new();
    for i in 0..4 {
        let dispatcher = ActionDispatcher::new(store.clone(), format!("writer-{i}"));
        let id = id.clone();
        workers.push(std::thread::spawn(move || {
            dispatcher
                .dispatch(&id, &[ManifestAction::AddKeywords { keywords: vec![format!("kw-{i}")] }])
                .map(|d| d.is_some())
        }));
    }
    for w in workers {
        assert!(w.join().expect("thread")?);
    }

    let doc = store.find(&id)?.expect("handle").doc()?.expect("doc");
    assert_eq!(doc.keywords.len(), 4);
    Ok(())
}
