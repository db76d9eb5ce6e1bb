// src/manifest/dispatcher.rs
//! Action dispatcher: one call = one committed change.
//!
//! `dispatch` loads the latest snapshot through the document handle, applies
//! every action's merge rule in order, and commits the result with a
//! timestamp and a label built from the action names. When the document is
//! unavailable or not ready it returns `Ok(None)` without touching anything.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::DriveResult;
use crate::manifest::actions::{ComponentRef, ContributorRef, ManifestAction};
use crate::manifest::document::{ChangeMeta, DocumentId, DocumentStore};
use crate::manifest::model::{
    Author, Component, ComponentType, ManifestDocument, Reference, new_component_id,
};
use crate::services::audit::record_action;
use crate::utils::path as pathutil;

#[derive(Clone)]
pub struct ActionDispatcher {
    store: Arc<dyn DocumentStore>,
    actor: String,
}

impl ActionDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, actor: impl Into<String>) -> Self {
        Self {
            store,
            actor: actor.into(),
        }
    }

    /// Apply `actions` to the document as a single commit.
    ///
    /// Returns `Ok(None)` when the document handle is missing or not ready;
    /// nothing is mutated in that case and the caller may retry.
    pub fn dispatch(
        &self,
        document_id: &DocumentId,
        actions: &[ManifestAction],
    ) -> DriveResult<Option<ManifestDocument>> {
        let Some(handle) = self.store.find(document_id)? else {
            tracing::warn!(document = %document_id, "dispatch skipped: document not found");
            return Ok(None);
        };
        if !handle.is_ready() {
            tracing::warn!(document = %document_id, "dispatch skipped: document not ready");
            return Ok(None);
        }
        if actions.is_empty() {
            return Ok(handle.doc()?);
        }

        let message = change_label(actions);
        let meta = ChangeMeta {
            time: Utc::now(),
            message: message.clone(),
            actor: self.actor.clone(),
        };
        let doc = handle.change(
            &mut |doc| {
                for action in actions {
                    apply_action(doc, action);
                }
            },
            meta,
        )?;

        record_action(
            "dispatcher",
            "dispatch_committed",
            &json!({
                "document": document_id.as_str(),
                "message": message,
                "actions": actions.len(),
                "components": doc.components.len(),
            }),
            "low",
        );
        Ok(Some(doc))
    }
}

fn change_label(actions: &[ManifestAction]) -> String {
    let labels: Vec<&str> = actions.iter().map(|a| a.label()).collect();
    labels.join(", ")
}

/// Pure form of a dispatch: apply `actions` to a copy of `doc`.
pub fn apply(doc: &ManifestDocument, actions: &[ManifestAction]) -> ManifestDocument {
    let mut next = doc.clone();
    for action in actions {
        apply_action(&mut next, action);
    }
    next
}

/// The merge rule for each action kind.
pub fn apply_action(doc: &mut ManifestDocument, action: &ManifestAction) {
    match action {
        ManifestAction::AddComponents { components } => add_components(doc, components),
        ManifestAction::UpsertComponent { component } => upsert_component(doc, component),
        ManifestAction::UpsertComponents { components } => {
            for c in components {
                upsert_component(doc, c);
            }
        }
        ManifestAction::UpdateComponent { path, component } => {
            if let Some(i) = doc.position_by_path(path) {
                let existing = &doc.components[i];
                let mut replacement = component.clone().canonical();
                replacement.id = existing.id.clone();
                replacement.path = existing.path.clone();
                doc.components[i] = replacement;
            }
        }
        ManifestAction::UpdateComponentHashes { rewrites } => {
            for c in doc.components.iter_mut() {
                let next = c.cid().and_then(|cid| rewrites.get(cid)).cloned();
                if let Some(new_cid) = next {
                    c.set_cid(&new_cid);
                }
            }
        }
        ManifestAction::RenameComponent { path, name } => {
            if let Some(i) = doc.position_by_path(path) {
                doc.components[i].name = name.clone();
            }
        }
        ManifestAction::RenameComponentPath { old_path, new_path } => {
            rename_component_path(doc, old_path, new_path)
        }
        ManifestAction::DeleteComponent { path } => {
            let key = pathutil::neutralize(path);
            doc.components.retain(|c| pathutil::neutralize(&c.path) != key);
        }
        ManifestAction::DeleteComponents { paths } => {
            let keys: HashSet<String> = paths.iter().map(|p| pathutil::neutralize(p)).collect();
            doc.components
                .retain(|c| !keys.contains(&pathutil::neutralize(&c.path)));
        }
        ManifestAction::AssignComponentType {
            path,
            component_type,
        } => assign_component_type(doc, path, component_type),
        ManifestAction::PinComponent { target } => set_starred(doc, target, true),
        ManifestAction::UnpinComponent { target } => set_starred(doc, target, false),
        ManifestAction::SetDriveClock { time } => {
            if doc.drive_clock.as_deref() != Some(time.as_str()) {
                doc.drive_clock = Some(time.clone());
            }
        }
        ManifestAction::PublishDpid { dpid } => {
            if doc.dpid.is_none() {
                doc.dpid = Some(dpid.clone());
            }
        }
        ManifestAction::RemoveDpid => doc.dpid = None,
        ManifestAction::UpdateTitle { title } => doc.title = title.clone(),
        ManifestAction::UpdateDescription { description } => {
            doc.description = Some(description.clone())
        }
        ManifestAction::UpdateLicense { license } => doc.license = Some(license.clone()),
        ManifestAction::UpdateCoverImage { cid } => doc.cover_image = cid.clone(),
        ManifestAction::UpdateResearchFields { research_fields } => {
            doc.research_fields = dedupe_exact(research_fields)
        }
        ManifestAction::AddResearchField { field } => {
            append_absent(&mut doc.research_fields, std::slice::from_ref(field))
        }
        ManifestAction::RemoveResearchField { field } => {
            remove_ignore_case(&mut doc.research_fields, std::slice::from_ref(field))
        }
        ManifestAction::AddKeywords { keywords } => append_absent(&mut doc.keywords, keywords),
        ManifestAction::RemoveKeywords { keywords } => {
            remove_ignore_case(&mut doc.keywords, keywords)
        }
        ManifestAction::AddTopics { topics } => append_absent(&mut doc.topics, topics),
        ManifestAction::RemoveTopics { topics } => remove_ignore_case(&mut doc.topics, topics),
        ManifestAction::AddContributor { author } => doc.authors.push(author.clone()),
        ManifestAction::AddContributors { authors } => {
            doc.authors.extend(authors.iter().cloned())
        }
        ManifestAction::RemoveContributor { target } => remove_contributor(doc, target),
        ManifestAction::SetContributors { authors } => doc.authors = authors.clone(),
        ManifestAction::AddReference { reference } => {
            add_references(&mut doc.references, std::slice::from_ref(reference))
        }
        ManifestAction::AddReferences { references } => {
            add_references(&mut doc.references, references)
        }
        ManifestAction::DeleteReference { id } => doc.references.retain(|r| &r.id != id),
        ManifestAction::SetReferences { references } => {
            doc.references.clear();
            add_references(&mut doc.references, references);
        }
    }
}

// ---------- component rules ----------

/// Append only components whose path is not present yet; the rest are dropped.
/// An appended component whose id is already in use gets a fresh one.
fn add_components(doc: &mut ManifestDocument, components: &[Component]) {
    let mut taken: HashSet<String> = doc
        .components
        .iter()
        .map(|c| pathutil::neutralize(&c.path))
        .collect();
    let mut ids: HashSet<String> = doc.components.iter().map(|c| c.id.clone()).collect();
    for c in components {
        let mut c = c.clone().canonical();
        if !taken.insert(c.path.clone()) {
            continue;
        }
        if !ids.insert(c.id.clone()) {
            let fresh = new_component_id();
            tracing::debug!(id = %c.id, path = %c.path, fresh = %fresh, "added component reissued a taken id");
            c.id = fresh;
            ids.insert(c.id.clone());
        }
        doc.components.push(c);
    }
}

/// Match by id, then by path. Found: shallow-merge payload, replace the other
/// fields. Not found: append.
fn upsert_component(doc: &mut ManifestDocument, incoming: &Component) {
    let incoming = incoming.clone().canonical();
    let found = doc
        .position_by_id(&incoming.id)
        .or_else(|| doc.position_by_path(&incoming.path));

    let Some(i) = found else {
        doc.components.push(incoming);
        return;
    };

    // Never move a component onto a path another component already holds.
    let path_taken_elsewhere = doc
        .position_by_path(&incoming.path)
        .map(|j| j != i)
        .unwrap_or(false);

    let existing = &mut doc.components[i];
    for (k, v) in incoming.payload {
        existing.payload.insert(k, v);
    }
    existing.name = incoming.name;
    existing.component_type = incoming.component_type;
    existing.subtype = incoming.subtype;
    existing.starred = incoming.starred;
    if path_taken_elsewhere {
        tracing::warn!(
            component = %existing.id,
            path = %incoming.path,
            "upsert kept existing path: target path belongs to another component"
        );
    } else {
        existing.path = incoming.path;
    }
}

/// Rewrite every component at or under `old_path` to live under `new_path`.
fn rename_component_path(doc: &mut ManifestDocument, old_path: &str, new_path: &str) {
    let old = pathutil::neutralize(old_path);
    let new = pathutil::neutralize(new_path);
    if old == new {
        return;
    }
    let unmoved: BTreeSet<String> = doc
        .components
        .iter()
        .map(|c| pathutil::neutralize(&c.path))
        .filter(|p| !pathutil::is_within(p, &old))
        .collect();

    for c in doc.components.iter_mut() {
        let Some(rebased) = pathutil::rebase(&c.path, &old, &new) else {
            continue;
        };
        if unmoved.contains(&rebased) {
            tracing::warn!(from = %c.path, to = %rebased, "path rename skipped: target occupied");
            continue;
        }
        if pathutil::neutralize(&c.path) == old {
            c.name = pathutil::file_name(&new);
        }
        c.path = rebased;
    }
}

/// Single kinds replace; extension mappings merge into an existing mapping.
fn assign_component_type(doc: &mut ManifestDocument, path: &str, component_type: &ComponentType) {
    let incoming = Component::new(&pathutil::file_name(path), path, component_type.clone())
        .canonical();
    let Some(i) = doc.position_by_path(path) else {
        doc.components.push(incoming);
        return;
    };
    let existing = &mut doc.components[i];
    match (&mut existing.component_type, incoming.component_type) {
        (ComponentType::ByExtension(current), ComponentType::ByExtension(added)) => {
            current.extend(added);
        }
        (slot, replacement) => *slot = replacement,
    }
    if existing
        .component_type
        .kind()
        .map(|k| !k.supports_subtype())
        .unwrap_or(true)
    {
        existing.subtype = None;
    }
}

fn set_starred(doc: &mut ManifestDocument, target: &ComponentRef, starred: bool) {
    let idx = match target {
        ComponentRef::Id(id) => doc.position_by_id(id),
        ComponentRef::Path(path) => doc.position_by_path(path),
        ComponentRef::Index(i) => {
            tracing::warn!(index = *i, "positional component addressing used for pin/unpin");
            (*i < doc.components.len()).then_some(*i)
        }
    };
    match idx {
        Some(i) => doc.components[i].starred = starred,
        None => tracing::debug!(?target, "pin target not found"),
    }
}

// ---------- set-like rules ----------

fn dedupe_exact(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    append_absent(&mut out, values);
    out
}

fn append_absent(target: &mut Vec<String>, values: &[String]) {
    for v in values {
        if !target.iter().any(|t| t == v) {
            target.push(v.clone());
        }
    }
}

fn remove_ignore_case(target: &mut Vec<String>, values: &[String]) {
    let doomed: HashSet<String> = values.iter().map(|v| v.to_lowercase()).collect();
    target.retain(|t| !doomed.contains(&t.to_lowercase()));
}

fn remove_contributor(doc: &mut ManifestDocument, target: &ContributorRef) {
    match target {
        ContributorRef::Id(id) => doc.authors.retain(|a: &Author| &a.id != id),
        ContributorRef::Index(i) => {
            // The index may name a different contributor after a concurrent edit.
            tracing::warn!(index = *i, "positional contributor removal used");
            if *i < doc.authors.len() {
                doc.authors.remove(*i);
            }
        }
    }
}

fn add_references(target: &mut Vec<Reference>, incoming: &[Reference]) {
    for r in incoming {
        if !target.iter().any(|t| t.id == r.id) {
            target.push(r.clone());
        }
    }
}
