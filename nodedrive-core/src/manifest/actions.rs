// src/manifest/actions.rs
//! The closed vocabulary of manifest edits.
//!
//! Each variant has exactly one merge rule in `dispatcher::apply_action`; the
//! match there is exhaustive, so adding a variant without a rule does not build.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{DriveError, DriveResult};
use crate::manifest::model::{Author, Component, ComponentType, ExternalIdentifier, Reference};

/// Identity of a component for pin/unpin.
///
/// `Index` addresses the component by its current position and is kept only
/// for older clients; the position can point elsewhere after a concurrent edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentRef {
    Id(String),
    Path(String),
    Index(usize),
}

/// Identity of a contributor for removal. `Index` has the same caveat as
/// [`ComponentRef::Index`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContributorRef {
    Id(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ManifestAction {
    #[serde(rename = "Add Components")]
    AddComponents { components: Vec<Component> },
    #[serde(rename = "Upsert Component")]
    UpsertComponent { component: Component },
    #[serde(rename = "Upsert Components")]
    UpsertComponents { components: Vec<Component> },
    #[serde(rename = "Update Component")]
    UpdateComponent { path: String, component: Component },
    #[serde(rename = "Update Component Hashes")]
    UpdateComponentHashes { rewrites: BTreeMap<String, String> },
    #[serde(rename = "Rename Component", rename_all = "camelCase")]
    RenameComponent { path: String, name: String },
    #[serde(rename = "Rename Component Path", rename_all = "camelCase")]
    RenameComponentPath { old_path: String, new_path: String },
    #[serde(rename = "Delete Component")]
    DeleteComponent { path: String },
    #[serde(rename = "Delete Components")]
    DeleteComponents { paths: Vec<String> },
    #[serde(rename = "Assign Component Type", rename_all = "camelCase")]
    AssignComponentType {
        path: String,
        component_type: ComponentType,
    },
    #[serde(rename = "Pin Component")]
    PinComponent { target: ComponentRef },
    #[serde(rename = "Unpin Component")]
    UnpinComponent { target: ComponentRef },
    #[serde(rename = "Set Drive Clock")]
    SetDriveClock { time: String },
    #[serde(rename = "Publish Dpid")]
    PublishDpid { dpid: ExternalIdentifier },
    #[serde(rename = "Remove Dpid")]
    RemoveDpid,
    #[serde(rename = "Update Title")]
    UpdateTitle { title: String },
    #[serde(rename = "Update Description")]
    UpdateDescription { description: String },
    #[serde(rename = "Update License")]
    UpdateLicense { license: String },
    #[serde(rename = "Update CoverImage")]
    UpdateCoverImage { cid: Option<String> },
    #[serde(rename = "Update ResearchFields", rename_all = "camelCase")]
    UpdateResearchFields { research_fields: Vec<String> },
    #[serde(rename = "Add ResearchField")]
    AddResearchField { field: String },
    #[serde(rename = "Remove ResearchField")]
    RemoveResearchField { field: String },
    #[serde(rename = "Add Keywords")]
    AddKeywords { keywords: Vec<String> },
    #[serde(rename = "Remove Keywords")]
    RemoveKeywords { keywords: Vec<String> },
    #[serde(rename = "Add Topics")]
    AddTopics { topics: Vec<String> },
    #[serde(rename = "Remove Topics")]
    RemoveTopics { topics: Vec<String> },
    #[serde(rename = "Add Contributor")]
    AddContributor { author: Author },
    #[serde(rename = "Add Contributors")]
    AddContributors { authors: Vec<Author> },
    #[serde(rename = "Remove Contributor")]
    RemoveContributor { target: ContributorRef },
    #[serde(rename = "Set Contributors")]
    SetContributors { authors: Vec<Author> },
    #[serde(rename = "Add Reference")]
    AddReference { reference: Reference },
    #[serde(rename = "Add References")]
    AddReferences { references: Vec<Reference> },
    #[serde(rename = "Delete Reference")]
    DeleteReference { id: String },
    #[serde(rename = "Set References")]
    SetReferences { references: Vec<Reference> },
}

impl ManifestAction {
    /// Every `type` tag the dispatcher understands.
    pub const KINDS: &'static [&'static str] = &[
        "Add Components",
        "Upsert Component",
        "Upsert Components",
        "Update Component",
        "Update Component Hashes",
        "Rename Component",
        "Rename Component Path",
        "Delete Component",
        "Delete Components",
        "Assign Component Type",
        "Pin Component",
        "Unpin Component",
        "Set Drive Clock",
        "Publish Dpid",
        "Remove Dpid",
        "Update Title",
        "Update Description",
        "Update License",
        "Update CoverImage",
        "Update ResearchFields",
        "Add ResearchField",
        "Remove ResearchField",
        "Add Keywords",
        "Remove Keywords",
        "Add Topics",
        "Remove Topics",
        "Add Contributor",
        "Add Contributors",
        "Remove Contributor",
        "Set Contributors",
        "Add Reference",
        "Add References",
        "Delete Reference",
        "Set References",
    ];

    /// Human-readable label used as the change message.
    pub fn label(&self) -> &'static str {
        match self {
            ManifestAction::AddComponents { .. } => "Add Components",
            ManifestAction::UpsertComponent { .. } => "Upsert Component",
            ManifestAction::UpsertComponents { .. } => "Upsert Components",
            ManifestAction::UpdateComponent { .. } => "Update Component",
            ManifestAction::UpdateComponentHashes { .. } => "Update Component Hashes",
            ManifestAction::RenameComponent { .. } => "Rename Component",
            ManifestAction::RenameComponentPath { .. } => "Rename Component Path",
            ManifestAction::DeleteComponent { .. } => "Delete Component",
            ManifestAction::DeleteComponents { .. } => "Delete Components",
            ManifestAction::AssignComponentType { .. } => "Assign Component Type",
            ManifestAction::PinComponent { .. } => "Pin Component",
            ManifestAction::UnpinComponent { .. } => "Unpin Component",
            ManifestAction::SetDriveClock { .. } => "Set Drive Clock",
            ManifestAction::PublishDpid { .. } => "Publish Dpid",
            ManifestAction::RemoveDpid => "Remove Dpid",
            ManifestAction::UpdateTitle { .. } => "Update Title",
            ManifestAction::UpdateDescription { .. } => "Update Description",
            ManifestAction::UpdateLicense { .. } => "Update License",
            ManifestAction::UpdateCoverImage { .. } => "Update CoverImage",
            ManifestAction::UpdateResearchFields { .. } => "Update ResearchFields",
            ManifestAction::AddResearchField { .. } => "Add ResearchField",
            ManifestAction::RemoveResearchField { .. } => "Remove ResearchField",
            ManifestAction::AddKeywords { .. } => "Add Keywords",
            ManifestAction::RemoveKeywords { .. } => "Remove Keywords",
            ManifestAction::AddTopics { .. } => "Add Topics",
            ManifestAction::RemoveTopics { .. } => "Remove Topics",
            ManifestAction::AddContributor { .. } => "Add Contributor",
            ManifestAction::AddContributors { .. } => "Add Contributors",
            ManifestAction::RemoveContributor { .. } => "Remove Contributor",
            ManifestAction::SetContributors { .. } => "Set Contributors",
            ManifestAction::AddReference { .. } => "Add Reference",
            ManifestAction::AddReferences { .. } => "Add References",
            ManifestAction::DeleteReference { .. } => "Delete Reference",
            ManifestAction::SetReferences { .. } => "Set References",
        }
    }

    /// Parse one action from its JSON form.
    ///
    /// A missing or unrecognized `type` tag is an [`DriveError::UnknownAction`];
    /// a known tag with a malformed body is a JSON error.
    pub fn from_json(value: Value) -> DriveResult<Self> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .unwrap_or_default();
        if !Self::KINDS.contains(&kind.as_str()) {
            tracing::error!(kind = %kind, "rejecting unknown manifest action");
            return Err(DriveError::UnknownAction(kind));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a single action object or an array of them.
    pub fn list_from_json(value: Value) -> DriveResult<Vec<Self>> {
        match value {
            Value::Array(items) => items.into_iter().map(Self::from_json).collect(),
            other => Ok(vec![Self::from_json(other)?]),
        }
    }
}
