// src/manifest/model.rs
//! Manifest data model: the research object description stored in the
//! replicated document. Mutated only through the action dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::utils::path::{self as pathutil, ROOT_ALIAS};

pub const MANIFEST_VERSION: &str = "nodedrive-manifest-1";

/// Classification of a component (and of reference rows derived from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    Pdf,
    Code,
    Data,
    Image,
    Link,
    DataBucket,
    Unknown,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Pdf => "pdf",
            ComponentKind::Code => "code",
            ComponentKind::Data => "data",
            ComponentKind::Image => "image",
            ComponentKind::Link => "link",
            ComponentKind::DataBucket => "data-bucket",
            ComponentKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(ComponentKind::Pdf),
            "code" => Some(ComponentKind::Code),
            "data" => Some(ComponentKind::Data),
            "image" => Some(ComponentKind::Image),
            "link" => Some(ComponentKind::Link),
            "data-bucket" | "data_bucket" => Some(ComponentKind::DataBucket),
            "unknown" => Some(ComponentKind::Unknown),
            _ => None,
        }
    }

    /// Only documents and links carry a subtype.
    pub fn supports_subtype(&self) -> bool {
        matches!(self, ComponentKind::Pdf | ComponentKind::Link)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single kind, or (for folder components) an extension → kind mapping used
/// to classify the folder's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentType {
    Kind(ComponentKind),
    ByExtension(BTreeMap<String, ComponentKind>),
}

impl ComponentType {
    pub fn by_extension<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, ComponentKind)>,
        S: AsRef<str>,
    {
        ComponentType::ByExtension(
            pairs
                .into_iter()
                .map(|(ext, kind)| (pathutil::normalize_extension(ext.as_ref()), kind))
                .collect(),
        )
    }

    /// The single kind, if this is not an extension mapping.
    pub fn kind(&self) -> Option<ComponentKind> {
        match self {
            ComponentType::Kind(k) => Some(*k),
            ComponentType::ByExtension(_) => None,
        }
    }

    fn supports_subtype(&self) -> bool {
        self.kind().map(|k| k.supports_subtype()).unwrap_or(false)
    }

    fn normalized(self) -> Self {
        match self {
            ComponentType::Kind(k) => ComponentType::Kind(k),
            ComponentType::ByExtension(map) => ComponentType::ByExtension(
                map.into_iter()
                    .map(|(ext, kind)| (pathutil::normalize_extension(&ext), kind))
                    .collect(),
            ),
        }
    }
}

impl From<ComponentKind> for ComponentType {
    fn from(k: ComponentKind) -> Self {
        ComponentType::Kind(k)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentSubtype {
    Manuscript,
    Preprint,
    SupplementaryInformation,
    PresentationDeck,
    Poster,
    ReviewReport,
    Other,
}

pub fn new_component_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(default = "new_component_id")]
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<ComponentSubtype>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub starred: bool,
}

impl Component {
    pub fn new(name: &str, path: &str, component_type: impl Into<ComponentType>) -> Self {
        Self {
            id: new_component_id(),
            name: name.to_string(),
            path: pathutil::neutralize(path),
            component_type: component_type.into(),
            subtype: None,
            payload: Map::new(),
            starred: false,
        }
    }

    pub fn with_cid(mut self, cid: &str) -> Self {
        self.set_cid(cid);
        self
    }

    pub fn with_subtype(mut self, subtype: ComponentSubtype) -> Self {
        self.subtype = Some(subtype);
        self
    }

    pub fn cid(&self) -> Option<&str> {
        self.payload.get("cid").and_then(|v| v.as_str())
    }

    pub fn set_cid(&mut self, cid: &str) {
        self.payload.insert("cid".into(), Value::String(cid.to_string()));
    }

    pub fn is_data_bucket(&self) -> bool {
        self.component_type.kind() == Some(ComponentKind::DataBucket)
    }

    /// Canonical form stored in a manifest: neutralized path, normalized
    /// extension keys, and no subtype on kinds that do not carry one.
    pub(crate) fn canonical(mut self) -> Self {
        self.path = pathutil::neutralize(&self.path);
        self.component_type = self.component_type.normalized();
        if !self.component_type.supports_subtype() {
            self.subtype = None;
        }
        if self.id.trim().is_empty() {
            self.id = new_component_id();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorRole {
    #[default]
    Author,
    Contributor,
    Steward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default = "new_component_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affiliations: Vec<String>,
    #[serde(default)]
    pub role: AuthorRole,
}

impl Author {
    pub fn new(name: &str) -> Self {
        Self {
            id: new_component_id(),
            name: name.to_string(),
            orcid: None,
            affiliations: Vec::new(),
            role: AuthorRole::Author,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceKind {
    Doi,
    Dpid,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Public identifier of a published research object (e.g. a dPID).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentifier {
    pub prefix: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    pub version: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub research_fields: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_clock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpid: Option<ExternalIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
}

impl ManifestDocument {
    pub fn new(title: &str) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            title: title.to_string(),
            description: None,
            license: None,
            components: Vec::new(),
            authors: Vec::new(),
            research_fields: Vec::new(),
            keywords: Vec::new(),
            topics: Vec::new(),
            references: Vec::new(),
            drive_clock: None,
            dpid: None,
            cover_image: None,
        }
    }

    /// A fresh manifest whose data bucket component points at `root_hash`.
    pub fn with_data_bucket(title: &str, root_hash: &str) -> Self {
        let mut doc = Self::new(title);
        doc.components.push(
            Component::new(ROOT_ALIAS, ROOT_ALIAS, ComponentKind::DataBucket).with_cid(root_hash),
        );
        doc
    }

    pub fn position_by_path(&self, path: &str) -> Option<usize> {
        let key = pathutil::neutralize(path);
        self.components.iter().position(|c| pathutil::neutralize(&c.path) == key)
    }

    pub fn position_by_id(&self, id: &str) -> Option<usize> {
        self.components.iter().position(|c| c.id == id)
    }

    pub fn component_by_path(&self, path: &str) -> Option<&Component> {
        self.position_by_path(path).map(|i| &self.components[i])
    }

    /// The root data bucket component (path `root`, kind `data-bucket`).
    pub fn data_bucket(&self) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.is_data_bucket() && pathutil::neutralize(&c.path) == ROOT_ALIAS)
    }

    /// Root hash of the drive this manifest describes.
    pub fn data_root(&self) -> Option<&str> {
        self.data_bucket().and_then(|c| c.cid())
    }

    /// Neutralized path → declared type, for type inheritance.
    pub fn path_type_map(&self) -> BTreeMap<String, ComponentType> {
        self.components
            .iter()
            .map(|c| (pathutil::neutralize(&c.path), c.component_type.clone()))
            .collect()
    }

    /// Content hash of this snapshot (stable for identical documents).
    pub fn snapshot_hash(&self) -> anyhow::Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}
