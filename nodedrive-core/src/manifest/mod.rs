// src/manifest/mod.rs

pub mod actions;
pub mod dispatcher;
pub mod document;
pub mod model;

pub use actions::{ComponentRef, ContributorRef, ManifestAction};
pub use dispatcher::ActionDispatcher;
pub use document::{DocumentHandle, DocumentId, DocumentStore, FsDocumentStore};
pub use model::{Component, ComponentKind, ComponentType, ManifestDocument};
