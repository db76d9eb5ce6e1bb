pub mod content;
pub mod healer;
pub mod locks;
pub mod path_index;
pub mod reconciler;
pub mod rename;

pub use content::{ContentStore, DagStore, EntryKind, ExternalEntry, ExternalMap, Link, LinkUpdate, TreeEntry};
pub use healer::{BatchHealSummary, HealOptions, HealReport, HealTarget, ReferenceHealer, ValidationReport};
pub use locks::NodeLocks;
pub use path_index::{FlatEntry, TypeResolver};
pub use reconciler::{AccessStatus, DriveObject, DriveReconciler, ReconcileInput, TreeDiff};
pub use rename::{RenameMoveOrchestrator, RenameOutcome};
