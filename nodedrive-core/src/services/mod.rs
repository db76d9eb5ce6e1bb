pub mod audit;
pub mod indexer;
pub mod references;

pub use indexer::{Indexer, PublishedVersion, StaticIndexer};
pub use references::{HealWrite, Node, NodeVersion, PruneEntry, RefScope, ReferenceRow, ReferenceStore};
