//! Live mirrors: collections, documents and the reconciliation between them.

pub mod collection;
pub mod document;
pub(crate) mod reconcile;

pub use collection::{CollectionBuilder, CollectionKind, DocumentFactory, MirrorCollection, SaveSummary};
pub use document::{DocumentInit, MirrorDocument, Mirrored, SyncState};
