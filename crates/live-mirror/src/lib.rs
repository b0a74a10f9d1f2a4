//! Reactive client-side mirrors of remote document collections.
//!
//! A [`MirrorCollection`] keeps an ordered set of [`MirrorDocument`]s in
//! step with a query's change feed. Documents accept optimistic local edits
//! that remote updates never clobber, and dirty documents are written back
//! in size-bounded atomic batches.

pub mod database;
pub mod error;
pub mod mirror;
pub mod query;
pub mod reactive;
pub mod schema;
pub mod store;
pub mod types;

pub use database::{MirrorDatabase, MirrorParent};
pub use error::{MirrorError, Result, StoreError, StoreErrorKind};
pub use mirror::{
    CollectionBuilder, CollectionKind, DocumentInit, MirrorCollection, MirrorDocument, Mirrored,
    SaveSummary, SyncState,
};
