//! Remote store contract.
//!
//! A mirror never talks to a database directly. It consumes the narrow
//! [`RemoteStore`] interface: a query change feed plus add / update / delete
//! and atomic batched writes against a path-addressed document store.
//!
//! Paths are `/`-joined segments: a collection path such as `users/u1/todos`
//! and a document path such as `users/u1/todos/t1`.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::StoreError, query::QueryConstraint};

pub use memory::{MemoryOp, MemoryStore};

/// Operation ceiling of a single atomic batch, matching the common
/// document-database limit.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Change feed types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of a feed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
    /// The record after the change; the last known record for removals.
    pub data: Value,
    /// True when the change is an unconfirmed echo of a write this client
    /// issued and the server has not acknowledged yet.
    pub has_pending_writes: bool,
    /// Position before the change, for modified and removed entries.
    pub old_index: Option<usize>,
    /// Position after the change, for added and modified entries. Indices
    /// are relative to the list as left by the preceding entries of the batch.
    pub new_index: Option<usize>,
}

impl DocumentChange {
    pub fn added(id: impl Into<String>, data: Value) -> Self {
        Self::new(ChangeKind::Added, id, data)
    }

    pub fn modified(id: impl Into<String>, data: Value) -> Self {
        Self::new(ChangeKind::Modified, id, data)
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self::new(ChangeKind::Removed, id, Value::Null)
    }

    fn new(kind: ChangeKind, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
            has_pending_writes: false,
            old_index: None,
            new_index: None,
        }
    }

    /// Flag this change as an unconfirmed local echo.
    pub fn pending(mut self) -> Self {
        self.has_pending_writes = true;
        self
    }

    pub fn at(mut self, new_index: usize) -> Self {
        self.new_index = Some(new_index);
        self
    }

    pub fn from_index(mut self, old_index: usize) -> Self {
        self.old_index = Some(old_index);
        self
    }
}

/// Ordered changes delivered together. The first batch of a feed describes
/// the whole initial result set as `Added` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
}

impl ChangeBatch {
    pub fn new(changes: Vec<DocumentChange>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Receiver side of a change feed.
pub trait ChangeListener: Send + Sync {
    fn on_changes(&self, batch: ChangeBatch);

    /// The feed failed. No further batches follow.
    fn on_error(&self, error: StoreError);
}

/// Cancels a feed when [`cancel`](Self::cancel)led or dropped.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ============================================================================
// Store traits
// ============================================================================

/// An atomic group of writes: either every write commits or none does.
#[async_trait]
pub trait WriteBatch: Send {
    /// Queue an update (field merge) of an existing document.
    fn update(&mut self, document_path: &str, record: Value);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// The subscription-capable document store mirrors are kept in sync with.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a change feed over `collection_path` filtered and ordered by
    /// `constraints`. Batches are delivered to `listener` in order until the
    /// returned handle is cancelled or the feed fails.
    async fn subscribe(
        &self,
        collection_path: &str,
        constraints: &[QueryConstraint],
        listener: Arc<dyn ChangeListener>,
    ) -> StoreResult<SubscriptionHandle>;

    /// Create a document with a store-assigned id and return that id.
    async fn add(&self, collection_path: &str, record: Value) -> StoreResult<String>;

    /// Merge `partial` into an existing document.
    async fn update(&self, document_path: &str, partial: Value) -> StoreResult<()>;

    async fn delete(&self, document_path: &str) -> StoreResult<()>;

    fn batch(&self) -> Box<dyn WriteBatch>;

    /// Maximum number of writes one [`WriteBatch`] may hold.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
}
