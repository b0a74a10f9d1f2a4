//! Mirror of a single remote document.
//!
//! A document moves between three states:
//!
//! - **Synced**: `data` equals the confirmed baseline (`original_data`) and
//!   tracks every remote update.
//! - **Dirty**: `data` holds an optimistic local edit. Remote updates only
//!   refresh `latest_remote_data`; the edit stays visible until it is saved
//!   or discarded.
//! - **Saving**: a write of `data` is in flight. The document counts as
//!   dirty until the store confirms it.
//!
//! Every local edit bumps an internal revision. A write completes against the
//! revision it started from, so an edit made while the write is in flight is
//! never masked as synced.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::{
    database::MirrorParent,
    error::{MirrorError, Result, WriteOp},
    reactive::{DocumentEvent, EventEmitter, ListenerId},
    schema::SchemaValidator,
    store::RemoteStore,
    types::{join_path, merge},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Dirty,
    Saving,
}

/// Everything a document factory needs to build one document.
pub struct DocumentInit {
    pub id: String,
    pub parent_path: String,
    pub store: Arc<dyn RemoteStore>,
    pub schema: Arc<dyn SchemaValidator>,
    /// Known record, or `None` to start from the schema defaults.
    pub data: Option<Value>,
}

/// A document type a [`MirrorCollection`](super::MirrorCollection) can hold.
///
/// Application types wrap a [`MirrorDocument`] and add their own accessors;
/// the collection reaches the underlying state through [`mirror`](Self::mirror).
pub trait Mirrored: Clone + Send + Sync + 'static {
    fn mirror(&self) -> &MirrorDocument;
}

struct DocumentState {
    data: Value,
    original_data: Value,
    latest_remote_data: Option<Value>,
    synced: bool,
    saving: bool,
    revision: u64,
}

struct DocumentInner {
    id: String,
    path: String,
    store: Arc<dyn RemoteStore>,
    schema: Arc<dyn SchemaValidator>,
    state: Mutex<DocumentState>,
    events: EventEmitter<DocumentEvent>,
}

/// Shared handle to one mirrored document. Clones observe the same state.
#[derive(Clone)]
pub struct MirrorDocument {
    inner: Arc<DocumentInner>,
}

/// A validated record captured for writing, with the revision it was taken at.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub data: Value,
    revision: u64,
}

impl MirrorDocument {
    pub fn from_init(init: DocumentInit) -> Self {
        let path = join_path(&init.parent_path, &init.id);
        let data = match &init.data {
            Some(raw) => normalize(init.schema.as_ref(), &path, raw),
            None => init.schema.defaults(),
        };
        let latest_remote_data = init.data.as_ref().map(|_| data.clone());
        Self {
            inner: Arc::new(DocumentInner {
                id: init.id,
                path,
                store: init.store,
                schema: init.schema,
                state: Mutex::new(DocumentState {
                    original_data: data.clone(),
                    data,
                    latest_remote_data,
                    synced: true,
                    saving: false,
                    revision: 0,
                }),
                events: EventEmitter::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The visible record: the baseline, or the pending local edit.
    pub fn data(&self) -> Value {
        self.inner.state.lock().data.clone()
    }

    /// One top-level field of [`data`](Self::data).
    pub fn get(&self, field: &str) -> Option<Value> {
        self.inner.state.lock().data.get(field).cloned()
    }

    /// The last confirmed baseline.
    pub fn original_data(&self) -> Value {
        self.inner.state.lock().original_data.clone()
    }

    pub fn latest_remote_data(&self) -> Option<Value> {
        self.inner.state.lock().latest_remote_data.clone()
    }

    pub fn is_synced(&self) -> bool {
        self.inner.state.lock().synced
    }

    pub fn sync_state(&self) -> SyncState {
        let st = self.inner.state.lock();
        if st.saving {
            SyncState::Saving
        } else if st.synced {
            SyncState::Synced
        } else {
            SyncState::Dirty
        }
    }

    /// True when both handles refer to the same document instance.
    pub fn same_instance(&self, other: &MirrorDocument) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn on_change(&self, callback: impl Fn(&DocumentEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    // -----------------------------------------------------------------------
    // Local edits
    // -----------------------------------------------------------------------

    /// Merge `partial` into `data` and mark the document dirty. No remote call.
    pub fn update_local(&self, partial: Value) {
        {
            let mut st = self.inner.state.lock();
            st.data = merge(&st.data, &partial);
            st.synced = false;
            st.revision += 1;
        }
        self.inner.events.emit(&DocumentEvent::LocalEdit);
    }

    /// Validate and persist the current `data`.
    ///
    /// On success the written record becomes the baseline. If `data` changed
    /// while the write was in flight the document stays dirty. On failure
    /// the document stays dirty and the error is returned.
    pub async fn save_local(&self) -> Result<()> {
        let write = self.prepare_write()?;
        self.mark_saving();
        let result = self
            .inner
            .store
            .update(&self.inner.path, write.data.clone())
            .await;
        self.finish_write(&write, result.is_ok());
        result.map_err(|e| MirrorError::persistence(WriteOp::Update, &self.inner.path, e))
    }

    /// Replace a pending local edit with the latest remote value.
    ///
    /// Returns false, changing nothing, when the document is synced or no
    /// remote value has been observed yet.
    pub fn discard_local(&self) -> bool {
        {
            let mut st = self.inner.state.lock();
            if st.synced {
                return false;
            }
            let Some(latest) = st.latest_remote_data.clone() else {
                return false;
            };
            st.original_data = latest.clone();
            st.data = latest;
            st.synced = true;
            st.revision += 1;
        }
        self.inner.events.emit(&DocumentEvent::Discarded);
        true
    }

    /// Optimistic update: apply `partial` immediately, persist only `partial`,
    /// and roll back on failure.
    ///
    /// A rollback restores `data`, `original_data` and the sync flag exactly
    /// as they were before the call. A document that was already dirty
    /// therefore comes back dirty, not synced, keeping the pending local edit
    /// made earlier. A local edit made while the write is in flight is left
    /// alone in both outcomes.
    pub async fn update(&self, partial: Value) -> Result<()> {
        let candidate = merge(&self.data(), &partial);
        let validated = self
            .inner
            .schema
            .validate(&candidate)
            .map_err(|e| MirrorError::validation(&self.inner.path, e))?;

        let (previous, revision) = {
            let mut st = self.inner.state.lock();
            let previous = (st.data.clone(), st.original_data.clone(), st.synced);
            st.data = validated.clone();
            st.original_data = validated;
            st.synced = false;
            st.revision += 1;
            (previous, st.revision)
        };
        self.inner.events.emit(&DocumentEvent::LocalEdit);

        let result = self.inner.store.update(&self.inner.path, partial).await;

        let event = {
            let mut st = self.inner.state.lock();
            let current = st.revision == revision;
            match &result {
                Ok(()) if current => {
                    st.original_data = st.data.clone();
                    st.synced = true;
                    Some(DocumentEvent::Saved)
                }
                Err(_) if current => {
                    let (data, original_data, synced) = previous;
                    st.data = data;
                    st.original_data = original_data;
                    st.synced = synced;
                    st.revision += 1;
                    Some(DocumentEvent::RolledBack)
                }
                _ => None,
            }
        };
        if let Some(event) = event {
            self.inner.events.emit(&event);
        }

        result.map_err(|e| MirrorError::persistence(WriteOp::Update, &self.inner.path, e))
    }

    /// Request deletion of the remote document. Membership in a collection
    /// changes only when the feed reports the removal.
    pub async fn delete(&self) -> Result<()> {
        self.inner
            .store
            .delete(&self.inner.path)
            .await
            .map_err(|e| MirrorError::persistence(WriteOp::Delete, &self.inner.path, e))
    }

    // -----------------------------------------------------------------------
    // Collection hooks
    // -----------------------------------------------------------------------

    /// Ingest a remote value. Replaces `data` only while synced.
    pub(crate) fn apply_remote(&self, raw: &Value) {
        let incoming = normalize(self.inner.schema.as_ref(), &self.inner.path, raw);
        let applied = {
            let mut st = self.inner.state.lock();
            st.latest_remote_data = Some(incoming.clone());
            if st.synced {
                st.original_data = incoming.clone();
                st.data = incoming;
                true
            } else {
                false
            }
        };
        self.inner
            .events
            .emit(&DocumentEvent::RemoteUpdate { applied });
    }

    /// Validate the current `data` for a write.
    pub(crate) fn prepare_write(&self) -> Result<PendingWrite> {
        let (data, revision) = {
            let st = self.inner.state.lock();
            (st.data.clone(), st.revision)
        };
        let data = self
            .inner
            .schema
            .validate(&data)
            .map_err(|e| MirrorError::validation(&self.inner.path, e))?;
        Ok(PendingWrite { data, revision })
    }

    pub(crate) fn mark_saving(&self) {
        self.inner.state.lock().saving = true;
    }

    /// Settle a write started from `write`.
    pub(crate) fn finish_write(&self, write: &PendingWrite, committed: bool) {
        let saved = {
            let mut st = self.inner.state.lock();
            st.saving = false;
            if !committed {
                false
            } else if st.revision == write.revision {
                st.data = write.data.clone();
                st.original_data = write.data.clone();
                st.synced = true;
                true
            } else {
                // A newer edit that already settled owns the baseline.
                if !st.synced {
                    st.original_data = write.data.clone();
                }
                false
            }
        };
        if saved {
            self.inner.events.emit(&DocumentEvent::Saved);
        }
    }
}

/// Validated form of a remote record. A record the schema rejects is kept
/// as received, laid over the defaults.
fn normalize(schema: &dyn SchemaValidator, path: &str, raw: &Value) -> Value {
    match schema.validate(raw) {
        Ok(validated) => validated,
        Err(errors) => {
            warn!(path, %errors, "remote record failed validation, keeping it as received");
            merge(&schema.defaults(), raw)
        }
    }
}

impl Mirrored for MirrorDocument {
    fn mirror(&self) -> &MirrorDocument {
        self
    }
}

impl MirrorParent for MirrorDocument {
    fn path(&self) -> String {
        self.inner.path.clone()
    }

    fn store(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.inner.store)
    }
}

impl std::fmt::Debug for MirrorDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("MirrorDocument")
            .field("path", &self.inner.path)
            .field("data", &st.data)
            .field("synced", &st.synced)
            .field("saving", &st.saving)
            .finish()
    }
}
