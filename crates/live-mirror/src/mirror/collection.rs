//! Mirror of one remote query.
//!
//! A collection opens a change feed for its path and constraints, feeds each
//! batch through [`reconcile`](super::reconcile) and keeps an ordered list of
//! documents. Writes go straight to the store; membership only ever changes
//! in response to the feed.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, Weak},
};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{
    database::MirrorParent,
    error::{BatchSaveError, FailedBatch, MirrorError, Result, StoreError, WriteOp},
    query::QueryConstraint,
    reactive::{CollectionEvent, EventEmitter, ListenerId},
    schema::SchemaValidator,
    store::{
        ChangeBatch, ChangeKind, ChangeListener, RemoteStore, SubscriptionHandle,
        DEFAULT_MAX_BATCH_SIZE,
    },
    types::{join_path, merge},
};

use super::{
    document::{DocumentInit, MirrorDocument, Mirrored},
    reconcile::{self, Created},
};

// ============================================================================
// Configuration
// ============================================================================

static NAME_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn name_regex() -> &'static regex::Regex {
    NAME_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-]*$").expect("name regex is valid")
    })
}

/// Builds the document instances a collection holds.
pub type DocumentFactory<D> = dyn Fn(DocumentInit) -> D + Send + Sync;

/// Static configuration for a collection type.
///
/// ```ignore
/// struct Todos;
///
/// impl CollectionKind for Todos {
///     const NAME: &'static str = "todos";
///     type Document = Todo;
///
///     fn schema() -> Arc<dyn SchemaValidator> { Arc::new(todo_schema()) }
///     fn create(init: DocumentInit) -> Todo { Todo(MirrorDocument::from_init(init)) }
/// }
///
/// let todos = MirrorCollection::of::<Todos>(&db)?;
/// ```
pub trait CollectionKind: 'static {
    const NAME: &'static str;
    type Document: Mirrored;

    fn schema() -> Arc<dyn SchemaValidator>;

    fn create(init: DocumentInit) -> Self::Document;

    /// Initial query constraints.
    fn query() -> Vec<QueryConstraint> {
        Vec::new()
    }
}

/// Per-instance configuration. Obtain one from [`MirrorCollection::builder`].
pub struct CollectionBuilder<D = MirrorDocument> {
    parent_path: String,
    store: Arc<dyn RemoteStore>,
    name: String,
    schema: Option<Arc<dyn SchemaValidator>>,
    constraints: Vec<QueryConstraint>,
    factory: Arc<DocumentFactory<D>>,
    max_batch_size: Option<usize>,
}

impl<D: Mirrored> CollectionBuilder<D> {
    pub fn schema(self, schema: impl SchemaValidator + 'static) -> Self {
        self.shared_schema(Arc::new(schema))
    }

    pub fn shared_schema(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn query(mut self, constraints: impl IntoIterator<Item = QueryConstraint>) -> Self {
        self.constraints = constraints.into_iter().collect();
        self
    }

    /// Hold documents of type `E`, built by `factory`.
    pub fn factory<E: Mirrored>(
        self,
        factory: impl Fn(DocumentInit) -> E + Send + Sync + 'static,
    ) -> CollectionBuilder<E> {
        CollectionBuilder {
            parent_path: self.parent_path,
            store: self.store,
            name: self.name,
            schema: self.schema,
            constraints: self.constraints,
            factory: Arc::new(factory),
            max_batch_size: self.max_batch_size,
        }
    }

    /// Cap the number of documents per atomic batch in `save_local`. The
    /// store's own limit still applies.
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max);
        self
    }

    pub fn build(self) -> Result<MirrorCollection<D>> {
        if !name_regex().is_match(&self.name) {
            return Err(MirrorError::Config(format!(
                "invalid collection name \"{}\"",
                self.name
            )));
        }
        let schema = self.schema.ok_or_else(|| {
            MirrorError::Config(format!("collection \"{}\" has no schema", self.name))
        })?;
        let ceiling = self
            .max_batch_size
            .unwrap_or(DEFAULT_MAX_BATCH_SIZE)
            .min(self.store.max_batch_size());
        if ceiling == 0 {
            return Err(MirrorError::Config(format!(
                "collection \"{}\" has a batch size of 0",
                self.name
            )));
        }

        Ok(MirrorCollection {
            inner: Arc::new(CollectionInner {
                path: join_path(&self.parent_path, &self.name),
                store: self.store,
                schema,
                factory: self.factory,
                max_batch_size: ceiling,
                state: Mutex::new(CollectionState {
                    constraints: self.constraints,
                    documents: Vec::new(),
                    snapshot: Vec::new(),
                    subscribed: false,
                    handle: None,
                    generation: 0,
                    primed: false,
                    first_snapshot: None,
                    pending_adds: HashMap::new(),
                    last_error: None,
                }),
                events: EventEmitter::new(),
            }),
        })
    }
}

// ============================================================================
// State
// ============================================================================

type FirstSnapshot = oneshot::Sender<std::result::Result<(), StoreError>>;

struct CollectionState<D> {
    constraints: Vec<QueryConstraint>,
    documents: Vec<D>,
    snapshot: Vec<Value>,
    subscribed: bool,
    handle: Option<SubscriptionHandle>,
    /// Identifies the current feed. Bumped whenever a feed is opened or
    /// abandoned; batches tagged with an older generation are dropped.
    generation: u64,
    primed: bool,
    first_snapshot: Option<FirstSnapshot>,
    /// Documents returned by `add` that the feed has not reported yet.
    pending_adds: HashMap<String, D>,
    last_error: Option<StoreError>,
}

struct CollectionInner<D> {
    path: String,
    store: Arc<dyn RemoteStore>,
    schema: Arc<dyn SchemaValidator>,
    factory: Arc<DocumentFactory<D>>,
    max_batch_size: usize,
    state: Mutex<CollectionState<D>>,
    events: EventEmitter<CollectionEvent>,
}

/// Outcome of a successful [`MirrorCollection::save_local`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub batches: usize,
    pub documents: usize,
}

/// Shared handle to a mirrored collection. Clones observe the same mirror.
pub struct MirrorCollection<D: Mirrored = MirrorDocument> {
    inner: Arc<CollectionInner<D>>,
}

impl<D: Mirrored> Clone for MirrorCollection<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MirrorCollection {
    /// Start configuring a collection named `name` under `parent`.
    pub fn builder<P: MirrorParent + ?Sized>(
        parent: &P,
        name: impl Into<String>,
    ) -> CollectionBuilder<MirrorDocument> {
        CollectionBuilder {
            parent_path: parent.path(),
            store: parent.store(),
            name: name.into(),
            schema: None,
            constraints: Vec::new(),
            factory: Arc::new(MirrorDocument::from_init),
            max_batch_size: None,
        }
    }

    /// Build a collection from its static configuration.
    pub fn of<K: CollectionKind>(
        parent: &(impl MirrorParent + ?Sized),
    ) -> Result<MirrorCollection<K::Document>> {
        Self::builder(parent, K::NAME)
            .shared_schema(K::schema())
            .query(K::query())
            .factory(K::create)
            .build()
    }
}

impl<D: Mirrored> MirrorCollection<D> {
    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size
    }

    pub fn query(&self) -> Vec<QueryConstraint> {
        self.inner.state.lock().constraints.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().subscribed
    }

    /// Current documents in feed order.
    pub fn documents(&self) -> Vec<D> {
        self.inner.state.lock().documents.clone()
    }

    /// Each document's data with its id merged in, as of the last feed batch.
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.state.lock().snapshot.clone()
    }

    /// Look a document up in memory. Never reads the store.
    pub fn get(&self, id: &str) -> Option<D> {
        self.inner
            .state
            .lock()
            .documents
            .iter()
            .find(|d| d.mirror().id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents holding a local edit that has not been confirmed.
    pub fn dirty(&self) -> Vec<D> {
        self.documents()
            .into_iter()
            .filter(|d| !d.mirror().is_synced())
            .collect()
    }

    /// The error that ended the last feed after its first snapshot, if any.
    /// Cleared by the next `subscribe`.
    pub fn subscription_error(&self) -> Option<StoreError> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn on_change(
        &self,
        callback: impl Fn(&CollectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.on(callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    // -----------------------------------------------------------------------
    // Subscription
    // -----------------------------------------------------------------------

    /// Open the change feed and wait for its first snapshot.
    ///
    /// Returns the documents seeded by that snapshot. While already
    /// subscribed this only returns the current documents.
    pub async fn subscribe(&self) -> Result<Vec<D>> {
        let path = self.inner.path.clone();
        let (generation, constraints, first) = {
            let mut st = self.inner.state.lock();
            if st.subscribed {
                warn!(path = %path, "collection is already subscribed");
                return Ok(st.documents.clone());
            }
            let (tx, rx) = oneshot::channel();
            st.subscribed = true;
            st.generation += 1;
            st.primed = false;
            st.first_snapshot = Some(tx);
            st.last_error = None;
            (st.generation, st.constraints.clone(), rx)
        };
        debug!(path = %path, generation, "opening change feed");

        let sink = Arc::new(FeedSink {
            collection: Arc::downgrade(&self.inner),
            generation,
        });
        let handle = match self.inner.store.subscribe(&path, &constraints, sink).await {
            Ok(handle) => handle,
            Err(source) => {
                let mut st = self.inner.state.lock();
                if st.generation == generation {
                    st.subscribed = false;
                    st.first_snapshot = None;
                }
                return Err(MirrorError::Subscription { path, source });
            }
        };

        let stale = {
            let mut st = self.inner.state.lock();
            if st.generation == generation && st.subscribed {
                st.handle = Some(handle);
                None
            } else {
                Some(handle)
            }
        };
        if let Some(handle) = stale {
            handle.cancel();
        }

        match first.await {
            Ok(Ok(())) => Ok(self.documents()),
            Ok(Err(source)) => Err(MirrorError::Subscription { path, source }),
            Err(_) => Err(MirrorError::SubscriptionCancelled { path }),
        }
    }

    /// Cancel the change feed. Documents stay as they are. No-op when not
    /// subscribed.
    pub fn unsubscribe(&self) {
        let handle = {
            let mut st = self.inner.state.lock();
            if !st.subscribed {
                return;
            }
            st.subscribed = false;
            st.generation += 1;
            st.first_snapshot = None;
            st.pending_adds.clear();
            st.handle.take()
        };
        debug!(path = %self.inner.path, "closing change feed");
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Replace the query. While subscribed, the mirror is emptied and rebuilt
    /// from a fresh feed.
    pub async fn set_query(
        &self,
        constraints: impl IntoIterator<Item = QueryConstraint>,
    ) -> Result<()> {
        let resubscribe = {
            let mut st = self.inner.state.lock();
            st.constraints = constraints.into_iter().collect();
            st.subscribed
        };
        if !resubscribe {
            return Ok(());
        }

        debug!(path = %self.inner.path, "query changed, rebuilding mirror");
        self.unsubscribe();
        {
            let mut st = self.inner.state.lock();
            st.documents.clear();
            st.snapshot.clear();
        }
        self.inner.events.emit(&CollectionEvent::Cleared);
        self.subscribe().await.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Validate and create a record, returning its document right away.
    ///
    /// The returned instance is the one the feed will report, so callers can
    /// hold on to it.
    pub async fn add(&self, partial: Value) -> Result<D> {
        let path = &self.inner.path;
        let schema = &self.inner.schema;
        let record = schema
            .validate(&merge(&schema.defaults(), &partial))
            .map_err(|e| MirrorError::validation(path, e))?;

        let issued_while_subscribed = self.is_subscribed();
        let id = self
            .inner
            .store
            .add(path, record.clone())
            .await
            .map_err(|e| MirrorError::persistence(WriteOp::Add, path, e))?;

        let mut st = self.inner.state.lock();
        if let Some(existing) = st.documents.iter().find(|d| d.mirror().id() == id) {
            return Ok(existing.clone());
        }
        if let Some(pending) = st.pending_adds.get(&id) {
            return Ok(pending.clone());
        }
        let document = self.inner.create(&id, Some(record));
        if st.subscribed {
            st.pending_adds.insert(id, document.clone());
        } else if issued_while_subscribed {
            warn!(path = %path, id = %id, "add completed after the collection unsubscribed");
        }
        Ok(document)
    }

    /// Request deletion of `id`. The document leaves the mirror when the feed
    /// reports the removal.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let document_path = join_path(&self.inner.path, id);
        self.inner
            .store
            .delete(&document_path)
            .await
            .map_err(|e| MirrorError::persistence(WriteOp::Delete, &document_path, e))?;
        // A pending add outside the query never gets a removal from the feed.
        self.inner.state.lock().pending_adds.remove(id);
        Ok(())
    }

    /// Validate and persist `partial` for `id` without touching the local
    /// document.
    pub async fn update(&self, id: &str, partial: Value) -> Result<()> {
        let document_path = join_path(&self.inner.path, id);
        let schema = &self.inner.schema;
        schema
            .validate(&merge(&schema.defaults(), &partial))
            .map_err(|e| MirrorError::validation(&document_path, e))?;
        self.inner
            .store
            .update(&document_path, partial)
            .await
            .map_err(|e| MirrorError::persistence(WriteOp::Update, &document_path, e))
    }

    /// Persist every dirty document in atomic batches of at most
    /// [`max_batch_size`](Self::max_batch_size), committed concurrently.
    ///
    /// Every dirty document is validated first; one invalid document aborts
    /// the save before anything is written. Batches that commit stay
    /// committed and their documents become synced. Documents of rejected
    /// batches stay dirty and are listed in the returned
    /// [`BatchSaveError`].
    pub async fn save_local(&self) -> Result<SaveSummary> {
        let dirty = self.dirty();
        if dirty.is_empty() {
            return Ok(SaveSummary::default());
        }

        let mut prepared = Vec::with_capacity(dirty.len());
        for document in dirty {
            let write = document.mirror().prepare_write()?;
            prepared.push((document, write));
        }
        for (document, _) in &prepared {
            document.mirror().mark_saving();
        }

        let count = prepared.len();
        let groups = reconcile::partition(prepared, self.inner.max_batch_size);
        let total_batches = groups.len();
        debug!(
            path = %self.inner.path,
            documents = count,
            batches = total_batches,
            "saving dirty documents"
        );

        let commits = groups.into_iter().map(|group| {
            let store = Arc::clone(&self.inner.store);
            async move {
                let mut batch = store.batch();
                for (document, write) in &group {
                    batch.update(document.mirror().path(), write.data.clone());
                }
                let result = batch.commit().await;
                (group, result)
            }
        });

        let mut summary = SaveSummary {
            batches: total_batches,
            documents: 0,
        };
        let mut failures = Vec::new();
        for (group, result) in join_all(commits).await {
            let committed = result.is_ok();
            for (document, write) in &group {
                document.mirror().finish_write(write, committed);
            }
            match result {
                Ok(()) => {
                    debug!(path = %self.inner.path, documents = group.len(), "batch committed");
                    summary.documents += group.len();
                }
                Err(error) => {
                    debug!(path = %self.inner.path, %error, "batch rejected");
                    failures.push(FailedBatch {
                        ids: group
                            .iter()
                            .map(|(d, _)| d.mirror().id().to_string())
                            .collect(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(BatchSaveError {
                total_batches,
                committed_batches: total_batches - failures.len(),
                failures,
            }
            .into())
        }
    }
}

impl<D: Mirrored> std::fmt::Debug for MirrorCollection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("MirrorCollection")
            .field("path", &self.inner.path)
            .field("documents", &st.documents.len())
            .field("subscribed", &st.subscribed)
            .finish()
    }
}

// ============================================================================
// Feed handling
// ============================================================================

impl<D: Mirrored> CollectionInner<D> {
    fn create(&self, id: &str, data: Option<Value>) -> D {
        (self.factory)(DocumentInit {
            id: id.to_string(),
            parent_path: self.path.clone(),
            store: Arc::clone(&self.store),
            schema: Arc::clone(&self.schema),
            data,
        })
    }

    fn apply_changes(&self, generation: u64, batch: ChangeBatch) {
        let (updates, first) = {
            let mut guard = self.state.lock();
            if guard.generation != generation || !guard.subscribed {
                return;
            }
            let st = &mut *guard;
            // The first batch of a feed seeds the list from empty. Instances
            // from an earlier feed are reused for ids that are still present.
            let mut previous: HashMap<String, D> = if st.primed {
                HashMap::new()
            } else {
                std::mem::take(&mut st.documents)
                    .into_iter()
                    .map(|d| (d.mirror().id().to_string(), d))
                    .collect()
            };
            let pending_adds = &mut st.pending_adds;
            let updates = reconcile::apply_batch(&mut st.documents, &batch, |change| {
                match previous
                    .remove(&change.id)
                    .or_else(|| pending_adds.remove(&change.id))
                {
                    Some(document) => Created {
                        document,
                        reused: true,
                    },
                    None => Created {
                        document: self.create(&change.id, Some(change.data.clone())),
                        reused: false,
                    },
                }
            });
            for change in &batch.changes {
                if change.kind == ChangeKind::Removed {
                    st.pending_adds.remove(&change.id);
                }
            }
            let first = if st.primed {
                None
            } else {
                st.primed = true;
                st.first_snapshot.take()
            };
            (updates, first)
        };

        for (document, data) in updates {
            document.mirror().apply_remote(&data);
        }

        let ids = {
            let mut st = self.state.lock();
            if st.generation != generation {
                return;
            }
            st.snapshot = reconcile::flatten(&st.documents);
            st.documents
                .iter()
                .map(|d| d.mirror().id().to_string())
                .collect()
        };
        self.events.emit(&CollectionEvent::Snapshot { ids });

        if let Some(first) = first {
            debug!(path = %self.path, generation, "first snapshot applied");
            let _ = first.send(Ok(()));
        }
    }

    fn fail(&self, generation: u64, source: StoreError) {
        let (first, handle) = {
            let mut st = self.state.lock();
            if st.generation != generation || !st.subscribed {
                return;
            }
            st.subscribed = false;
            st.generation += 1;
            st.pending_adds.clear();
            let first = if st.primed {
                st.last_error = Some(source.clone());
                None
            } else {
                st.first_snapshot.take()
            };
            (first, st.handle.take())
        };
        drop(handle);

        match first {
            Some(first) => {
                let _ = first.send(Err(source));
            }
            None => {
                error!(path = %self.path, error = %source, "change feed failed, mirror is no longer subscribed");
                self.events
                    .emit(&CollectionEvent::SubscriptionFailed { error: source });
            }
        }
    }
}

/// Listener handed to the store for one feed generation.
struct FeedSink<D> {
    collection: Weak<CollectionInner<D>>,
    generation: u64,
}

impl<D: Mirrored> ChangeListener for FeedSink<D> {
    fn on_changes(&self, batch: ChangeBatch) {
        if let Some(collection) = self.collection.upgrade() {
            collection.apply_changes(self.generation, batch);
        }
    }

    fn on_error(&self, error: StoreError) {
        if let Some(collection) = self.collection.upgrade() {
            collection.fail(self.generation, error);
        }
    }
}
