//! In-memory [`RemoteStore`].
//!
//! Keeps every collection in a `BTreeMap`, evaluates feed queries with
//! [`query::execute`](crate::query::execute) and derives each feed's
//! added / modified / removed entries by diffing the previous result list
//! against the new one, so indices and ordering behave like a real feed.
//!
//! Test hooks:
//! - latency compensation: a local write is first echoed with
//!   `has_pending_writes` set, then confirmed by a second, unflagged entry;
//! - held snapshots: initial snapshots wait for [`MemoryStore::release_snapshots`];
//! - fault injection per operation, per-document commit rejection and feed failure;
//! - commit accounting.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::StoreError,
    query::{execute, QueryConstraint},
    types::{merge, split_document_path},
};

use super::{
    ChangeBatch, ChangeListener, DocumentChange, RemoteStore, StoreResult, SubscriptionHandle,
    WriteBatch, DEFAULT_MAX_BATCH_SIZE,
};

/// Store primitives that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Subscribe,
    Add,
    Update,
    Delete,
    Commit,
}

// ============================================================================
// Internal state
// ============================================================================

struct Feed {
    id: u64,
    collection_path: String,
    constraints: Vec<QueryConstraint>,
    listener: Arc<dyn ChangeListener>,
    /// Result list as last reported to the listener.
    view: Vec<(String, Value)>,
    /// False until the initial snapshot has been delivered.
    primed: bool,
}

enum Write {
    Put { collection: String, id: String, record: Value },
    Merge { collection: String, id: String, partial: Value },
    Delete { collection: String, id: String },
}

impl Write {
    fn collection(&self) -> &str {
        match self {
            Write::Put { collection, .. }
            | Write::Merge { collection, .. }
            | Write::Delete { collection, .. } => collection,
        }
    }

    fn id(&self) -> &str {
        match self {
            Write::Put { id, .. } | Write::Merge { id, .. } | Write::Delete { id, .. } => id,
        }
    }

    fn document_path(&self) -> String {
        format!("{}/{}", self.collection(), self.id())
    }
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    feeds: Vec<Feed>,
    next_feed_id: u64,
    next_doc_id: u64,
    latency_compensation: bool,
    hold_snapshots: bool,
    failures: HashMap<MemoryOp, VecDeque<StoreError>>,
    rejected_paths: HashSet<String>,
    commits: Vec<Vec<String>>,
    commit_attempts: usize,
}

impl MemoryState {
    fn take_failure(&mut self, op: MemoryOp) -> Option<StoreError> {
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn rows(&self, collection_path: &str) -> Vec<(String, Value)> {
        self.collections
            .get(collection_path)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Re-run every primed feed on `collection_path` and collect the changes.
    fn refresh(&mut self, collection_path: &str, pending: &HashSet<String>) -> Vec<Delivery> {
        let rows = self.rows(collection_path);
        let mut deliveries = Vec::new();
        for feed in self
            .feeds
            .iter_mut()
            .filter(|f| f.primed && f.collection_path == collection_path)
        {
            let next = execute(rows.clone(), &feed.constraints);
            let changes = diff(&feed.view, &next, pending);
            feed.view = next;
            if !changes.is_empty() {
                deliveries.push((Arc::clone(&feed.listener), ChangeBatch::new(changes)));
            }
        }
        deliveries
    }

    /// Server acknowledgement of `ids`: an unflagged modified entry for each
    /// acknowledged document still in a feed's view.
    fn acknowledge(&self, collection_path: &str, ids: &HashSet<String>) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for feed in self
            .feeds
            .iter()
            .filter(|f| f.primed && f.collection_path == collection_path)
        {
            let changes: Vec<DocumentChange> = feed
                .view
                .iter()
                .enumerate()
                .filter(|(_, (id, _))| ids.contains(id))
                .map(|(i, (id, data))| {
                    DocumentChange::modified(id.clone(), data.clone())
                        .from_index(i)
                        .at(i)
                })
                .collect();
            if !changes.is_empty() {
                deliveries.push((Arc::clone(&feed.listener), ChangeBatch::new(changes)));
            }
        }
        deliveries
    }
}

type Delivery = (Arc<dyn ChangeListener>, ChangeBatch);

fn deliver(deliveries: Vec<Delivery>) {
    for (listener, batch) in deliveries {
        listener.on_changes(batch);
    }
}

/// Changes that turn `old` into `new`.
///
/// Removals come first, then one pass over `new` in order: each entry is
/// either added at its index, or reported as modified when its data changed
/// or it moved. Applying the entries in sequence reproduces `new`.
fn diff(
    old: &[(String, Value)],
    new: &[(String, Value)],
    pending: &HashSet<String>,
) -> Vec<DocumentChange> {
    let new_ids: HashSet<&str> = new.iter().map(|(id, _)| id.as_str()).collect();
    let old_data: HashMap<&str, &Value> = old.iter().map(|(id, v)| (id.as_str(), v)).collect();

    let mut changes = Vec::new();
    let mut current: Vec<&str> = Vec::with_capacity(old.len());
    for (id, data) in old {
        if new_ids.contains(id.as_str()) {
            current.push(id);
        } else {
            // Earlier removals already shifted this entry down.
            let mut change = DocumentChange::removed(id.clone()).from_index(current.len());
            change.data = data.clone();
            changes.push(change);
        }
    }

    for (i, (id, data)) in new.iter().enumerate() {
        let flag = |change: DocumentChange| {
            if pending.contains(id) {
                change.pending()
            } else {
                change
            }
        };
        match old_data.get(id.as_str()) {
            None => {
                current.insert(i.min(current.len()), id.as_str());
                changes.push(flag(DocumentChange::added(id.clone(), data.clone()).at(i)));
            }
            Some(previous) => {
                let position = current.iter().position(|c| *c == id.as_str()).unwrap_or(i);
                if position != i || *previous != data {
                    current.remove(position);
                    current.insert(i.min(current.len()), id.as_str());
                    changes.push(flag(
                        DocumentChange::modified(id.clone(), data.clone())
                            .from_index(position)
                            .at(i),
                    ));
                }
            }
        }
    }

    changes
}

// ============================================================================
// MemoryStore
// ============================================================================

/// Cheaply cloneable handle to one shared in-memory database.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    max_batch_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    // -----------------------------------------------------------------------
    // Behaviour switches
    // -----------------------------------------------------------------------

    /// Echo local writes as pending first, then confirm them.
    pub fn set_latency_compensation(&self, enabled: bool) {
        self.state.lock().latency_compensation = enabled;
    }

    /// Hold back initial snapshots of new feeds until `release_snapshots`.
    pub fn hold_snapshots(&self, hold: bool) {
        self.state.lock().hold_snapshots = hold;
    }

    /// Deliver the initial snapshot of every feed still waiting for one.
    pub fn release_snapshots(&self) {
        let deliveries = {
            let mut st = self.state.lock();
            st.hold_snapshots = false;
            let mut deliveries = Vec::new();
            let collections: Vec<String> = st
                .feeds
                .iter()
                .filter(|f| !f.primed)
                .map(|f| f.collection_path.clone())
                .collect();
            for path in collections {
                let rows = st.rows(&path);
                for feed in st
                    .feeds
                    .iter_mut()
                    .filter(|f| !f.primed && f.collection_path == path)
                {
                    deliveries.push(prime(feed, rows.clone()));
                }
            }
            deliveries
        };
        deliver(deliveries);
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: MemoryOp, error: StoreError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Reject, as a whole, every batch that writes `document_path`.
    pub fn reject_commits_touching(&self, document_path: impl Into<String>) {
        self.state.lock().rejected_paths.insert(document_path.into());
    }

    pub fn clear_faults(&self) {
        let mut st = self.state.lock();
        st.failures.clear();
        st.rejected_paths.clear();
    }

    /// Terminate every feed on `collection_path` with `error`.
    pub fn fail_feeds(&self, collection_path: &str, error: StoreError) {
        let listeners: Vec<Arc<dyn ChangeListener>> = {
            let mut st = self.state.lock();
            let (failed, kept): (Vec<Feed>, Vec<Feed>) = std::mem::take(&mut st.feeds)
                .into_iter()
                .partition(|f| f.collection_path == collection_path);
            st.feeds = kept;
            failed.into_iter().map(|f| f.listener).collect()
        };
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }

    /// Deliver `batch` verbatim to the feeds on `collection_path`, bypassing
    /// the stored data. Used to script feed edge cases.
    pub fn inject(&self, collection_path: &str, batch: ChangeBatch) {
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .state
            .lock()
            .feeds
            .iter()
            .filter(|f| f.primed && f.collection_path == collection_path)
            .map(|f| Arc::clone(&f.listener))
            .collect();
        for listener in listeners {
            listener.on_changes(batch.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Writes from other clients
    // -----------------------------------------------------------------------

    /// Create or replace a document as another client would.
    pub fn set(&self, document_path: &str, record: Value) -> StoreResult<()> {
        let (collection, id) = parse_document_path(document_path)?;
        self.apply(
            None,
            vec![Write::Put {
                collection,
                id,
                record,
            }],
            false,
        )
    }

    /// Delete a document as another client would.
    pub fn remove(&self, document_path: &str) -> StoreResult<()> {
        let (collection, id) = parse_document_path(document_path)?;
        self.apply(None, vec![Write::Delete { collection, id }], false)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn get(&self, document_path: &str) -> Option<Value> {
        let (collection, id) = split_document_path(document_path)?;
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn len(&self, collection_path: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection_path)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection_path: &str) -> bool {
        self.len(collection_path) == 0
    }

    /// Number of open feeds on `collection_path`.
    pub fn feed_count(&self, collection_path: &str) -> usize {
        self.state
            .lock()
            .feeds
            .iter()
            .filter(|f| f.collection_path == collection_path)
            .count()
    }

    /// Document paths of every successfully committed batch, in commit order.
    pub fn commits(&self) -> Vec<Vec<String>> {
        self.state.lock().commits.clone()
    }

    /// Number of `commit` calls, successful or not.
    pub fn commit_attempts(&self) -> usize {
        self.state.lock().commit_attempts
    }

    // -----------------------------------------------------------------------
    // Write pipeline
    // -----------------------------------------------------------------------

    /// Apply `writes` atomically, then notify feeds.
    ///
    /// `op` selects which injected failure applies; `None` for writes by
    /// other clients. `local` marks the writes as this client's own, which
    /// enables the pending/confirmed echo pair under latency compensation.
    fn apply(&self, op: Option<MemoryOp>, writes: Vec<Write>, local: bool) -> StoreResult<()> {
        let (echoes, acks) = {
            let mut st = self.state.lock();

            if op == Some(MemoryOp::Commit) {
                st.commit_attempts += 1;
            }
            if let Some(error) = op.and_then(|op| st.take_failure(op)) {
                return Err(error);
            }
            if op == Some(MemoryOp::Commit) {
                if writes.len() > self.max_batch_size {
                    return Err(StoreError::invalid_argument(format!(
                        "batch of {} writes exceeds the limit of {}",
                        writes.len(),
                        self.max_batch_size
                    )));
                }
                if let Some(path) = writes
                    .iter()
                    .map(Write::document_path)
                    .find(|path| st.rejected_paths.contains(path))
                {
                    return Err(StoreError::aborted(format!(
                        "batch rejected: write to \"{path}\" was refused"
                    )));
                }
            }
            for write in &writes {
                if let Write::Merge { collection, id, .. } = write {
                    let exists = st
                        .collections
                        .get(collection)
                        .map(|docs| docs.contains_key(id))
                        .unwrap_or(false);
                    if !exists {
                        return Err(StoreError::not_found(&write.document_path()));
                    }
                }
            }

            let mut touched: BTreeMap<String, HashSet<String>> = BTreeMap::new();
            let mut committed = Vec::with_capacity(writes.len());
            for write in writes {
                committed.push(write.document_path());
                touched
                    .entry(write.collection().to_string())
                    .or_default()
                    .insert(write.id().to_string());
                match write {
                    Write::Put {
                        collection,
                        id,
                        record,
                    } => {
                        st.collections.entry(collection).or_default().insert(id, record);
                    }
                    Write::Merge {
                        collection,
                        id,
                        partial,
                    } => {
                        let docs = st.collections.entry(collection).or_default();
                        if let Some(existing) = docs.get_mut(&id) {
                            *existing = merge(existing, &partial);
                        }
                    }
                    Write::Delete { collection, id } => {
                        if let Some(docs) = st.collections.get_mut(&collection) {
                            docs.remove(&id);
                        }
                    }
                }
            }
            if op == Some(MemoryOp::Commit) {
                debug!(writes = committed.len(), "memory store committed batch");
                st.commits.push(committed);
            }

            let compensate = local && st.latency_compensation;
            let none = HashSet::new();
            let mut echoes = Vec::new();
            let mut acks = Vec::new();
            for (collection, ids) in &touched {
                let pending = if compensate { ids } else { &none };
                echoes.extend(st.refresh(collection, pending));
                if compensate {
                    acks.extend(st.acknowledge(collection, ids));
                }
            }
            (echoes, acks)
        };

        deliver(echoes);
        deliver(acks);
        Ok(())
    }
}

/// Deliver a feed's initial snapshot: every current row as `Added`.
fn prime(feed: &mut Feed, rows: Vec<(String, Value)>) -> Delivery {
    let view = execute(rows, &feed.constraints);
    let changes = diff(&[], &view, &HashSet::new());
    feed.view = view;
    feed.primed = true;
    (Arc::clone(&feed.listener), ChangeBatch::new(changes))
}

fn parse_document_path(path: &str) -> StoreResult<(String, String)> {
    split_document_path(path)
        .map(|(collection, id)| (collection.to_string(), id.to_string()))
        .ok_or_else(|| StoreError::invalid_argument(format!("\"{path}\" is not a document path")))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn subscribe(
        &self,
        collection_path: &str,
        constraints: &[QueryConstraint],
        listener: Arc<dyn ChangeListener>,
    ) -> StoreResult<SubscriptionHandle> {
        let (feed_id, initial) = {
            let mut st = self.state.lock();
            if let Some(error) = st.take_failure(MemoryOp::Subscribe) {
                return Err(error);
            }
            st.next_feed_id += 1;
            let feed_id = st.next_feed_id;
            let mut feed = Feed {
                id: feed_id,
                collection_path: collection_path.to_string(),
                constraints: constraints.to_vec(),
                listener,
                view: Vec::new(),
                primed: false,
            };
            let initial = if st.hold_snapshots {
                None
            } else {
                Some(prime(&mut feed, st.rows(collection_path)))
            };
            st.feeds.push(feed);
            (feed_id, initial)
        };

        let weak = Arc::downgrade(&self.state);
        let handle = SubscriptionHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().feeds.retain(|f| f.id != feed_id);
            }
        });

        if let Some((listener, batch)) = initial {
            listener.on_changes(batch);
        }
        Ok(handle)
    }

    async fn add(&self, collection_path: &str, record: Value) -> StoreResult<String> {
        if !record.is_object() {
            return Err(StoreError::invalid_argument("records must be objects"));
        }
        let id = {
            let mut st = self.state.lock();
            st.next_doc_id += 1;
            format!("doc{:06}", st.next_doc_id)
        };
        self.apply(
            Some(MemoryOp::Add),
            vec![Write::Put {
                collection: collection_path.to_string(),
                id: id.clone(),
                record,
            }],
            true,
        )?;
        Ok(id)
    }

    async fn update(&self, document_path: &str, partial: Value) -> StoreResult<()> {
        let (collection, id) = parse_document_path(document_path)?;
        self.apply(
            Some(MemoryOp::Update),
            vec![Write::Merge {
                collection,
                id,
                partial,
            }],
            true,
        )
    }

    async fn delete(&self, document_path: &str) -> StoreResult<()> {
        let (collection, id) = parse_document_path(document_path)?;
        self.apply(
            Some(MemoryOp::Delete),
            vec![Write::Delete { collection, id }],
            true,
        )
    }

    fn batch(&self) -> Box<dyn WriteBatch> {
        Box::new(MemoryBatch {
            store: self.clone(),
            writes: Vec::new(),
        })
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

struct MemoryBatch {
    store: MemoryStore,
    writes: Vec<(String, Value)>,
}

#[async_trait]
impl WriteBatch for MemoryBatch {
    fn update(&mut self, document_path: &str, record: Value) {
        self.writes.push((document_path.to_string(), record));
    }

    fn len(&self) -> usize {
        self.writes.len()
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryBatch { store, writes } = *self;
        let writes = writes
            .into_iter()
            .map(|(path, partial)| {
                parse_document_path(&path).map(|(collection, id)| Write::Merge {
                    collection,
                    id,
                    partial,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        store.apply(Some(MemoryOp::Commit), writes, true)
    }
}
