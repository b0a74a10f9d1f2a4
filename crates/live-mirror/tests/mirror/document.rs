//! MirrorDocument tests: the Synced / Dirty / Saving state machine, remote
//! ingestion, optimistic update with rollback.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use live_mirror::error::StoreError;
use live_mirror::query::QueryConstraint;
use live_mirror::reactive::DocumentEvent;
use live_mirror::schema::{t, Schema};
use live_mirror::store::{
    ChangeBatch, ChangeListener, DocumentChange, MemoryOp, MemoryStore, RemoteStore, StoreResult,
    SubscriptionHandle, WriteBatch,
};
use live_mirror::{
    DocumentInit, MirrorCollection, MirrorDatabase, MirrorDocument, MirrorError, SyncState,
};

fn todo_schema() -> Schema {
    Schema::new()
        .field("name", t::string())
        .field("done", t::boolean())
}

/// A subscribed collection holding `todos/a`.
async fn mirrored() -> (MemoryStore, MirrorCollection, MirrorDocument) {
    let store = MemoryStore::new();
    store.set("todos/a", json!({"name": "write", "done": false})).unwrap();
    let db = MirrorDatabase::new(store.clone());
    let todos = MirrorCollection::builder(&db, "todos")
        .schema(todo_schema())
        .build()
        .unwrap();
    todos.subscribe().await.unwrap();
    let doc = todos.get("a").unwrap();
    (store, todos, doc)
}

fn record_events(doc: &MirrorDocument) -> Arc<Mutex<Vec<DocumentEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    doc.on_change(move |event| sink.lock().push(*event));
    log
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn new_document_starts_synced_with_defaults() {
    let doc = MirrorDocument::from_init(DocumentInit {
        id: "fresh".to_string(),
        parent_path: "todos".to_string(),
        store: Arc::new(MemoryStore::new()),
        schema: Arc::new(todo_schema()),
        data: None,
    });

    assert_eq!(doc.path(), "todos/fresh");
    assert_eq!(doc.sync_state(), SyncState::Synced);
    assert_eq!(doc.data(), json!({"name": "", "done": false}));
    assert_eq!(doc.original_data(), doc.data());
    assert_eq!(doc.latest_remote_data(), None);
}

// ============================================================================
// Local edits and remote updates
// ============================================================================

#[tokio::test]
async fn update_local_marks_dirty_without_writing() {
    let (store, _todos, doc) = mirrored().await;
    let events = record_events(&doc);

    doc.update_local(json!({"name": "rewrite"}));

    assert_eq!(doc.sync_state(), SyncState::Dirty);
    assert_eq!(doc.get("name"), Some(json!("rewrite")));
    assert_eq!(doc.original_data()["name"], json!("write"));
    assert_eq!(store.get("todos/a").unwrap()["name"], json!("write"));
    assert_eq!(*events.lock(), vec![DocumentEvent::LocalEdit]);
}

#[tokio::test]
async fn synced_document_tracks_remote_updates() {
    let (store, _todos, doc) = mirrored().await;

    store.set("todos/a", json!({"name": "theirs", "done": true})).unwrap();

    assert!(doc.is_synced());
    assert_eq!(doc.data(), json!({"name": "theirs", "done": true}));
    assert_eq!(doc.original_data(), doc.data());
    assert_eq!(doc.latest_remote_data(), Some(doc.data()));
}

#[tokio::test]
async fn dirty_document_keeps_local_edit_over_remote_update() {
    let (store, _todos, doc) = mirrored().await;
    doc.update_local(json!({"name": "mine"}));
    let events = record_events(&doc);

    store.set("todos/a", json!({"name": "theirs", "done": true})).unwrap();

    assert!(!doc.is_synced());
    assert_eq!(doc.get("name"), Some(json!("mine")));
    assert_eq!(
        doc.latest_remote_data(),
        Some(json!({"name": "theirs", "done": true}))
    );
    assert_eq!(*events.lock(), vec![DocumentEvent::RemoteUpdate { applied: false }]);
}

#[tokio::test]
async fn discard_local_adopts_latest_remote_value() {
    let (store, _todos, doc) = mirrored().await;
    doc.update_local(json!({"name": "mine"}));
    store.set("todos/a", json!({"name": "theirs", "done": true})).unwrap();

    assert!(doc.discard_local());

    assert!(doc.is_synced());
    assert_eq!(doc.data(), json!({"name": "theirs", "done": true}));
    assert_eq!(doc.original_data(), doc.data());
}

#[tokio::test]
async fn discard_local_on_synced_document_does_nothing() {
    let (_store, _todos, doc) = mirrored().await;
    assert!(!doc.discard_local());
    assert_eq!(doc.get("name"), Some(json!("write")));
}

#[tokio::test]
async fn discard_local_without_remote_value_does_nothing() {
    let doc = MirrorDocument::from_init(DocumentInit {
        id: "fresh".to_string(),
        parent_path: "todos".to_string(),
        store: Arc::new(MemoryStore::new()),
        schema: Arc::new(todo_schema()),
        data: None,
    });
    doc.update_local(json!({"name": "draft"}));

    assert!(!doc.discard_local());
    assert!(!doc.is_synced());
}

#[tokio::test]
async fn pending_echoes_are_not_applied() {
    let (store, _todos, doc) = mirrored().await;
    let events = record_events(&doc);

    store.inject(
        "todos",
        ChangeBatch::new(vec![
            DocumentChange::modified("a", json!({"name": "stale", "done": false})).pending(),
        ]),
    );
    assert_eq!(doc.get("name"), Some(json!("write")));
    assert!(events.lock().is_empty());

    store.inject(
        "todos",
        ChangeBatch::new(vec![DocumentChange::modified(
            "a",
            json!({"name": "confirmed", "done": false}),
        )]),
    );
    assert_eq!(doc.get("name"), Some(json!("confirmed")));
}

// ============================================================================
// save_local
// ============================================================================

#[tokio::test]
async fn save_local_persists_and_syncs() {
    let (store, _todos, doc) = mirrored().await;
    doc.update_local(json!({"done": true}));

    doc.save_local().await.unwrap();

    assert!(doc.is_synced());
    assert_eq!(doc.original_data(), json!({"name": "write", "done": true}));
    assert_eq!(store.get("todos/a"), Some(json!({"name": "write", "done": true})));
}

#[tokio::test]
async fn save_local_failure_stays_dirty() {
    let (store, _todos, doc) = mirrored().await;
    doc.update_local(json!({"done": true}));
    store.fail_next(MemoryOp::Update, StoreError::unavailable("offline"));

    let err = doc.save_local().await.unwrap_err();

    assert!(matches!(err, MirrorError::Persistence { .. }));
    assert_eq!(doc.sync_state(), SyncState::Dirty);
    assert_eq!(doc.get("done"), Some(json!(true)));
    assert_eq!(doc.original_data()["done"], json!(false));
}

#[tokio::test]
async fn save_local_with_invalid_data_writes_nothing() {
    let (store, _todos, doc) = mirrored().await;
    doc.update_local(json!({"done": "maybe"}));

    let err = doc.save_local().await.unwrap_err();

    assert!(matches!(err, MirrorError::Validation { .. }));
    assert!(!doc.is_synced());
    assert_eq!(store.get("todos/a").unwrap()["done"], json!(false));
}

// ============================================================================
// update (optimistic, with rollback)
// ============================================================================

#[tokio::test]
async fn update_success_syncs_with_partial_applied() {
    let (store, _todos, doc) = mirrored().await;
    let events = record_events(&doc);

    doc.update(json!({"done": true})).await.unwrap();

    assert!(doc.is_synced());
    assert_eq!(doc.get("done"), Some(json!(true)));
    assert_eq!(store.get("todos/a").unwrap()["done"], json!(true));
    let events = events.lock();
    assert_eq!(events.first(), Some(&DocumentEvent::LocalEdit));
    assert_eq!(events.last(), Some(&DocumentEvent::Saved));
}

#[tokio::test]
async fn update_failure_rolls_back() {
    let (store, _todos, doc) = mirrored().await;
    let before = doc.data();
    let events = record_events(&doc);
    store.fail_next(MemoryOp::Update, StoreError::unavailable("offline"));

    let err = doc.update(json!({"done": true})).await.unwrap_err();

    assert!(matches!(err, MirrorError::Persistence { .. }));
    assert!(doc.is_synced());
    assert_eq!(doc.data(), before);
    assert_eq!(doc.original_data(), before);
    assert_eq!(
        *events.lock(),
        vec![DocumentEvent::LocalEdit, DocumentEvent::RolledBack]
    );
}

#[tokio::test]
async fn update_failure_on_dirty_document_keeps_earlier_edit() {
    let (store, _todos, doc) = mirrored().await;
    doc.update_local(json!({"name": "draft"}));
    store.fail_next(MemoryOp::Update, StoreError::unavailable("offline"));

    doc.update(json!({"done": true})).await.unwrap_err();

    assert!(!doc.is_synced());
    assert_eq!(doc.data(), json!({"name": "draft", "done": false}));
    assert_eq!(doc.original_data(), json!({"name": "write", "done": false}));
}

#[tokio::test]
async fn update_with_invalid_partial_changes_nothing() {
    let (_store, _todos, doc) = mirrored().await;
    let before = doc.data();

    let err = doc.update(json!({"done": 1})).await.unwrap_err();

    assert!(matches!(err, MirrorError::Validation { .. }));
    assert_eq!(doc.data(), before);
    assert!(doc.is_synced());
}

#[tokio::test]
async fn update_with_latency_compensation_ignores_its_echo() {
    let (store, _todos, doc) = mirrored().await;
    store.set_latency_compensation(true);

    doc.update(json!({"name": "rewrite"})).await.unwrap();

    assert!(doc.is_synced());
    assert_eq!(doc.data(), json!({"name": "rewrite", "done": false}));
    assert_eq!(doc.latest_remote_data(), Some(doc.data()));
}

#[tokio::test]
async fn delete_requests_removal() {
    let (store, todos, doc) = mirrored().await;

    doc.delete().await.unwrap();

    assert!(store.get("todos/a").is_none());
    assert!(todos.get("a").is_none());
}

// ============================================================================
// Writes overlapping local edits
// ============================================================================

/// Delegates to a `MemoryStore`, holding every `update` until released.
struct GatedStore {
    inner: MemoryStore,
    gate: Notify,
}

#[async_trait]
impl RemoteStore for GatedStore {
    async fn subscribe(
        &self,
        collection_path: &str,
        constraints: &[QueryConstraint],
        listener: Arc<dyn ChangeListener>,
    ) -> StoreResult<SubscriptionHandle> {
        self.inner.subscribe(collection_path, constraints, listener).await
    }

    async fn add(&self, collection_path: &str, record: Value) -> StoreResult<String> {
        self.inner.add(collection_path, record).await
    }

    async fn update(&self, document_path: &str, partial: Value) -> StoreResult<()> {
        self.gate.notified().await;
        self.inner.update(document_path, partial).await
    }

    async fn delete(&self, document_path: &str) -> StoreResult<()> {
        self.inner.delete(document_path).await
    }

    fn batch(&self) -> Box<dyn WriteBatch> {
        self.inner.batch()
    }
}

fn gated() -> (Arc<GatedStore>, MirrorDocument) {
    let memory = MemoryStore::new();
    memory.set("todos/a", json!({"name": "write", "done": false})).unwrap();
    let store = Arc::new(GatedStore {
        inner: memory,
        gate: Notify::new(),
    });
    let doc = MirrorDocument::from_init(DocumentInit {
        id: "a".to_string(),
        parent_path: "todos".to_string(),
        store: store.clone(),
        schema: Arc::new(todo_schema()),
        data: Some(json!({"name": "write", "done": false})),
    });
    (store, doc)
}

#[tokio::test]
async fn edit_during_save_keeps_document_dirty() {
    let (store, doc) = gated();
    doc.update_local(json!({"done": true}));

    let saving = tokio::spawn({
        let doc = doc.clone();
        async move { doc.save_local().await }
    });
    while doc.sync_state() != SyncState::Saving {
        tokio::task::yield_now().await;
    }
    doc.update_local(json!({"name": "later"}));
    store.gate.notify_one();
    saving.await.unwrap().unwrap();

    assert_eq!(doc.sync_state(), SyncState::Dirty);
    assert_eq!(doc.data(), json!({"name": "later", "done": true}));
    assert_eq!(doc.original_data(), json!({"name": "write", "done": true}));
}

#[tokio::test]
async fn update_during_save_settles_with_matching_baseline() {
    let (store, doc) = gated();
    doc.update_local(json!({"done": true}));

    let saving = tokio::spawn({
        let doc = doc.clone();
        async move { doc.save_local().await }
    });
    while doc.sync_state() != SyncState::Saving {
        tokio::task::yield_now().await;
    }
    let updating = tokio::spawn({
        let doc = doc.clone();
        async move { doc.update(json!({"name": "upd"})).await }
    });
    while doc.get("name") != Some(json!("upd")) {
        tokio::task::yield_now().await;
    }

    store.gate.notify_one();
    saving.await.unwrap().unwrap();
    store.gate.notify_one();
    updating.await.unwrap().unwrap();

    assert!(doc.is_synced());
    assert_eq!(doc.data(), json!({"name": "upd", "done": true}));
    assert_eq!(doc.original_data(), doc.data());
    assert!(!doc.discard_local());
    assert_eq!(store.inner.get("todos/a").unwrap(), doc.data());
}

#[tokio::test]
async fn edit_during_update_survives_its_failure() {
    let (store, doc) = gated();
    store.inner.fail_next(MemoryOp::Update, StoreError::unavailable("offline"));

    let updating = tokio::spawn({
        let doc = doc.clone();
        async move { doc.update(json!({"done": true})).await }
    });
    while doc.get("done") != Some(json!(true)) {
        tokio::task::yield_now().await;
    }
    doc.update_local(json!({"name": "later"}));
    store.gate.notify_one();

    assert!(updating.await.unwrap().is_err());
    assert!(!doc.is_synced());
    assert_eq!(doc.data(), json!({"name": "later", "done": true}));
}
