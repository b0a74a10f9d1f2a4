//! MemoryStore tests: feed diffing, echoes, fault injection and batches.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use live_mirror::error::{StoreError, StoreErrorKind};
use live_mirror::query::{filter, order_by, FilterOp};
use live_mirror::store::{
    ChangeBatch, ChangeKind, ChangeListener, DocumentChange, MemoryOp, MemoryStore, RemoteStore,
};

// ============================================================================
// Recording listener
// ============================================================================

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<ChangeBatch>>,
    errors: Mutex<Vec<StoreError>>,
}

impl Recorder {
    fn batches(&self) -> Vec<ChangeBatch> {
        self.batches.lock().clone()
    }

    fn last(&self) -> ChangeBatch {
        self.batches.lock().last().cloned().unwrap_or_default()
    }
}

impl ChangeListener for Recorder {
    fn on_changes(&self, batch: ChangeBatch) {
        self.batches.lock().push(batch);
    }

    fn on_error(&self, error: StoreError) {
        self.errors.lock().push(error);
    }
}

fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    store.set("todos/a", json!({"name": "write", "index": 2})).unwrap();
    store.set("todos/b", json!({"name": "read", "index": 0})).unwrap();
    store.set("todos/c", json!({"name": "sleep", "index": 1})).unwrap();
    store
}

fn ids(changes: &[DocumentChange]) -> Vec<&str> {
    changes.iter().map(|c| c.id.as_str()).collect()
}

// ============================================================================
// Feeds
// ============================================================================

#[tokio::test]
async fn initial_snapshot_lists_matches_in_query_order() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store
        .subscribe("todos", &[order_by("index")], rec.clone())
        .await
        .unwrap();

    let first = rec.last();
    assert_eq!(ids(&first.changes), vec!["b", "c", "a"]);
    assert!(first.changes.iter().all(|c| c.kind == ChangeKind::Added));
    let indices: Vec<_> = first.changes.iter().map(|c| c.new_index).collect();
    assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn writes_are_reported_to_open_feeds() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store
        .subscribe("todos", &[order_by("index")], rec.clone())
        .await
        .unwrap();

    let id = store.add("todos", json!({"name": "eat", "index": 3})).await.unwrap();
    let added = rec.last();
    assert_eq!(added.changes[0].kind, ChangeKind::Added);
    assert_eq!(added.changes[0].id, id);
    assert_eq!(added.changes[0].new_index, Some(3));

    store.update("todos/b", json!({"index": 9})).await.unwrap();
    let moved = rec.last();
    let change = moved.changes.iter().find(|c| c.id == "b").unwrap();
    assert_eq!(change.kind, ChangeKind::Modified);
    assert_eq!(change.data, json!({"name": "read", "index": 9}));

    store.delete("todos/c").await.unwrap();
    let removed = rec.last();
    assert_eq!(removed.changes.len(), 1);
    assert_eq!(removed.changes[0].kind, ChangeKind::Removed);
    assert_eq!(removed.changes[0].old_index, Some(0));
}

#[tokio::test]
async fn removal_indices_follow_earlier_removals() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store
        .subscribe(
            "todos",
            &[filter("index", FilterOp::Lt, json!(2)), order_by("index")],
            rec.clone(),
        )
        .await
        .unwrap();

    let mut batch = store.batch();
    batch.update("todos/b", json!({"index": 5}));
    batch.update("todos/c", json!({"index": 6}));
    batch.commit().await.unwrap();

    let removed = rec.last();
    assert_eq!(ids(&removed.changes), vec!["b", "c"]);
    let indices: Vec<_> = removed.changes.iter().map(|c| c.old_index).collect();
    assert_eq!(indices, vec![Some(0), Some(0)]);
}

#[tokio::test]
async fn leaving_the_filter_is_a_removal() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store
        .subscribe("todos", &[filter("index", FilterOp::Lt, json!(2))], rec.clone())
        .await
        .unwrap();
    assert_eq!(rec.last().len(), 2);

    store.update("todos/b", json!({"index": 5})).await.unwrap();
    let batch = rec.last();
    assert_eq!(batch.changes[0].kind, ChangeKind::Removed);
    assert_eq!(batch.changes[0].id, "b");
}

#[tokio::test]
async fn writes_to_other_collections_are_not_reported() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    store.set("notes/x", json!({"body": "hi"})).unwrap();
    assert_eq!(rec.batches().len(), 1);
}

#[tokio::test]
async fn cancelled_feed_stops_delivering() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();
    assert_eq!(store.feed_count("todos"), 1);

    handle.cancel();
    assert_eq!(store.feed_count("todos"), 0);

    store.set("todos/d", json!({"name": "new"})).unwrap();
    assert_eq!(rec.batches().len(), 1);
}

#[tokio::test]
async fn dropping_the_handle_cancels_the_feed() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    {
        let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();
    }
    assert_eq!(store.feed_count("todos"), 0);
}

// ============================================================================
// Latency compensation and held snapshots
// ============================================================================

#[tokio::test]
async fn local_writes_are_echoed_then_confirmed() {
    let store = seeded();
    store.set_latency_compensation(true);
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    store.update("todos/a", json!({"name": "rewrite"})).await.unwrap();

    let batches = rec.batches();
    assert_eq!(batches.len(), 3);
    let echo = &batches[1].changes[0];
    let ack = &batches[2].changes[0];
    assert!(echo.has_pending_writes);
    assert!(!ack.has_pending_writes);
    assert_eq!(ack.kind, ChangeKind::Modified);
    assert_eq!(ack.data["name"], json!("rewrite"));
}

#[tokio::test]
async fn writes_from_other_clients_are_never_pending() {
    let store = seeded();
    store.set_latency_compensation(true);
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    store.set("todos/a", json!({"name": "theirs"})).unwrap();

    let batches = rec.batches();
    assert_eq!(batches.len(), 2);
    assert!(!batches[1].changes[0].has_pending_writes);
}

#[tokio::test]
async fn held_snapshots_wait_for_release() {
    let store = seeded();
    store.hold_snapshots(true);
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    store.set("todos/d", json!({"name": "new"})).unwrap();
    assert!(rec.batches().is_empty());

    store.release_snapshots();
    let batches = rec.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(ids(&batches[0].changes), vec!["a", "b", "c", "d"]);
}

// ============================================================================
// Faults
// ============================================================================

#[tokio::test]
async fn injected_failures_apply_once() {
    let store = MemoryStore::new();
    store.fail_next(MemoryOp::Add, StoreError::unavailable("offline"));

    let err = store.add("todos", json!({"name": "x"})).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Unavailable);
    assert_eq!(store.len("todos"), 0);

    store.add("todos", json!({"name": "x"})).await.unwrap();
    assert_eq!(store.len("todos"), 1);
}

#[tokio::test]
async fn failed_subscribe_registers_nothing() {
    let store = seeded();
    store.fail_next(MemoryOp::Subscribe, StoreError::unavailable("offline"));
    let rec = Arc::new(Recorder::default());

    let err = store.subscribe("todos", &[], rec.clone()).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Unavailable);
    assert_eq!(store.feed_count("todos"), 0);
    assert!(rec.batches().is_empty());
}

#[tokio::test]
async fn update_of_missing_document_is_not_found() {
    let store = MemoryStore::new();
    let err = store.update("todos/ghost", json!({"a": 1})).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::NotFound);
}

#[tokio::test]
async fn delete_of_missing_document_succeeds() {
    let store = MemoryStore::new();
    store.delete("todos/ghost").await.unwrap();
}

#[tokio::test]
async fn fail_feeds_reports_error_and_closes_feed() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    store.fail_feeds("todos", StoreError::new(StoreErrorKind::PermissionDenied, "revoked"));

    assert_eq!(rec.errors.lock().len(), 1);
    assert_eq!(store.feed_count("todos"), 0);
}

#[tokio::test]
async fn inject_delivers_verbatim() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    let scripted = ChangeBatch::new(vec![DocumentChange::modified("zz", Value::Null).pending()]);
    store.inject("todos", scripted.clone());
    assert_eq!(rec.last(), scripted);
    assert_eq!(store.len("todos"), 3);
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn batch_commits_all_writes_and_is_recorded() {
    let store = seeded();
    let mut batch = store.batch();
    batch.update("todos/a", json!({"done": true}));
    batch.update("todos/b", json!({"done": true}));
    assert_eq!(batch.len(), 2);
    batch.commit().await.unwrap();

    assert_eq!(store.get("todos/a").unwrap()["done"], json!(true));
    assert_eq!(store.get("todos/b").unwrap()["done"], json!(true));
    assert_eq!(
        store.commits(),
        vec![vec!["todos/a".to_string(), "todos/b".to_string()]]
    );
}

#[tokio::test]
async fn rejected_batch_writes_nothing() {
    let store = seeded();
    store.reject_commits_touching("todos/b");

    let mut batch = store.batch();
    batch.update("todos/a", json!({"done": true}));
    batch.update("todos/b", json!({"done": true}));
    let err = batch.commit().await.unwrap_err();

    assert_eq!(err.kind, StoreErrorKind::Aborted);
    assert_eq!(store.get("todos/a").unwrap().get("done"), None);
    assert!(store.commits().is_empty());
    assert_eq!(store.commit_attempts(), 1);
}

#[tokio::test]
async fn batch_with_missing_document_writes_nothing() {
    let store = seeded();
    let mut batch = store.batch();
    batch.update("todos/a", json!({"done": true}));
    batch.update("todos/ghost", json!({"done": true}));
    let err = batch.commit().await.unwrap_err();

    assert_eq!(err.kind, StoreErrorKind::NotFound);
    assert_eq!(store.get("todos/a").unwrap().get("done"), None);
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let store = seeded().with_max_batch_size(2);
    assert_eq!(store.max_batch_size(), 2);

    let mut batch = store.batch();
    for id in ["a", "b", "c"] {
        batch.update(&format!("todos/{id}"), json!({"done": true}));
    }
    let err = batch.commit().await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::InvalidArgument);
}

#[tokio::test]
async fn committed_batch_notifies_feed_once() {
    let store = seeded();
    let rec = Arc::new(Recorder::default());
    let _handle = store.subscribe("todos", &[], rec.clone()).await.unwrap();

    let mut batch = store.batch();
    batch.update("todos/a", json!({"done": true}));
    batch.update("todos/c", json!({"done": true}));
    batch.commit().await.unwrap();

    let batches = rec.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(ids(&batches[1].changes), vec!["a", "c"]);
}
