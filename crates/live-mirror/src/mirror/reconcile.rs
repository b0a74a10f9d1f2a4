//! Applying change-feed batches to a collection's document list.
//!
//! Membership is decided here and nowhere else. Payloads are not applied
//! directly: the remote updates a batch implies are returned so the caller
//! can dispatch them once its own lock is released.

use serde_json::Value;

use crate::{
    store::{ChangeBatch, ChangeKind, DocumentChange},
    types::with_id,
};

use super::document::Mirrored;

/// A document produced for an id the list does not hold yet.
pub(crate) struct Created<D> {
    pub document: D,
    /// True when the document was built before this change (a pending add)
    /// and still needs the change's payload.
    pub reused: bool,
}

/// Apply `batch` to `documents` in delivery order.
///
/// - `Added` inserts at `new_index` (or appends); an id already present is
///   treated as a modification, so a document never appears twice.
/// - `Modified` moves the document to `new_index` and applies the payload,
///   unless the change is an unconfirmed echo of this client's own write.
///   An unknown id is inserted.
/// - `Removed` drops the document by id.
///
/// `create` builds documents for ids not in the list. Returns the
/// `(document, payload)` pairs to ingest, in order.
pub(crate) fn apply_batch<D: Mirrored>(
    documents: &mut Vec<D>,
    batch: &ChangeBatch,
    mut create: impl FnMut(&DocumentChange) -> Created<D>,
) -> Vec<(D, Value)> {
    let mut updates = Vec::new();

    for change in &batch.changes {
        let existing = position(documents, &change.id);
        match (change.kind, existing) {
            (ChangeKind::Removed, Some(pos)) => {
                documents.remove(pos);
            }
            (ChangeKind::Removed, None) => {}
            (ChangeKind::Added | ChangeKind::Modified, Some(pos)) => {
                let pos = reposition(documents, pos, change.new_index);
                if !change.has_pending_writes {
                    updates.push((documents[pos].clone(), change.data.clone()));
                }
            }
            (ChangeKind::Added | ChangeKind::Modified, None) => {
                let Created { document, reused } = create(change);
                if reused && !change.has_pending_writes {
                    updates.push((document.clone(), change.data.clone()));
                }
                match change.new_index {
                    Some(index) => documents.insert(index.min(documents.len()), document),
                    None => documents.push(document),
                }
            }
        }
    }

    updates
}

fn position<D: Mirrored>(documents: &[D], id: &str) -> Option<usize> {
    documents.iter().position(|d| d.mirror().id() == id)
}

fn reposition<D: Mirrored>(documents: &mut Vec<D>, from: usize, to: Option<usize>) -> usize {
    match to {
        Some(to) if to != from => {
            let document = documents.remove(from);
            let to = to.min(documents.len());
            documents.insert(to, document);
            to
        }
        _ => from,
    }
}

/// Flattened view: each document's data with its id merged in.
pub(crate) fn flatten<D: Mirrored>(documents: &[D]) -> Vec<Value> {
    documents
        .iter()
        .map(|d| with_id(d.mirror().id(), &d.mirror().data()))
        .collect()
}

/// Split `items` into consecutive groups of at most `ceiling` items.
pub(crate) fn partition<T>(items: Vec<T>, ceiling: usize) -> Vec<Vec<T>> {
    let ceiling = ceiling.max(1);
    let mut groups = Vec::with_capacity(items.len().div_ceil(ceiling));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        groups.push(iter.by_ref().take(ceiling).collect());
    }
    groups
}
