//! Record helpers shared by documents, collections and stores.
//!
//! Records are JSON objects (`serde_json::Value::Object`). Partial records are
//! merged shallowly: top-level keys in the partial replace the base's keys.

use serde_json::{Map, Value};

/// Key under which flattened snapshots carry the document id.
pub const ID_FIELD: &str = "id";

/// Shallow-merge `partial` over `base`, returning a new record.
///
/// Non-object inputs are treated as empty objects, so the result is always an
/// object.
pub fn merge(base: &Value, partial: &Value) -> Value {
    let mut merged = as_map(base);
    if let Some(patch) = partial.as_object() {
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// `data` with `id` inserted, as exposed by a collection's flattened snapshot.
pub fn with_id(id: &str, data: &Value) -> Value {
    let mut map = as_map(data);
    map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

fn as_map(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Join a parent path and a child segment with `/`.
///
/// The root parent has an empty path, so top-level collections are addressed
/// by their bare name.
pub fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}/{segment}")
    }
}

/// Split a document path into `(collection path, document id)`.
pub fn split_document_path(path: &str) -> Option<(&str, &str)> {
    let (collection, id) = path.rsplit_once('/')?;
    if collection.is_empty() || id.is_empty() {
        return None;
    }
    Some((collection, id))
}
