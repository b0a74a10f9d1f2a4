//! Record shape checking.
//!
//! Mirrors consume validation through the [`SchemaValidator`] trait only, so
//! any validator can be plugged in. [`Schema`] is the bundled implementation:
//! a flat map of named fields, each with a [`SchemaNode`] type and a default.

pub mod node;
pub mod validate;

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ValidationErrors;

pub use node::{t, LiteralValue, SchemaNode};
pub use validate::validate;

use validate::{type_name, walk, ValidationContext};

/// Validates candidate records and supplies the baseline for new documents.
pub trait SchemaValidator: Send + Sync {
    /// Check `candidate` and return the validated record with defaults filled
    /// in. Never mutates shared state.
    fn validate(&self, candidate: &Value) -> Result<Value, ValidationErrors>;

    /// A fresh defaulted record, used when no remote data is known yet.
    fn defaults(&self) -> Value;
}

#[derive(Debug, Clone)]
struct FieldDef {
    node: SchemaNode,
    default: Value,
}

/// Field-map schema.
///
/// ```
/// use live_mirror::schema::{t, Schema, SchemaValidator};
/// use serde_json::json;
///
/// let todo = Schema::new()
///     .field("name", t::string())
///     .field("index", t::integer())
///     .field("done", t::boolean());
///
/// assert_eq!(todo.defaults(), json!({"name": "", "index": 0, "done": false}));
/// assert!(todo.validate(&json!({"done": "yes"})).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, FieldDef>,
    strict: bool,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field whose default is the node's zero value.
    pub fn field(self, name: impl Into<String>, node: SchemaNode) -> Self {
        let default = node.zero_value();
        self.field_with_default(name, node, default)
    }

    /// Declare a field with an explicit default.
    pub fn field_with_default(
        mut self,
        name: impl Into<String>,
        node: SchemaNode,
        default: Value,
    ) -> Self {
        self.fields.insert(name.into(), FieldDef { node, default });
        self
    }

    /// Reject fields that were not declared. Undeclared fields pass through
    /// untouched otherwise.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl SchemaValidator for Schema {
    fn validate(&self, candidate: &Value) -> Result<Value, ValidationErrors> {
        let map = match candidate.as_object() {
            Some(map) => map,
            None => {
                return Err(ValidationErrors::single("", "object", type_name(candidate)));
            }
        };

        let mut ctx = ValidationContext::new();
        let mut result = Map::new();

        for (key, field) in &self.fields {
            ctx.push_key(key);
            let value = map.get(key).unwrap_or(&field.default);
            result.insert(key.clone(), walk(&field.node, value, &mut ctx, 1));
            ctx.pop();
        }

        for (key, value) in map {
            if self.fields.contains_key(key) {
                continue;
            }
            if self.strict {
                ctx.push_key(key);
                ctx.add_error("no such field", type_name(value));
                ctx.pop();
            } else {
                result.insert(key.clone(), value.clone());
            }
        }

        ctx.finish().map(|()| Value::Object(result))
    }

    fn defaults(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(key, field)| (key.clone(), field.default.clone()))
                .collect(),
        )
    }
}
