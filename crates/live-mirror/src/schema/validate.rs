use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationErrors};

use super::node::{LiteralValue, SchemaNode};

// ============================================================================
// ISO 8601 Date Regex
// ============================================================================

/// Compiled once at first use.
fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:\d{2})?$")
            .expect("ISO date regex is valid")
    })
}

// ============================================================================
// Validation Context
// ============================================================================

pub(crate) struct ValidationContext {
    errors: Vec<ValidationError>,
    path: Vec<String>,
}

impl ValidationContext {
    pub(crate) fn new() -> Self {
        Self {
            errors: vec![],
            path: vec![],
        }
    }

    pub(crate) fn push_key(&mut self, key: impl Into<String>) {
        self.path.push(key.into());
    }

    fn push_index(&mut self, idx: usize) {
        self.path.push(format!("[{idx}]"));
    }

    pub(crate) fn pop(&mut self) {
        self.path.pop();
    }

    /// Join path segments, collapsing `".[0]"` → `"[0]"`.
    fn current_path(&self) -> String {
        self.path.join(".").replace(".[", "[")
    }

    pub(crate) fn add_error(&mut self, expected: impl Into<String>, received: impl Into<String>) {
        self.errors.push(ValidationError {
            path: self.current_path(),
            expected: expected.into(),
            received: received.into(),
        });
    }

    pub(crate) fn finish(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors))
        }
    }
}

// ============================================================================
// Type Name Helpers
// ============================================================================

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const MAX_DEPTH: usize = 64;

// ============================================================================
// Core Walker
// ============================================================================

/// Walk the schema tree, validate `value`, collect errors into `ctx`.
/// Missing object properties are filled with their zero value before being
/// checked, so partially populated nested objects come back complete.
pub(crate) fn walk(
    schema: &SchemaNode,
    value: &Value,
    ctx: &mut ValidationContext,
    depth: usize,
) -> Value {
    if depth > MAX_DEPTH {
        ctx.add_error(format!("nesting depth <= {MAX_DEPTH}"), "deeper value");
        return value.clone();
    }

    match schema {
        SchemaNode::Any => value.clone(),

        SchemaNode::String => {
            if !value.is_string() {
                ctx.add_error("string", type_name(value));
            }
            value.clone()
        }

        SchemaNode::Number => {
            if !value.is_number() {
                ctx.add_error("number", type_name(value));
            }
            value.clone()
        }

        SchemaNode::Integer => {
            let is_integer = value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false);
            if !is_integer {
                ctx.add_error("integer", type_name(value));
            }
            value.clone()
        }

        SchemaNode::Boolean => {
            if !value.is_boolean() {
                ctx.add_error("boolean", type_name(value));
            }
            value.clone()
        }

        SchemaNode::Date => {
            match value.as_str() {
                Some(s) if iso_date_regex().is_match(s) => {}
                Some(_) => ctx.add_error("ISO 8601 timestamp", "malformed string"),
                None => ctx.add_error("ISO 8601 timestamp", type_name(value)),
            }
            value.clone()
        }

        SchemaNode::Literal(lit) => {
            let matches = match lit {
                LiteralValue::String(s) => value.as_str() == Some(s.as_str()),
                LiteralValue::Number(n) => value
                    .as_f64()
                    .map(|v| v.to_bits() == n.to_bits())
                    .unwrap_or(false),
                LiteralValue::Bool(b) => value.as_bool() == Some(*b),
            };
            if !matches {
                ctx.add_error(literal_display(lit), value_display(value));
            }
            value.clone()
        }

        SchemaNode::Optional(inner) => {
            if value.is_null() {
                Value::Null
            } else {
                walk(inner, value, ctx, depth + 1)
            }
        }

        SchemaNode::Array(element) => match value.as_array() {
            None => {
                ctx.add_error("array", type_name(value));
                value.clone()
            }
            Some(arr) => {
                let mut result = Vec::with_capacity(arr.len());
                for (i, item) in arr.iter().enumerate() {
                    ctx.push_index(i);
                    result.push(walk(element, item, ctx, depth + 1));
                    ctx.pop();
                }
                Value::Array(result)
            }
        },

        SchemaNode::Object(props) => match value.as_object() {
            None => {
                ctx.add_error("object", type_name(value));
                value.clone()
            }
            Some(map) => {
                let mut result = Map::new();
                for (key, prop_schema) in props {
                    ctx.push_key(key);
                    let prop_value = map
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| prop_schema.zero_value());
                    result.insert(key.clone(), walk(prop_schema, &prop_value, ctx, depth + 1));
                    ctx.pop();
                }
                Value::Object(result)
            }
        },

        SchemaNode::Union(variants) => {
            let mut best: Option<(Value, Vec<ValidationError>)> = None;

            for variant in variants {
                let mut temp_ctx = ValidationContext::new();
                // Copy path from parent so error paths are correct
                temp_ctx.path = ctx.path.clone();
                let result = walk(variant, value, &mut temp_ctx, depth + 1);
                if temp_ctx.errors.is_empty() {
                    return result;
                }
                let better = best
                    .as_ref()
                    .map(|(_, errors)| temp_ctx.errors.len() < errors.len())
                    .unwrap_or(true);
                if better {
                    best = Some((result, temp_ctx.errors));
                }
            }

            // All variants failed: report the best matching variant's errors
            match best {
                Some((result, errors)) => {
                    ctx.errors.extend(errors);
                    result
                }
                None => value.clone(),
            }
        }
    }
}

// ============================================================================
// Display Helpers for Literals
// ============================================================================

fn literal_display(lit: &LiteralValue) -> String {
    match lit {
        LiteralValue::String(s) => format!("{s:?}"),
        LiteralValue::Number(n) => {
            // Format without trailing `.0` when it's a whole number
            if n.fract() == 0.0 && n.is_finite() {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        }
        LiteralValue::Bool(b) => b.to_string(),
    }
}

fn value_display(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Validate `value` against `schema`, returning the completed `Value` on
/// success or a `ValidationErrors` collection on failure.
pub fn validate(schema: &SchemaNode, value: &Value) -> Result<Value, ValidationErrors> {
    let mut ctx = ValidationContext::new();
    let result = walk(schema, value, &mut ctx, 0);
    ctx.finish().map(|()| result)
}
