use std::collections::BTreeMap;

use serde_json::{Map, Value};

// ============================================================================
// SchemaNode Types
// ============================================================================

/// A literal value that a schema can require.
#[derive(Debug, Clone)]
pub enum LiteralValue {
    String(String),
    /// f64 literal. NaN is not representable in serde_json so we don't special-case it.
    Number(f64),
    Bool(bool),
}

impl PartialEq for LiteralValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LiteralValue::String(a), LiteralValue::String(b)) => a == b,
            (LiteralValue::Number(a), LiteralValue::Number(b)) => a.to_bits() == b.to_bits(),
            (LiteralValue::Bool(a), LiteralValue::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl LiteralValue {
    pub fn to_value(&self) -> Value {
        match self {
            LiteralValue::String(s) => Value::String(s.clone()),
            LiteralValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            LiteralValue::Bool(b) => Value::Bool(*b),
        }
    }
}

/// A schema node describing the shape and type constraints of a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    String,
    Number,
    /// A number with no fractional part.
    Integer,
    Boolean,
    /// ISO 8601 timestamp string.
    Date,
    /// Accepts any JSON value.
    Any,
    Optional(Box<SchemaNode>),
    Array(Box<SchemaNode>),
    Object(BTreeMap<String, SchemaNode>),
    Literal(LiteralValue),
    Union(Vec<SchemaNode>),
}

impl SchemaNode {
    /// The zero value used when a record omits this field and no explicit
    /// default was declared.
    pub fn zero_value(&self) -> Value {
        match self {
            SchemaNode::String => Value::String(String::new()),
            SchemaNode::Number | SchemaNode::Integer => Value::from(0),
            SchemaNode::Boolean => Value::Bool(false),
            SchemaNode::Date | SchemaNode::Any | SchemaNode::Optional(_) => Value::Null,
            SchemaNode::Array(_) => Value::Array(Vec::new()),
            SchemaNode::Object(props) => Value::Object(
                props
                    .iter()
                    .map(|(key, node)| (key.clone(), node.zero_value()))
                    .collect::<Map<String, Value>>(),
            ),
            SchemaNode::Literal(lit) => lit.to_value(),
            SchemaNode::Union(variants) => variants
                .first()
                .map(SchemaNode::zero_value)
                .unwrap_or(Value::Null),
        }
    }
}

// ============================================================================
// Schema Builder API (`t` module)
// ============================================================================

/// Schema builder helpers. Usage: `t::string()`, `t::number()`, `t::optional(t::string())`, etc.
pub mod t {
    use super::{LiteralValue, SchemaNode};
    use std::collections::BTreeMap;

    pub fn string() -> SchemaNode {
        SchemaNode::String
    }

    pub fn number() -> SchemaNode {
        SchemaNode::Number
    }

    pub fn integer() -> SchemaNode {
        SchemaNode::Integer
    }

    pub fn boolean() -> SchemaNode {
        SchemaNode::Boolean
    }

    pub fn date() -> SchemaNode {
        SchemaNode::Date
    }

    pub fn any() -> SchemaNode {
        SchemaNode::Any
    }

    pub fn optional(inner: SchemaNode) -> SchemaNode {
        SchemaNode::Optional(Box::new(inner))
    }

    pub fn array(element: SchemaNode) -> SchemaNode {
        SchemaNode::Array(Box::new(element))
    }

    pub fn object(properties: BTreeMap<String, SchemaNode>) -> SchemaNode {
        SchemaNode::Object(properties)
    }

    pub fn literal_str(s: impl Into<String>) -> SchemaNode {
        SchemaNode::Literal(LiteralValue::String(s.into()))
    }

    pub fn literal_num(n: f64) -> SchemaNode {
        SchemaNode::Literal(LiteralValue::Number(n))
    }

    pub fn literal_bool(b: bool) -> SchemaNode {
        SchemaNode::Literal(LiteralValue::Bool(b))
    }

    /// Create a union schema. Panics if `variants` is empty.
    pub fn union(variants: Vec<SchemaNode>) -> SchemaNode {
        assert!(!variants.is_empty(), "Union must have at least one variant");
        SchemaNode::Union(variants)
    }
}
