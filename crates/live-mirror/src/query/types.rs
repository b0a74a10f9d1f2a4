//! Query constraint types: the filter/sort/limit directives applied to a
//! change feed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Operand is an array; matches when the field equals any element.
    In,
    /// Operand is an array; matches when the field equals none of them.
    NotIn,
    /// Field is an array containing the operand.
    ArrayContains,
    /// Field is an array containing any element of the operand array.
    ArrayContainsAny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// A single query directive. A feed's query is an ordered list of these.
///
/// Cursor directives (`StartAt` … `EndBefore`) compare against the first
/// `OrderBy` field, or the document id when there is no ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryConstraint {
    Where {
        field: String,
        op: FilterOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: SortDirection,
    },
    Limit(usize),
    LimitToLast(usize),
    StartAt(Value),
    StartAfter(Value),
    EndAt(Value),
    EndBefore(Value),
}

// ============================================================================
// Constructors
// ============================================================================

pub fn filter(field: impl Into<String>, op: FilterOp, value: Value) -> QueryConstraint {
    QueryConstraint::Where {
        field: field.into(),
        op,
        value,
    }
}

pub fn order_by(field: impl Into<String>) -> QueryConstraint {
    QueryConstraint::OrderBy {
        field: field.into(),
        direction: SortDirection::Asc,
    }
}

pub fn order_by_desc(field: impl Into<String>) -> QueryConstraint {
    QueryConstraint::OrderBy {
        field: field.into(),
        direction: SortDirection::Desc,
    }
}

pub fn limit(n: usize) -> QueryConstraint {
    QueryConstraint::Limit(n)
}

pub fn limit_to_last(n: usize) -> QueryConstraint {
    QueryConstraint::LimitToLast(n)
}

pub fn start_at(value: Value) -> QueryConstraint {
    QueryConstraint::StartAt(value)
}

pub fn start_after(value: Value) -> QueryConstraint {
    QueryConstraint::StartAfter(value)
}

pub fn end_at(value: Value) -> QueryConstraint {
    QueryConstraint::EndAt(value)
}

pub fn end_before(value: Value) -> QueryConstraint {
    QueryConstraint::EndBefore(value)
}
