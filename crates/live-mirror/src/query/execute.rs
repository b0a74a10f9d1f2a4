//! In-memory query evaluation: filter, sort, cursor and limit.
//!
//! Used by [`MemoryStore`](crate::store::memory::MemoryStore) to decide which
//! records a feed reports and in what order.

use std::cmp::Ordering;

use serde_json::Value;

use super::types::{FilterOp, QueryConstraint, SortDirection};

// ============================================================================
// Value Comparison
// ============================================================================

/// Total order over JSON values.
///
/// Cross-type ordering ranks null < boolean < number < string < array < object.
/// Within a type: numbers by f64 value, strings by codepoint, arrays and
/// objects element by element.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(f64::NAN);
            let fy = y.as_f64().unwrap_or(f64::NAN);
            fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut xs: Vec<_> = x.iter().collect();
            let mut ys: Vec<_> = y.iter().collect();
            xs.sort_by(|a, b| a.0.cmp(b.0));
            ys.sort_by(|a, b| a.0.cmp(b.0));
            for ((kx, vx), (ky, vy)) in xs.iter().zip(ys.iter()) {
                let ord = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    same_type(a, b) && compare_values(a, b) == Ordering::Equal
}

// ============================================================================
// Field Path Resolution
// ============================================================================

/// Get a nested value from a record using a dot-separated path.
/// Returns `None` if any path segment is missing or the parent is not an object.
pub fn get_field_value<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// ============================================================================
// Filters
// ============================================================================

/// Evaluate one filter against a record. Records lacking the field never match.
pub fn matches_filter(record: &Value, field: &str, op: FilterOp, operand: &Value) -> bool {
    let Some(value) = get_field_value(record, field) else {
        return false;
    };

    match op {
        FilterOp::Eq => values_equal(value, operand),
        FilterOp::Ne => !values_equal(value, operand),
        FilterOp::Lt => same_type(value, operand) && compare_values(value, operand).is_lt(),
        FilterOp::Lte => same_type(value, operand) && compare_values(value, operand).is_le(),
        FilterOp::Gt => same_type(value, operand) && compare_values(value, operand).is_gt(),
        FilterOp::Gte => same_type(value, operand) && compare_values(value, operand).is_ge(),
        FilterOp::In => operand
            .as_array()
            .map(|items| items.iter().any(|item| values_equal(value, item)))
            .unwrap_or(false),
        FilterOp::NotIn => operand
            .as_array()
            .map(|items| !items.iter().any(|item| values_equal(value, item)))
            .unwrap_or(false),
        FilterOp::ArrayContains => value
            .as_array()
            .map(|items| items.iter().any(|item| values_equal(item, operand)))
            .unwrap_or(false),
        FilterOp::ArrayContainsAny => match (value.as_array(), operand.as_array()) {
            (Some(items), Some(wanted)) => items
                .iter()
                .any(|item| wanted.iter().any(|w| values_equal(item, w))),
            _ => false,
        },
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Apply `constraints` to `(id, record)` pairs, returning the matching records
/// in query order.
///
/// Records lacking an ordered-by field are excluded. Ties are broken by id so
/// the result is deterministic.
pub fn execute(
    records: impl IntoIterator<Item = (String, Value)>,
    constraints: &[QueryConstraint],
) -> Vec<(String, Value)> {
    let mut orderings: Vec<(&str, SortDirection)> = Vec::new();
    let mut limit: Option<usize> = None;
    let mut limit_to_last: Option<usize> = None;

    for constraint in constraints {
        match constraint {
            QueryConstraint::OrderBy { field, direction } => orderings.push((field, *direction)),
            QueryConstraint::Limit(n) => limit = Some(*n),
            QueryConstraint::LimitToLast(n) => limit_to_last = Some(*n),
            _ => {}
        }
    }

    let mut rows: Vec<(String, Value)> = records
        .into_iter()
        .filter(|(_, record)| {
            constraints.iter().all(|c| match c {
                QueryConstraint::Where { field, op, value } => {
                    matches_filter(record, field, *op, value)
                }
                _ => true,
            })
        })
        .filter(|(_, record)| {
            orderings
                .iter()
                .all(|(field, _)| get_field_value(record, field).is_some())
        })
        .collect();

    rows.sort_by(|(id_a, a), (id_b, b)| {
        for (field, direction) in &orderings {
            let ord = compare_values(
                get_field_value(a, field).unwrap_or(&Value::Null),
                get_field_value(b, field).unwrap_or(&Value::Null),
            );
            let ord = match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        id_a.cmp(id_b)
    });

    let primary = orderings.first().copied();
    rows.retain(|(id, record)| {
        constraints.iter().all(|c| {
            let (cursor, accept): (&Value, fn(Ordering) -> bool) = match c {
                QueryConstraint::StartAt(v) => (v, Ordering::is_ge),
                QueryConstraint::StartAfter(v) => (v, Ordering::is_gt),
                QueryConstraint::EndAt(v) => (v, Ordering::is_le),
                QueryConstraint::EndBefore(v) => (v, Ordering::is_lt),
                _ => return true,
            };
            accept(cursor_position(id, record, primary, cursor))
        })
    });

    if let Some(n) = limit {
        rows.truncate(n);
    }
    if let Some(n) = limit_to_last {
        let skip = rows.len().saturating_sub(n);
        rows.drain(..skip);
    }

    rows
}

/// Where a record sits relative to a cursor value, in query order.
fn cursor_position(
    id: &str,
    record: &Value,
    primary: Option<(&str, SortDirection)>,
    cursor: &Value,
) -> Ordering {
    match primary {
        Some((field, direction)) => {
            let value = get_field_value(record, field).unwrap_or(&Value::Null);
            let ord = compare_values(value, cursor);
            match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        }
        None => compare_values(&Value::String(id.to_string()), cursor),
    }
}
