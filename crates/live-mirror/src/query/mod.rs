pub mod execute;
pub mod types;

pub use execute::{compare_values, execute, get_field_value, matches_filter};
pub use types::{
    end_at, end_before, filter, limit, limit_to_last, order_by, order_by_desc, start_after,
    start_at, FilterOp, QueryConstraint, SortDirection,
};
