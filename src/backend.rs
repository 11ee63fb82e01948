//! Compiled query descriptors and the backend execution interface
//!
//! A [`BackendQuery`] is the typed description of one analytical query
//! against the columnar time-series store: select clauses (aggregate function
//! + result alias), a where tree, group-by columns, optional order-by, limit
//! and granularity. Execution is abstracted behind [`MetricsBackend`]; rows
//! come back as mappings from column name to a scalar or array [`Datum`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::types::EntityKey;

/// Raw timestamp column used for time-window filtering
pub const TS_COL_QUERY: &str = "timestamp";

/// Time-bucket column added to the group-by of series queries
pub const TS_COL_GROUP: &str = "bucketed_time";

/// Column identifying which metric a row belongs to
pub const METRIC_ID_COL: &str = "metric_id";

/// Name of the tag column for a given tag-key code
pub fn tag_column(code: i64) -> String {
    format!("tags[{}]", code)
}

/// Extract the tag-key code from a tag column name
pub fn parse_tag_column(column: &str) -> Option<i64> {
    column
        .strip_prefix("tags[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

// ============================================================================
// Result Rows
// ============================================================================

/// A scalar or array value in a backend result row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Datum {
    /// Integer value (codes, counts)
    Int(i64),
    /// Floating point value (aggregates)
    Float(f64),
    /// Text value
    Text(String),
    /// Timestamp value (time buckets)
    Timestamp(DateTime<Utc>),
    /// Array of integer values (e.g. the `tags.key` column)
    IntArray(Vec<i64>),
    /// Array of floating point values (e.g. the percentile array)
    FloatArray(Vec<f64>),
}

impl Datum {
    /// Integer view, if this datum is integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int(v) => Some(*v as f64),
            Datum::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Float-array view
    pub fn as_f64_array(&self) -> Option<&[f64]> {
        match self {
            Datum::FloatArray(v) => Some(v),
            _ => None,
        }
    }

    /// Integer-array view
    pub fn as_i64_array(&self) -> Option<&[i64]> {
        match self {
            Datum::IntArray(v) => Some(v),
            _ => None,
        }
    }

    /// Timestamp view; text parses as RFC 3339
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Datum::Timestamp(v) => Some(*v),
            Datum::Text(v) => DateTime::parse_from_rfc3339(v)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// A raw result row: column name to value
pub type Row = HashMap<String, Datum>;

// ============================================================================
// Query Descriptors
// ============================================================================

/// Comparison operator in a where condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equality
    Eq,
    /// Membership in a set of codes
    In,
    /// Greater than or equal (time bounds)
    Gte,
    /// Strictly less than (time bounds)
    Lt,
}

/// Right-hand side of a where condition
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    /// A single integer code
    Int(i64),
    /// A set of integer codes
    Ints(Vec<i64>),
    /// A timestamp bound
    Time(DateTime<Utc>),
}

/// A single column comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column the condition applies to
    pub column: String,
    /// Comparison operator
    pub op: CompareOp,
    /// Comparison value
    pub value: ConditionValue,
}

impl Condition {
    /// Equality against an integer code
    pub fn eq(column: impl Into<String>, code: i64) -> Self {
        Self {
            column: column.into(),
            op: CompareOp::Eq,
            value: ConditionValue::Int(code),
        }
    }

    /// Membership in a set of integer codes
    pub fn is_in(column: impl Into<String>, codes: Vec<i64>) -> Self {
        Self {
            column: column.into(),
            op: CompareOp::In,
            value: ConditionValue::Ints(codes),
        }
    }

    /// Lower time bound (inclusive)
    pub fn time_gte(column: impl Into<String>, bound: DateTime<Utc>) -> Self {
        Self {
            column: column.into(),
            op: CompareOp::Gte,
            value: ConditionValue::Time(bound),
        }
    }

    /// Upper time bound (exclusive)
    pub fn time_lt(column: impl Into<String>, bound: DateTime<Utc>) -> Self {
        Self {
            column: column.into(),
            op: CompareOp::Lt,
            value: ConditionValue::Time(bound),
        }
    }
}

/// A boolean tree of conditions
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    /// A leaf condition
    Cond(Condition),
    /// All operands must hold
    And(Vec<WhereClause>),
    /// At least one operand must hold
    Or(Vec<WhereClause>),
}

impl WhereClause {
    /// Combine operands with AND, collapsing the single-operand case
    ///
    /// The backend only accepts boolean connectives with two or more
    /// operands. Returns `None` for an empty operand list.
    pub fn all(mut operands: Vec<WhereClause>) -> Option<WhereClause> {
        match operands.len() {
            0 => None,
            1 => operands.pop(),
            _ => Some(WhereClause::And(operands)),
        }
    }

    /// Combine operands with OR, collapsing the single-operand case
    pub fn any(mut operands: Vec<WhereClause>) -> Option<WhereClause> {
        match operands.len() {
            0 => None,
            1 => operands.pop(),
            _ => Some(WhereClause::Or(operands)),
        }
    }
}

/// A select clause: an aggregate function applied to a column, exposed under
/// a result alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateExpr {
    /// Backend aggregate function name
    pub function: String,
    /// Column the function is applied to
    pub column: String,
    /// Result column alias
    pub alias: String,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// An order-by clause over a result alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Result alias to sort by
    pub alias: String,
    /// Sort direction
    pub direction: Direction,
}

/// One compiled query against a single metric entity
#[derive(Debug, Clone, PartialEq)]
pub struct BackendQuery {
    /// Entity (backend table/stream) the query runs against
    pub entity: EntityKey,
    /// Aggregate select clauses
    pub select: Vec<AggregateExpr>,
    /// Where conditions, combined with AND
    pub where_clauses: Vec<WhereClause>,
    /// Group-by columns
    pub groupby: Vec<String>,
    /// Optional order-by over a select alias
    pub orderby: Option<OrderBy>,
    /// Maximum number of rows
    pub limit: usize,
    /// Row offset
    pub offset: usize,
    /// Time-bucket width in seconds
    pub granularity: u64,
}

impl BackendQuery {
    /// Whether this query buckets rows by time
    pub fn is_series(&self) -> bool {
        self.groupby.iter().any(|c| c == TS_COL_GROUP)
    }
}

// ============================================================================
// Execution Interface
// ============================================================================

/// Abstracted query-submission interface to the columnar time-series store
///
/// Each submitted query returns rows as column-name-to-value mappings. The
/// `referrer` labels the call site for backend-side attribution; `use_cache`
/// hints that the response may be served from a cache (metadata discovery
/// rounds its time window to whole minutes to make this effective).
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Submit one compiled query and collect its rows
    async fn submit(
        &self,
        query: &BackendQuery,
        referrer: &str,
        use_cache: bool,
    ) -> Result<Vec<Row>>;
}
