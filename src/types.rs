//! Core data model: metric types, operations, entities and result shapes

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{QueryError, Result};

/// All operation names accepted in field expressions, in the order used for
/// error messages
pub const OPERATIONS: &[&str] = &[
    "avg",
    "count_unique",
    "count",
    "max",
    "min",
    "sum",
    "p50",
    "p75",
    "p90",
    "p95",
    "p99",
];

/// The type of a metric, which determines the backend entity that stores it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Monotonic or gauge-like counter values
    Counter,
    /// Sets of unique values (e.g. user ids)
    Set,
    /// Value distributions supporting percentiles
    Distribution,
}

impl MetricType {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Set => "set",
            MetricType::Distribution => "distribution",
        }
    }

    /// The backend entity holding all metrics of this type
    pub fn entity(&self) -> EntityKey {
        match self {
            MetricType::Counter => EntityKey::MetricsCounters,
            MetricType::Set => EntityKey::MetricsSets,
            MetricType::Distribution => EntityKey::MetricsDistributions,
        }
    }

    /// All metric types, in discovery fan-out order
    pub fn all() -> [MetricType; 3] {
        [
            MetricType::Counter,
            MetricType::Set,
            MetricType::Distribution,
        ]
    }
}

/// A backend-side table/stream holding all metrics of one type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    /// Counter metrics
    MetricsCounters,
    /// Set metrics
    MetricsSets,
    /// Distribution metrics
    MetricsDistributions,
}

impl EntityKey {
    /// Stable string form used in backend queries and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKey::MetricsCounters => "metrics_counters",
            EntityKey::MetricsSets => "metrics_sets",
            EntityKey::MetricsDistributions => "metrics_distributions",
        }
    }
}

/// A function that can be applied to a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Arithmetic mean (distributions)
    Avg,
    /// Number of observed values (distributions)
    Count,
    /// Number of unique values (sets)
    CountUnique,
    /// Maximum value (distributions)
    Max,
    /// Minimum value (distributions)
    Min,
    /// Sum of values (counters)
    Sum,
    /// 50th percentile (distributions)
    P50,
    /// 75th percentile (distributions)
    P75,
    /// 90th percentile (distributions)
    P90,
    /// 95th percentile (distributions)
    P95,
    /// 99th percentile (distributions)
    P99,
}

impl Operation {
    /// Parse an operation name as it appears in a field expression
    pub fn parse(name: &str) -> Option<Operation> {
        Some(match name {
            "avg" => Operation::Avg,
            "count" => Operation::Count,
            "count_unique" => Operation::CountUnique,
            "max" => Operation::Max,
            "min" => Operation::Min,
            "sum" => Operation::Sum,
            "p50" => Operation::P50,
            "p75" => Operation::P75,
            "p90" => Operation::P90,
            "p95" => Operation::P95,
            "p99" => Operation::P99,
            _ => return None,
        })
    }

    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Avg => "avg",
            Operation::Count => "count",
            Operation::CountUnique => "count_unique",
            Operation::Max => "max",
            Operation::Min => "min",
            Operation::Sum => "sum",
            Operation::P50 => "p50",
            Operation::P75 => "p75",
            Operation::P90 => "p90",
            Operation::P95 => "p95",
            Operation::P99 => "p99",
        }
    }

    /// Whether this operation is a percentile
    pub fn is_percentile(&self) -> bool {
        self.percentile_index().is_some()
    }

    /// Position of this percentile in the shared quantile-array column
    ///
    /// The backend computes all five quantiles in a single call returning an
    /// array ordered p50, p75, p90, p95, p99. The converter relies on these
    /// indices to split the array apart.
    pub fn percentile_index(&self) -> Option<usize> {
        Some(match self {
            Operation::P50 => 0,
            Operation::P75 => 1,
            Operation::P90 => 2,
            Operation::P95 => 3,
            Operation::P99 => 4,
            _ => return None,
        })
    }

    /// Default value for series positions with no observed data
    ///
    /// Counting operations gap-fill with zero; averaging, extremal and
    /// percentile operations gap-fill with null.
    pub fn default_series_value(&self) -> Option<f64> {
        match self {
            Operation::Count | Operation::CountUnique | Operation::Sum => Some(0.0),
            _ => None,
        }
    }
}

/// Unit of a metric's values, when known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    /// Duration in seconds
    Seconds,
}

/// A project in scope for a query, together with its organization
///
/// All projects of one request must share the same organization; the query
/// compiler fails fast otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Project {
    /// Project id, used for the project-scope membership condition
    pub id: u64,
    /// Organization id, used for the organization-scope condition
    pub org_id: u64,
}

/// Verify that a project scope is non-empty and organization-homogeneous,
/// returning the shared organization id
pub fn check_project_scope(projects: &[Project]) -> Result<u64> {
    let first = projects.first().ok_or_else(|| {
        QueryError::InvalidParams("At least one project is required".to_string())
    })?;
    if projects.iter().any(|p| p.org_id != first.org_id) {
        return Err(QueryError::Inconsistent(
            "projects span multiple organizations".to_string(),
        ));
    }
    Ok(first.org_id)
}

/// A discovered tag key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Tag {
    /// Tag key name
    pub key: String,
}

/// A discovered (tag key, tag value) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TagValue {
    /// Tag key name
    pub key: String,
    /// Tag value
    pub value: String,
}

/// Discovered metadata for one metric, without tag information
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricMeta {
    /// Metric name
    pub name: String,
    /// Metric type
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Operations that are legal for this metric
    pub operations: Vec<Operation>,
    /// Unit of the metric's values, if known
    pub unit: Option<MetricUnit>,
}

/// Discovered metadata for one metric, including its known tag keys
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricMetaWithTagKeys {
    /// Metric name
    pub name: String,
    /// Metric type
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Operations that are legal for this metric
    pub operations: Vec<Operation>,
    /// Known tag keys, sorted by name
    pub tags: Vec<Tag>,
    /// Unit of the metric's values, if known
    pub unit: Option<MetricUnit>,
}

/// One output group, keyed by a tag combination
///
/// `totals` maps each requested field string to one aggregate over the whole
/// window. When intervals were requested, `series` maps each field string to
/// one value per interval, aligned by position and gap-filled with the
/// operation's default. Non-finite values are normalized to null.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupResult {
    /// Resolved tag name to resolved tag value
    pub by: BTreeMap<String, String>,
    /// One aggregate value per field over the whole window
    pub totals: BTreeMap<String, Option<f64>>,
    /// One value per field per interval, present only for series queries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<BTreeMap<String, Vec<Option<f64>>>>,
}

/// The complete, JSON-serializable answer to a series query
#[derive(Debug, Clone, Serialize)]
pub struct SeriesResult {
    /// Window start
    pub start: DateTime<Utc>,
    /// Window end (exclusive)
    pub end: DateTime<Utc>,
    /// The raw filter query string as requested
    pub query: String,
    /// The dense interval sequence all series are aligned to
    pub intervals: Vec<DateTime<Utc>>,
    /// One entry per tag combination, in backend row order
    pub groups: Vec<GroupResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_index_order() {
        // p50..p99 split a single array-returning aggregate; the converter
        // depends on this exact order.
        assert_eq!(Operation::P50.percentile_index(), Some(0));
        assert_eq!(Operation::P75.percentile_index(), Some(1));
        assert_eq!(Operation::P90.percentile_index(), Some(2));
        assert_eq!(Operation::P95.percentile_index(), Some(3));
        assert_eq!(Operation::P99.percentile_index(), Some(4));
        assert_eq!(Operation::Sum.percentile_index(), None);
    }

    #[test]
    fn test_operation_parse_round_trip() {
        for name in OPERATIONS {
            let op = Operation::parse(name).expect("known operation");
            assert_eq!(op.as_str(), *name);
        }
        assert!(Operation::parse("foo").is_none());
    }

    #[test]
    fn test_default_series_values() {
        assert_eq!(Operation::Sum.default_series_value(), Some(0.0));
        assert_eq!(Operation::Count.default_series_value(), Some(0.0));
        assert_eq!(Operation::CountUnique.default_series_value(), Some(0.0));
        assert_eq!(Operation::Avg.default_series_value(), None);
        assert_eq!(Operation::Max.default_series_value(), None);
        assert_eq!(Operation::P95.default_series_value(), None);
    }

    #[test]
    fn test_project_scope_homogeneity() {
        let ok = [
            Project { id: 1, org_id: 7 },
            Project { id: 2, org_id: 7 },
        ];
        assert_eq!(check_project_scope(&ok).unwrap(), 7);

        let mixed = [
            Project { id: 1, org_id: 7 },
            Project { id: 2, org_id: 8 },
        ];
        assert!(matches!(
            check_project_scope(&mixed),
            Err(QueryError::Inconsistent(_))
        ));

        assert!(matches!(
            check_project_scope(&[]),
            Err(QueryError::InvalidParams(_))
        ));
    }
}
