//! Metric catalog: static operation/function tables and the development
//! metric registry
//!
//! Two kinds of process-wide, read-only knowledge live here:
//! - which operations are legal for which entity, and which backend aggregate
//!   function + result alias each operation maps to
//! - a registry of known metric definitions used during development by the
//!   mock data source and by compile-time metric-type lookup

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::error::{QueryError, Result};
use crate::types::{EntityKey, MetricType, MetricUnit, Operation};

/// The single backend call computing all five quantiles at once
///
/// The returned array is ordered p50, p75, p90, p95, p99; see
/// [`Operation::percentile_index`].
pub const PERCENTILES_FUNCTION: &str = "quantiles(0.5,0.75,0.9,0.95,0.99)";

/// Result column alias of [`PERCENTILES_FUNCTION`]
pub const PERCENTILES_ALIAS: &str = "percentiles";

/// Backend aggregate function and result column alias for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateField {
    /// Backend aggregate function name
    pub function: &'static str,
    /// Result column alias the value is read back from
    pub alias: &'static str,
}

/// Map an (entity, operation) pair to its backend aggregate field
///
/// Returns `None` when the operation is not legal for the entity.
pub fn aggregate_field(entity: EntityKey, op: Operation) -> Option<AggregateField> {
    match (entity, op) {
        (EntityKey::MetricsCounters, Operation::Sum) => Some(AggregateField {
            function: "sum",
            alias: "value",
        }),
        (EntityKey::MetricsSets, Operation::CountUnique) => Some(AggregateField {
            function: "uniq",
            alias: "value",
        }),
        (EntityKey::MetricsDistributions, Operation::Avg) => Some(AggregateField {
            function: "avg",
            alias: "avg",
        }),
        (EntityKey::MetricsDistributions, Operation::Count) => Some(AggregateField {
            function: "count",
            alias: "count",
        }),
        (EntityKey::MetricsDistributions, Operation::Max) => Some(AggregateField {
            function: "max",
            alias: "max",
        }),
        (EntityKey::MetricsDistributions, Operation::Min) => Some(AggregateField {
            function: "min",
            alias: "min",
        }),
        (EntityKey::MetricsDistributions, op) if op.is_percentile() => Some(AggregateField {
            function: PERCENTILES_FUNCTION,
            alias: PERCENTILES_ALIAS,
        }),
        _ => None,
    }
}

/// Operations that are legal for an entity, sorted by name
pub fn operations_for(entity: EntityKey) -> &'static [Operation] {
    match entity {
        EntityKey::MetricsCounters => &[Operation::Sum],
        EntityKey::MetricsSets => &[Operation::CountUnique],
        EntityKey::MetricsDistributions => &[
            Operation::Avg,
            Operation::Count,
            Operation::Max,
            Operation::Min,
            Operation::P50,
            Operation::P75,
            Operation::P90,
            Operation::P95,
            Operation::P99,
        ],
    }
}

/// Entities actually implemented in the backend
const IMPLEMENTED_ENTITIES: &[EntityKey] = &[
    EntityKey::MetricsCounters,
    EntityKey::MetricsSets,
    EntityKey::MetricsDistributions,
];

/// Resolve a metric type to its backend entity, failing for entities the
/// backend has not implemented yet
pub fn entity_for(metric_type: MetricType) -> Result<EntityKey> {
    let entity = metric_type.entity();
    if !IMPLEMENTED_ENTITIES.contains(&entity) {
        return Err(QueryError::UnsupportedEntity(entity.as_str().to_string()));
    }
    Ok(entity)
}

// ============================================================================
// Development Metric Registry
// ============================================================================

/// A known metric definition in the development registry
#[derive(Debug, Clone)]
pub struct MetricSpec {
    /// Metric type, which determines the backend entity
    pub metric_type: MetricType,
    /// Unit of the metric's values, if known
    pub unit: Option<MetricUnit>,
    /// Known tag vocabulary: tag key to known values
    pub tags: BTreeMap<&'static str, Vec<&'static str>>,
}

impl MetricSpec {
    /// Operations that are legal for this metric
    pub fn operations(&self) -> &'static [Operation] {
        operations_for(self.metric_type.entity())
    }
}

fn base_tags() -> BTreeMap<&'static str, Vec<&'static str>> {
    BTreeMap::from([
        ("environment", vec!["production", "staging"]),
        ("release", vec![]),
    ])
}

fn session_tags() -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut tags = base_tags();
    tags.insert(
        "session.status",
        vec!["abnormal", "crashed", "errored", "healthy"],
    );
    tags
}

fn measurement_tags() -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut tags = base_tags();
    tags.insert("measurement_rating", vec!["good", "meh", "poor"]);
    tags.insert("transaction", vec!["/foo/:orgId/", "/bar/:orgId/"]);
    tags
}

/// Registry of known metric definitions, keyed by metric name
pub static METRICS: Lazy<BTreeMap<&'static str, MetricSpec>> = Lazy::new(|| {
    let mut metrics = BTreeMap::from([
        (
            "session",
            MetricSpec {
                metric_type: MetricType::Counter,
                unit: None,
                tags: session_tags(),
            },
        ),
        (
            "user",
            MetricSpec {
                metric_type: MetricType::Set,
                unit: None,
                tags: session_tags(),
            },
        ),
        (
            "session.duration",
            MetricSpec {
                metric_type: MetricType::Distribution,
                unit: Some(MetricUnit::Seconds),
                tags: session_tags(),
            },
        ),
        (
            "session.error",
            MetricSpec {
                metric_type: MetricType::Set,
                unit: None,
                tags: session_tags(),
            },
        ),
    ]);
    for web_vital in [
        "measurement.lcp",
        "measurement.fcp",
        "measurement.fid",
        "measurement.cls",
    ] {
        metrics.insert(
            web_vital,
            MetricSpec {
                metric_type: MetricType::Distribution,
                unit: None,
                tags: measurement_tags(),
            },
        );
    }
    metrics
});

/// Look up a metric in the registry, failing with a parameter error for
/// unknown names
pub fn metric_spec(metric_name: &str) -> Result<&'static MetricSpec> {
    METRICS
        .get(metric_name)
        .ok_or_else(|| QueryError::InvalidParams(format!("Unknown metric '{}'", metric_name)))
}
