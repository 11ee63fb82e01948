//! Metadata discovery by sampling recent raw data
//!
//! Until a dedicated metadata store exists, available metric names, types and
//! tag vocabularies are inferred by querying the most recent 24-hour window
//! of each metric entity at day-level granularity. The window is anchored at
//! the current time rounded down to the whole minute so that the backend can
//! cache responses.

use std::collections::{BTreeSet, HashMap};

use chrono::{Duration, DurationRound, Utc};
use tracing::debug;

use crate::backend::{
    tag_column, BackendQuery, Condition, MetricsBackend, Row, WhereClause, METRIC_ID_COL,
    TS_COL_QUERY,
};
use crate::catalog;
use crate::config::MAX_POINTS;
use crate::error::{QueryError, Result};
use crate::indexer::{reverse_resolve_known, StringIndexer};
use crate::types::{
    check_project_scope, EntityKey, MetricMeta, MetricMetaWithTagKeys, MetricType, Project, Tag,
    TagValue,
};

/// Coarsest granularity: one day
const META_GRANULARITY: u64 = 24 * 60 * 60;

/// Column listing all tag-key codes present on a row
const TAGS_KEY_COL: &str = "tags.key";

/// Reads metric metadata from the backend
pub struct MetaReader<'a> {
    org_id: u64,
    projects: &'a [Project],
    backend: &'a dyn MetricsBackend,
    indexer: &'a dyn StringIndexer,
    lookback_hours: i64,
}

impl<'a> MetaReader<'a> {
    /// Create a reader scoped to a project list with the default 24-hour
    /// sampling window
    pub fn new(
        projects: &'a [Project],
        backend: &'a dyn MetricsBackend,
        indexer: &'a dyn StringIndexer,
    ) -> Result<Self> {
        Self::with_lookback(projects, backend, indexer, 24)
    }

    /// Create a reader with an explicit sampling window
    pub fn with_lookback(
        projects: &'a [Project],
        backend: &'a dyn MetricsBackend,
        indexer: &'a dyn StringIndexer,
        lookback_hours: i64,
    ) -> Result<Self> {
        let org_id = check_project_scope(projects)?;
        Ok(Self {
            org_id,
            projects,
            backend,
            indexer,
            lookback_hours,
        })
    }

    /// Run one discovery query; the grouped columns double as the selected
    /// columns
    async fn get_data(
        &self,
        entity: EntityKey,
        where_extra: Vec<WhereClause>,
        groupby: Vec<String>,
        referrer: &str,
    ) -> Result<Vec<Row>> {
        // Round the window to the whole minute for backend cache efficiency
        let now = Utc::now()
            .duration_trunc(Duration::minutes(1))
            .map_err(|e| QueryError::Inconsistent(format!("clock rounding failed: {}", e)))?;
        let start = now - Duration::hours(self.lookback_hours);

        let mut where_clauses = vec![
            WhereClause::Cond(Condition::eq("org_id", self.org_id as i64)),
            WhereClause::Cond(Condition::is_in(
                "project_id",
                self.projects.iter().map(|p| p.id as i64).collect(),
            )),
            WhereClause::Cond(Condition::time_gte(TS_COL_QUERY, start)),
            WhereClause::Cond(Condition::time_lt(TS_COL_QUERY, now)),
        ];
        where_clauses.extend(where_extra);

        let query = BackendQuery {
            entity,
            select: Vec::new(),
            where_clauses,
            groupby,
            orderby: None,
            limit: MAX_POINTS,
            offset: 0,
            granularity: META_GRANULARITY,
        };
        debug!(entity = entity.as_str(), referrer, "meta discovery query");
        self.backend.submit(&query, referrer, true).await
    }

    /// Discover all metric names and types seen in the sampling window
    pub async fn get_metrics(&self) -> Result<Vec<MetricMeta>> {
        let mut metrics = Vec::new();
        for metric_type in MetricType::all() {
            let entity = metric_type.entity();
            let rows = self
                .get_data(
                    entity,
                    vec![],
                    vec![METRIC_ID_COL.to_string()],
                    "metrics.meta.get_metrics",
                )
                .await?;
            for row in rows {
                let metric_id = row
                    .get(METRIC_ID_COL)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        QueryError::Inconsistent("row is missing metric_id".to_string())
                    })?;
                metrics.push(MetricMeta {
                    name: reverse_resolve_known(self.indexer, metric_id)?,
                    metric_type,
                    operations: catalog::operations_for(entity).to_vec(),
                    // The backend does not know the unit
                    unit: None,
                });
            }
        }
        Ok(metrics)
    }

    /// Discover one metric's type and known tag keys
    ///
    /// The entity kinds are probed in a fixed order and the first kind with
    /// any matching rows wins; a metric id is assumed to belong to exactly
    /// one type.
    pub async fn get_single_metric(&self, metric_name: &str) -> Result<MetricMetaWithTagKeys> {
        let metric_id = self.indexer.resolve(metric_name).ok_or_else(|| {
            QueryError::InvalidParams(format!("Unknown metric '{}'", metric_name))
        })?;

        for metric_type in MetricType::all() {
            let entity = metric_type.entity();
            let rows = self
                .get_data(
                    entity,
                    vec![WhereClause::Cond(Condition::eq(METRIC_ID_COL, metric_id))],
                    vec![METRIC_ID_COL.to_string(), TAGS_KEY_COL.to_string()],
                    "metrics.meta.get_single_metric",
                )
                .await?;
            if rows.is_empty() {
                continue;
            }

            let mut tag_ids = BTreeSet::new();
            for row in &rows {
                if let Some(ids) = row.get(TAGS_KEY_COL).and_then(|v| v.as_i64_array()) {
                    tag_ids.extend(ids.iter().copied());
                }
            }
            let mut tags = tag_ids
                .into_iter()
                .map(|tag_id| {
                    Ok(Tag {
                        key: reverse_resolve_known(self.indexer, tag_id)?,
                    })
                })
                .collect::<Result<Vec<Tag>>>()?;
            tags.sort();

            return Ok(MetricMetaWithTagKeys {
                name: metric_name.to_string(),
                metric_type,
                operations: catalog::operations_for(entity).to_vec(),
                tags,
                unit: None,
            });
        }

        Err(QueryError::InvalidParams(format!(
            "Metric '{}' was not found in any entity",
            metric_name
        )))
    }

    /// Build the metric-scope condition for tag discovery
    ///
    /// Returns `None` when any named metric cannot be resolved: a tag cannot
    /// appear in a metric that was never indexed, so the caller
    /// short-circuits to an empty result.
    fn metrics_filter(&self, metric_names: Option<&[&str]>) -> Option<Vec<WhereClause>> {
        let names = match metric_names {
            None => return Some(vec![]),
            Some(names) => names,
        };
        let mut metric_ids = Vec::with_capacity(names.len());
        for name in names {
            metric_ids.push(self.indexer.resolve(name)?);
        }
        Some(vec![WhereClause::Cond(Condition::is_in(
            METRIC_ID_COL,
            metric_ids,
        ))])
    }

    /// Discover tag keys, optionally scoped to metrics
    ///
    /// With a metric scope, only tags appearing in *all* named metrics are
    /// returned; without one, the union over everything observed.
    pub async fn get_tags(&self, metric_names: Option<&[&str]>) -> Result<Vec<Tag>> {
        let where_extra = match self.metrics_filter(metric_names) {
            None => return Ok(vec![]),
            Some(clauses) => clauses,
        };

        let mut tag_ids_per_metric: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for metric_type in MetricType::all() {
            let rows = self
                .get_data(
                    metric_type.entity(),
                    where_extra.clone(),
                    vec![METRIC_ID_COL.to_string(), TAGS_KEY_COL.to_string()],
                    "metrics.meta.get_tags",
                )
                .await?;
            for row in rows {
                let metric_id = row
                    .get(METRIC_ID_COL)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        QueryError::Inconsistent("row is missing metric_id".to_string())
                    })?;
                if let Some(ids) = row.get(TAGS_KEY_COL).and_then(|v| v.as_i64_array()) {
                    tag_ids_per_metric
                        .entry(metric_id)
                        .or_default()
                        .extend(ids.iter().copied());
                }
            }
        }

        let tag_ids = merge_id_sets(tag_ids_per_metric, metric_names.is_some());

        let mut tags = tag_ids
            .into_iter()
            .map(|tag_id| {
                Ok(Tag {
                    key: reverse_resolve_known(self.indexer, tag_id)?,
                })
            })
            .collect::<Result<Vec<Tag>>>()?;
        tags.sort();
        Ok(tags)
    }

    /// Discover all known values of one tag, optionally scoped to metrics
    pub async fn get_tag_values(
        &self,
        tag_name: &str,
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<TagValue>> {
        let tag_id = self
            .indexer
            .resolve(tag_name)
            .ok_or_else(|| QueryError::InvalidParams(format!("Unknown tag '{}'", tag_name)))?;

        let where_extra = match self.metrics_filter(metric_names) {
            None => return Ok(vec![]),
            Some(clauses) => clauses,
        };

        let column = tag_column(tag_id);
        let mut value_ids_per_metric: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for metric_type in MetricType::all() {
            let rows = self
                .get_data(
                    metric_type.entity(),
                    where_extra.clone(),
                    vec![METRIC_ID_COL.to_string(), column.clone()],
                    "metrics.meta.get_tag_values",
                )
                .await?;
            for row in rows {
                let value_id = match row.get(&column).and_then(|v| v.as_i64()) {
                    Some(id) => id,
                    None => continue,
                };
                // Non-positive codes are the "no value" sentinel
                if value_id <= 0 {
                    continue;
                }
                let metric_id = row
                    .get(METRIC_ID_COL)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        QueryError::Inconsistent("row is missing metric_id".to_string())
                    })?;
                value_ids_per_metric
                    .entry(metric_id)
                    .or_default()
                    .insert(value_id);
            }
        }

        let value_ids = merge_id_sets(value_ids_per_metric, metric_names.is_some());

        let mut values = value_ids
            .into_iter()
            .map(|value_id| {
                Ok(TagValue {
                    key: tag_name.to_string(),
                    value: reverse_resolve_known(self.indexer, value_id)?,
                })
            })
            .collect::<Result<Vec<TagValue>>>()?;
        values.sort();
        Ok(values)
    }
}

/// Intersect per-metric id sets when a metric scope was given, union them
/// otherwise
fn merge_id_sets(per_metric: HashMap<i64, BTreeSet<i64>>, intersect: bool) -> BTreeSet<i64> {
    let mut sets = per_metric.into_values();
    if !intersect {
        return sets.flatten().collect();
    }
    let first = match sets.next() {
        None => return BTreeSet::new(),
        Some(first) => first,
    };
    sets.fold(first, |acc, set| acc.intersection(&set).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_merge_union() {
        let per_metric = HashMap::from([(1, set(&[10, 11])), (2, set(&[11, 12]))]);
        assert_eq!(merge_id_sets(per_metric, false), set(&[10, 11, 12]));
    }

    #[test]
    fn test_merge_intersection() {
        let per_metric = HashMap::from([(1, set(&[10, 11])), (2, set(&[11, 12]))]);
        assert_eq!(merge_id_sets(per_metric, true), set(&[11]));
    }

    #[test]
    fn test_merge_empty() {
        assert_eq!(merge_id_sets(HashMap::new(), true), BTreeSet::new());
        assert_eq!(merge_id_sets(HashMap::new(), false), BTreeSet::new());
    }
}
