//! Result converter: raw backend rows to grouped, interval-aligned output
//!
//! Rows from all executed sub-queries are regrouped by their tag combination
//! (a canonical, sorted tuple of tag columns and codes), then each requested
//! operation's value is read from its result alias and written either into
//! the group's totals (rows without a time bucket) or into the exact position
//! of a lazily created, default-filled series array (rows with one).
//!
//! Percentile operations read a fixed positional index out of the shared
//! percentile-array column; the index order is the contract established by
//! [`Operation::percentile_index`]. Non-finite values (the backend may
//! legitimately produce them, e.g. an average over zero samples) are
//! normalized to null so they never leak as non-JSON-safe numbers.
//!
//! Group output order is backend row order: relative ordering produced by an
//! ORDER BY clause must be preserved end to end.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::backend::{parse_tag_column, Row, METRIC_ID_COL, TS_COL_GROUP};
use crate::catalog;
use crate::error::{QueryError, Result};
use crate::indexer::{reverse_resolve_known, StringIndexer};
use crate::query::definition::QueryDefinition;
use crate::types::{EntityKey, GroupResult, Operation};

/// The executed rows for one entity's query pair
#[derive(Debug, Clone)]
pub struct EntityResults {
    /// Entity the rows came from
    pub entity: EntityKey,
    /// Rows of the totals query
    pub totals: Vec<Row>,
    /// Rows of the series query, when one was executed
    pub series: Option<Vec<Row>>,
}

/// Normalize a backend number: non-finite becomes null
pub fn finite_or_none(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

// Canonical grouping key: (tag column, code) pairs sorted by column name
type GroupKey = Vec<(String, i64)>;

#[derive(Default)]
struct GroupData {
    totals: BTreeMap<String, Option<f64>>,
    series: Option<BTreeMap<String, Vec<Option<f64>>>>,
}

/// Reassembles raw result rows into [`GroupResult`]s
pub struct ResultConverter<'a> {
    indexer: &'a dyn StringIndexer,
    intervals: Vec<DateTime<Utc>>,
    timestamp_index: HashMap<DateTime<Utc>, usize>,
    ops_by_metric: HashMap<String, Vec<Operation>>,
}

impl<'a> ResultConverter<'a> {
    /// Create a converter for one request
    pub fn new(
        definition: &QueryDefinition,
        intervals: Vec<DateTime<Utc>>,
        indexer: &'a dyn StringIndexer,
    ) -> Self {
        let mut ops_by_metric: HashMap<String, Vec<Operation>> = HashMap::new();
        for (_, field) in definition.fields() {
            ops_by_metric
                .entry(field.metric.clone())
                .or_default()
                .push(field.operation);
        }

        let timestamp_index = intervals
            .iter()
            .enumerate()
            .map(|(index, timestamp)| (*timestamp, index))
            .collect();

        Self {
            indexer,
            intervals,
            timestamp_index,
            ops_by_metric,
        }
    }

    /// Convert all per-entity results into the final ordered group list
    pub fn convert(&self, results: &[EntityResults]) -> Result<Vec<GroupResult>> {
        // Insertion order doubles as output order
        let mut order: Vec<GroupKey> = Vec::new();
        let mut groups: HashMap<GroupKey, GroupData> = HashMap::new();

        for entity_results in results {
            for row in &entity_results.totals {
                self.extract_row(entity_results.entity, row, &mut order, &mut groups)?;
            }
            if let Some(series_rows) = &entity_results.series {
                for row in series_rows {
                    self.extract_row(entity_results.entity, row, &mut order, &mut groups)?;
                }
            }
        }

        order
            .into_iter()
            .map(|key| {
                let data = groups.remove(&key).expect("group recorded in order");
                let mut by = BTreeMap::new();
                for (column, code) in key {
                    let tag_code = parse_tag_column(&column).ok_or_else(|| {
                        QueryError::Inconsistent(format!("malformed tag column '{}'", column))
                    })?;
                    by.insert(
                        reverse_resolve_known(self.indexer, tag_code)?,
                        reverse_resolve_known(self.indexer, code)?,
                    );
                }
                Ok(GroupResult {
                    by,
                    totals: data.totals,
                    series: data.series,
                })
            })
            .collect()
    }

    fn extract_row(
        &self,
        entity: EntityKey,
        row: &Row,
        order: &mut Vec<GroupKey>,
        groups: &mut HashMap<GroupKey, GroupData>,
    ) -> Result<()> {
        let mut key: GroupKey = row
            .iter()
            .filter(|(column, _)| column.starts_with("tags["))
            .map(|(column, value)| {
                let code = value.as_i64().ok_or_else(|| {
                    QueryError::Inconsistent(format!("non-integer tag column '{}'", column))
                })?;
                Ok((column.clone(), code))
            })
            .collect::<Result<_>>()?;
        key.sort();

        let metric_id = row
            .get(METRIC_ID_COL)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| QueryError::Inconsistent("row is missing metric_id".to_string()))?;
        let metric_name = reverse_resolve_known(self.indexer, metric_id)?;

        let ops = match self.ops_by_metric.get(&metric_name) {
            Some(ops) => ops,
            None => {
                warn!(metric = %metric_name, "backend returned a metric that was not requested");
                return Ok(());
            }
        };

        if !groups.contains_key(&key) {
            order.push(key.clone());
            groups.insert(key.clone(), GroupData::default());
        }
        let group = groups.get_mut(&key).expect("group just inserted");

        let timestamp = row.get(TS_COL_GROUP).and_then(|v| v.as_timestamp());

        for op in ops {
            let field_key = format!("{}({})", op.as_str(), metric_name);
            let agg = catalog::aggregate_field(entity, *op).ok_or_else(|| {
                QueryError::Inconsistent(format!(
                    "operation '{}' has no aggregate on entity '{}'",
                    op.as_str(),
                    entity.as_str()
                ))
            })?;

            let value = match op.percentile_index() {
                Some(index) => row
                    .get(agg.alias)
                    .and_then(|v| v.as_f64_array())
                    .and_then(|quantiles| quantiles.get(index).copied()),
                None => row.get(agg.alias).and_then(|v| v.as_f64()),
            };
            // Missing buckets and non-finite aggregates both become null
            let value = value.and_then(finite_or_none);

            match timestamp {
                None => {
                    group.totals.insert(field_key, value);
                }
                Some(timestamp) => {
                    let position =
                        self.timestamp_index.get(&timestamp).copied().ok_or_else(|| {
                            QueryError::Inconsistent(format!(
                                "bucket timestamp {} outside the interval sequence",
                                timestamp
                            ))
                        })?;
                    let series = group
                        .series
                        .get_or_insert_with(BTreeMap::new)
                        .entry(field_key)
                        .or_insert_with(|| {
                            vec![op.default_series_value(); self.intervals.len()]
                        });
                    series[position] = value;
                }
            }
        }

        Ok(())
    }
}
