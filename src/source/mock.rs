//! Catalog-backed mock data source
//!
//! Serves the development metric registry as metadata and generates
//! deterministic pseudo-random series, so API consumers can be developed and
//! tested without a backend or an indexer.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::catalog::{self, MetricSpec, METRICS};
use crate::error::{QueryError, Result};
use crate::query::QueryDefinition;
use crate::source::DataSource;
use crate::types::{
    GroupResult, MetricMeta, MetricMetaWithTagKeys, Operation, Project, SeriesResult, Tag,
    TagValue,
};

/// Data source answering from the static catalog with generated series
///
/// Series values are drawn from a seeded RNG, so two sources built with the
/// same seed produce identical answers. Totals are derived from the generated
/// series per operation; not mathematically exact, but plausible.
pub struct MockDataSource {
    seed: u64,
}

impl MockDataSource {
    /// Create a mock source; equal seeds yield equal series
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn validate_metric_names<'n>(metric_names: &'n [&'n str]) -> Result<&'n [&'n str]> {
        let unknown: Vec<&str> = metric_names
            .iter()
            .filter(|name| !METRICS.contains_key(*name))
            .copied()
            .collect();
        if !unknown.is_empty() {
            return Err(QueryError::InvalidParams(format!(
                "Unknown metrics '{}'",
                unknown.join(", ")
            )));
        }
        Ok(metric_names)
    }

    fn tag_values_of(spec: &MetricSpec, tag_name: &str) -> Result<BTreeSet<String>> {
        match spec.tags.get(tag_name) {
            Some(values) => Ok(values.iter().map(|v| v.to_string()).collect()),
            None => Err(QueryError::InvalidParams(format!(
                "Unknown tag '{}'",
                tag_name
            ))),
        }
    }

    /// Derive a whole-window total from a generated series
    fn total_of(operation: Operation, values: &[f64]) -> f64 {
        let len = values.len();
        let sum: f64 = values.iter().sum();
        match operation {
            Operation::Avg => sum / len as f64,
            Operation::Count | Operation::Sum => sum,
            Operation::CountUnique => (3.0 * sum / len as f64).floor(),
            Operation::Max => values.iter().copied().fold(f64::MIN, f64::max),
            Operation::Min => values.iter().copied().fold(f64::MAX, f64::min),
            Operation::P50 => values[(0.50 * len as f64) as usize],
            Operation::P75 => values[(0.75 * len as f64) as usize],
            Operation::P90 => values[(0.90 * len as f64) as usize],
            Operation::P95 => values[(0.95 * len as f64) as usize],
            Operation::P99 => values[(0.99 * len as f64) as usize],
        }
    }

    /// Generate one group's series and totals for every requested field
    fn generate_group(
        definition: &QueryDefinition,
        interval_count: usize,
        rng: &mut StdRng,
        by: BTreeMap<String, String>,
    ) -> Result<GroupResult> {
        let mut totals = BTreeMap::new();
        let mut series = BTreeMap::new();

        for (key, field) in definition.fields() {
            let spec = catalog::metric_spec(&field.metric)?;
            if !spec.operations().contains(&field.operation) {
                return Err(QueryError::InvalidParams(format!(
                    "Invalid operation '{}' for metric '{}'",
                    field.operation.as_str(),
                    field.metric
                )));
            }

            let mu = 1000.0 * rng.gen::<f64>();
            let mut values: Vec<f64> = (0..interval_count)
                .map(|_| mu + 100.0 * (rng.gen::<f64>() - 0.5))
                .collect();
            // Unique counts are whole numbers
            if field.operation == Operation::CountUnique {
                for value in &mut values {
                    *value = value.trunc();
                }
            }

            totals.insert(key.clone(), Some(Self::total_of(field.operation, &values)));
            series.insert(key.clone(), values.into_iter().map(Some).collect());
        }

        Ok(GroupResult {
            by,
            totals,
            series: Some(series),
        })
    }
}

impl Default for MockDataSource {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    async fn get_metrics(&self, _projects: &[Project]) -> Result<Vec<MetricMeta>> {
        Ok(METRICS
            .iter()
            .map(|(name, spec)| MetricMeta {
                name: name.to_string(),
                metric_type: spec.metric_type,
                operations: spec.operations().to_vec(),
                unit: spec.unit,
            })
            .collect())
    }

    async fn get_single_metric(
        &self,
        _projects: &[Project],
        metric_name: &str,
    ) -> Result<MetricMetaWithTagKeys> {
        let spec = catalog::metric_spec(metric_name)?;
        Ok(MetricMetaWithTagKeys {
            name: metric_name.to_string(),
            metric_type: spec.metric_type,
            operations: spec.operations().to_vec(),
            // BTreeMap keys are already sorted
            tags: spec
                .tags
                .keys()
                .map(|key| Tag {
                    key: key.to_string(),
                })
                .collect(),
            unit: spec.unit,
        })
    }

    async fn get_tags(
        &self,
        _projects: &[Project],
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<Tag>> {
        let keys: BTreeSet<&str> = match metric_names {
            None => METRICS
                .values()
                .flat_map(|spec| spec.tags.keys().copied())
                .collect(),
            Some(names) => {
                let names = Self::validate_metric_names(names)?;
                let mut sets = names.iter().map(|name| {
                    METRICS[name].tags.keys().copied().collect::<BTreeSet<_>>()
                });
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, set| acc.intersection(&set).copied().collect())
            }
        };
        Ok(keys
            .into_iter()
            .map(|key| Tag {
                key: key.to_string(),
            })
            .collect())
    }

    async fn get_tag_values(
        &self,
        _projects: &[Project],
        tag_name: &str,
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<TagValue>> {
        let values: BTreeSet<String> = match metric_names {
            None => METRICS
                .values()
                .flat_map(|spec| spec.tags.get(tag_name).into_iter().flatten())
                .map(|v| v.to_string())
                .collect(),
            Some(names) => {
                let names = Self::validate_metric_names(names)?;
                let mut sets = names
                    .iter()
                    .map(|name| Self::tag_values_of(&METRICS[name], tag_name));
                let first = sets.next().transpose()?.unwrap_or_default();
                sets.try_fold(first, |acc, set| {
                    Ok::<_, QueryError>(acc.intersection(&set?).cloned().collect())
                })?
            }
        };
        Ok(values
            .into_iter()
            .map(|value| TagValue {
                key: tag_name.to_string(),
                value,
            })
            .collect())
    }

    async fn get_series(
        &self,
        _projects: &[Project],
        definition: &QueryDefinition,
    ) -> Result<SeriesResult> {
        let intervals = definition.intervals();
        let mut rng = StdRng::seed_from_u64(self.seed);

        // Cartesian product over each grouped tag's catalog-wide vocabulary;
        // a tag with no known values produces no groups at all
        let mut combinations: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
        for tag_name in definition.groupby() {
            let values: BTreeSet<&str> = METRICS
                .values()
                .flat_map(|spec| spec.tags.get(tag_name.as_str()).into_iter().flatten())
                .copied()
                .collect();
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combination in &combinations {
                for value in &values {
                    let mut by = combination.clone();
                    by.insert(tag_name.clone(), value.to_string());
                    next.push(by);
                }
            }
            combinations = next;
        }

        let groups = combinations
            .into_iter()
            .map(|by| Self::generate_group(definition, intervals.len(), &mut rng, by))
            .collect::<Result<Vec<GroupResult>>>()?;

        Ok(SeriesResult {
            start: definition.start(),
            end: definition.end(),
            query: definition.query().to_string(),
            intervals,
            groups,
        })
    }
}
