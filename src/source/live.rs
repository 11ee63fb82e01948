//! Live data source running the full pipeline against a backend

use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tracing::debug;

use crate::backend::MetricsBackend;
use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::indexer::StringIndexer;
use crate::meta::MetaReader;
use crate::query::{EntityResults, QueryBuilder, QueryDefinition, ResultConverter};
use crate::source::DataSource;
use crate::types::{MetricMeta, MetricMetaWithTagKeys, Project, SeriesResult, Tag, TagValue};

/// Data source backed by a real columnar store and string indexer
///
/// Series queries run the compile / submit / convert pipeline, with the
/// per-entity sub-queries submitted concurrently. Metadata queries are
/// delegated to [`MetaReader`].
pub struct LiveDataSource {
    backend: Arc<dyn MetricsBackend>,
    indexer: Arc<dyn StringIndexer>,
    config: QueryConfig,
}

impl LiveDataSource {
    /// Create a data source on top of a backend and an indexer, with the
    /// default limits
    pub fn new(backend: Arc<dyn MetricsBackend>, indexer: Arc<dyn StringIndexer>) -> Self {
        Self::with_config(backend, indexer, QueryConfig::default())
    }

    /// Create a data source with explicit limits
    pub fn with_config(
        backend: Arc<dyn MetricsBackend>,
        indexer: Arc<dyn StringIndexer>,
        config: QueryConfig,
    ) -> Self {
        Self {
            backend,
            indexer,
            config,
        }
    }

    fn meta_reader<'a>(&'a self, projects: &'a [Project]) -> Result<MetaReader<'a>> {
        MetaReader::with_lookback(
            projects,
            self.backend.as_ref(),
            self.indexer.as_ref(),
            self.config.meta_lookback_hours,
        )
    }
}

#[async_trait]
impl DataSource for LiveDataSource {
    async fn get_metrics(&self, projects: &[Project]) -> Result<Vec<MetricMeta>> {
        self.meta_reader(projects)?.get_metrics().await
    }

    async fn get_single_metric(
        &self,
        projects: &[Project],
        metric_name: &str,
    ) -> Result<MetricMetaWithTagKeys> {
        self.meta_reader(projects)?.get_single_metric(metric_name).await
    }

    async fn get_tags(
        &self,
        projects: &[Project],
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<Tag>> {
        self.meta_reader(projects)?.get_tags(metric_names).await
    }

    async fn get_tag_values(
        &self,
        projects: &[Project],
        tag_name: &str,
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<TagValue>> {
        self.meta_reader(projects)?
            .get_tag_values(tag_name, metric_names)
            .await
    }

    async fn get_series(
        &self,
        projects: &[Project],
        definition: &QueryDefinition,
    ) -> Result<SeriesResult> {
        let compiled = QueryBuilder::new(projects, definition, self.indexer.as_ref()).build()?;
        debug!(entities = compiled.len(), "submitting compiled queries");

        let results = future::try_join_all(compiled.into_iter().map(|(entity, queries)| {
            let backend = Arc::clone(&self.backend);
            async move {
                let totals = backend
                    .submit(&queries.totals, "api.metrics.totals", false)
                    .await?;
                let series = match &queries.series {
                    Some(series_query) => Some(
                        backend
                            .submit(series_query, "api.metrics.series", false)
                            .await?,
                    ),
                    None => None,
                };
                Ok::<_, QueryError>(EntityResults {
                    entity,
                    totals,
                    series,
                })
            }
        }))
        .await?;

        let intervals = definition.intervals();
        let converter = ResultConverter::new(definition, intervals.clone(), self.indexer.as_ref());
        let groups = converter.convert(&results)?;

        Ok(SeriesResult {
            start: definition.start(),
            end: definition.end(),
            query: definition.query().to_string(),
            intervals,
            groups,
        })
    }
}
