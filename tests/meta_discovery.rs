//! Integration tests for metadata discovery
//!
//! [`MetaReader`] infers available metrics, tag keys and tag values by
//! sampling recent rows of each metric entity. These tests script the
//! per-entity responses and check the merge semantics: first-entity-wins for
//! single-metric lookups, intersection across a metric scope, union without
//! one, and sentinel filtering for tag values.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use kuba_metrics::backend::{tag_column, Datum, Row};
use kuba_metrics::meta::MetaReader;
use kuba_metrics::{
    BackendQuery, EntityKey, MemoryIndexer, MetricType, MetricsBackend, Project, QueryError,
    Result,
};

/// Backend replaying canned rows per entity and recording cache hints
#[derive(Default)]
struct ScriptedBackend {
    responses: Mutex<HashMap<EntityKey, Vec<Row>>>,
    cache_hints: Mutex<Vec<bool>>,
}

impl ScriptedBackend {
    fn stage(&self, entity: EntityKey, rows: Vec<Row>) {
        self.responses.lock().insert(entity, rows);
    }
}

#[async_trait]
impl MetricsBackend for ScriptedBackend {
    async fn submit(&self, query: &BackendQuery, _referrer: &str, use_cache: bool) -> Result<Vec<Row>> {
        self.cache_hints.lock().push(use_cache);
        Ok(self
            .responses
            .lock()
            .get(&query.entity)
            .cloned()
            .unwrap_or_default())
    }
}

fn row(columns: Vec<(String, Datum)>) -> Row {
    columns.into_iter().collect()
}

fn projects() -> Vec<Project> {
    vec![Project { id: 1, org_id: 1 }]
}

#[tokio::test]
async fn test_get_metrics_covers_all_entities() {
    let indexer = Arc::new(MemoryIndexer::new());
    let session = indexer.intern("session");
    let user = indexer.intern("user");

    let backend = ScriptedBackend::default();
    backend.stage(
        EntityKey::MetricsCounters,
        vec![row(vec![("metric_id".to_string(), Datum::Int(session))])],
    );
    backend.stage(
        EntityKey::MetricsSets,
        vec![row(vec![("metric_id".to_string(), Datum::Int(user))])],
    );

    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();
    let metrics = reader.get_metrics().await.unwrap();

    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].name, "session");
    assert_eq!(metrics[0].metric_type, MetricType::Counter);
    assert_eq!(metrics[1].name, "user");
    assert_eq!(metrics[1].metric_type, MetricType::Set);
    // Discovery queries are cacheable
    assert!(backend.cache_hints.lock().iter().all(|hint| *hint));
}

#[tokio::test]
async fn test_get_single_metric_first_entity_wins() {
    let indexer = Arc::new(MemoryIndexer::new());
    let session = indexer.intern("session");
    let environment = indexer.intern("environment");
    let release = indexer.intern("release");

    let backend = ScriptedBackend::default();
    backend.stage(
        EntityKey::MetricsCounters,
        vec![row(vec![
            ("metric_id".to_string(), Datum::Int(session)),
            (
                "tags.key".to_string(),
                Datum::IntArray(vec![release, environment]),
            ),
        ])],
    );

    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();
    let meta = reader.get_single_metric("session").await.unwrap();

    assert_eq!(meta.name, "session");
    assert_eq!(meta.metric_type, MetricType::Counter);
    let keys: Vec<&str> = meta.tags.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys, vec!["environment", "release"]);
}

#[tokio::test]
async fn test_get_single_metric_absent_everywhere() {
    let indexer = Arc::new(MemoryIndexer::new());
    indexer.intern("session");

    let backend = ScriptedBackend::default();
    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();

    let err = reader.get_single_metric("session").await.unwrap_err();
    assert!(matches!(err, QueryError::InvalidParams(_)));
}

#[tokio::test]
async fn test_get_tags_intersects_scoped_metrics() {
    let indexer = Arc::new(MemoryIndexer::new());
    let session = indexer.intern("session");
    let user = indexer.intern("user");
    let environment = indexer.intern("environment");
    let release = indexer.intern("release");
    let status = indexer.intern("session.status");

    let backend = ScriptedBackend::default();
    backend.stage(
        EntityKey::MetricsCounters,
        vec![row(vec![
            ("metric_id".to_string(), Datum::Int(session)),
            (
                "tags.key".to_string(),
                Datum::IntArray(vec![environment, release, status]),
            ),
        ])],
    );
    backend.stage(
        EntityKey::MetricsSets,
        vec![row(vec![
            ("metric_id".to_string(), Datum::Int(user)),
            (
                "tags.key".to_string(),
                Datum::IntArray(vec![environment, status]),
            ),
        ])],
    );

    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();

    let scoped = reader
        .get_tags(Some(&["session", "user"]))
        .await
        .unwrap();
    let keys: Vec<&str> = scoped.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys, vec!["environment", "session.status"]);

    let all = reader.get_tags(None).await.unwrap();
    let keys: Vec<&str> = all.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys, vec!["environment", "release", "session.status"]);
}

#[tokio::test]
async fn test_get_tags_unindexed_scope_short_circuits() {
    let indexer = Arc::new(MemoryIndexer::new());
    indexer.intern("session");

    let backend = ScriptedBackend::default();
    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();

    // "never-indexed" cannot have any tags, so no query is even issued
    let tags = reader
        .get_tags(Some(&["session", "never-indexed"]))
        .await
        .unwrap();
    assert!(tags.is_empty());
    assert!(backend.cache_hints.lock().is_empty());
}

#[tokio::test]
async fn test_get_tag_values_filters_sentinel_codes() {
    let indexer = Arc::new(MemoryIndexer::new());
    let session = indexer.intern("session");
    let environment = indexer.intern("environment");
    let production = indexer.intern("production");

    let backend = ScriptedBackend::default();
    backend.stage(
        EntityKey::MetricsCounters,
        vec![
            row(vec![
                ("metric_id".to_string(), Datum::Int(session)),
                (tag_column(environment), Datum::Int(production)),
            ]),
            // Rows without the tag surface the zero sentinel
            row(vec![
                ("metric_id".to_string(), Datum::Int(session)),
                (tag_column(environment), Datum::Int(0)),
            ]),
        ],
    );

    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();
    let values = reader.get_tag_values("environment", None).await.unwrap();

    assert_eq!(values.len(), 1);
    assert_eq!(values[0].key, "environment");
    assert_eq!(values[0].value, "production");
}

#[tokio::test]
async fn test_unknown_tag_name_is_rejected() {
    let indexer = Arc::new(MemoryIndexer::new());
    let backend = ScriptedBackend::default();
    let projects = projects();
    let reader = MetaReader::new(&projects, &backend, indexer.as_ref()).unwrap();

    let err = reader.get_tag_values("no-such-tag", None).await.unwrap_err();
    assert!(matches!(err, QueryError::InvalidParams(_)));
}
