//! Query compiler: one backend query pair per referenced metric entity
//!
//! Given a validated [`QueryDefinition`] and a resolved project scope, the
//! compiler groups the requested fields by the entity implied by each
//! metric's type and emits, per entity, a "totals" query and (when no
//! ordering was requested) a "series" query that additionally buckets rows by
//! time. Ordering and per-interval series are mutually exclusive: a single
//! ordered, limited query cannot be expanded into per-bucket rows without a
//! second round trip.
//!
//! Metric names, tag keys and tag values are resolved to integer codes
//! through the indexer. Inside filter conditions, a user-supplied tag or
//! value that was never indexed compiles to a condition against the reserved
//! code zero, which matches nothing; the tag may legitimately not exist yet,
//! so this is not an error. Group-by tags are held to a stricter standard:
//! they come back as result columns that must reverse-resolve, so an
//! unindexed group-by tag is rejected up front.

use tracing::{debug, warn};

use crate::backend::{
    tag_column, AggregateExpr, BackendQuery, Condition, OrderBy, WhereClause, METRIC_ID_COL,
    TS_COL_GROUP, TS_COL_QUERY,
};
use crate::catalog;
use crate::config::MAX_POINTS;
use crate::error::{QueryError, Result};
use crate::indexer::{StringIndexer, UNRESOLVED_CODE};
use crate::query::definition::{MetricField, QueryDefinition};
use crate::query::filter::FilterExpr;
use crate::types::{check_project_scope, EntityKey, Project};

/// The compiled query pair for one entity
#[derive(Debug, Clone)]
pub struct EntityQueries {
    /// Aggregates over the whole window, one row per group
    pub totals: BackendQuery,
    /// Aggregates per time bucket; absent when an ordering was requested
    pub series: Option<BackendQuery>,
}

/// Compiles a [`QueryDefinition`] into per-entity backend queries
pub struct QueryBuilder<'a> {
    projects: &'a [Project],
    definition: &'a QueryDefinition,
    indexer: &'a dyn StringIndexer,
}

impl<'a> QueryBuilder<'a> {
    /// Create a compiler for one request
    pub fn new(
        projects: &'a [Project],
        definition: &'a QueryDefinition,
        indexer: &'a dyn StringIndexer,
    ) -> Self {
        Self {
            projects,
            definition,
            indexer,
        }
    }

    /// Produce one query pair per metric entity referenced by the field
    /// list, in order of first appearance
    pub fn build(&self) -> Result<Vec<(EntityKey, EntityQueries)>> {
        let mut by_entity: Vec<(EntityKey, Vec<&MetricField>)> = Vec::new();
        for (_, field) in self.definition.fields() {
            let spec = catalog::metric_spec(&field.metric)?;
            let entity = catalog::entity_for(spec.metric_type)?;
            match by_entity.iter_mut().find(|(e, _)| *e == entity) {
                Some((_, fields)) => fields.push(field),
                None => by_entity.push((entity, vec![field])),
            }
        }

        let where_clauses = self.build_where()?;
        let groupby = self.build_groupby()?;

        let queries = by_entity
            .into_iter()
            .map(|(entity, fields)| {
                let queries =
                    self.build_entity_queries(entity, &fields, &where_clauses, &groupby)?;
                Ok((entity, queries))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            entities = queries.len(),
            fields = self.definition.fields().len(),
            "compiled metrics query"
        );
        Ok(queries)
    }

    /// Resolve a user-supplied string, falling back to the never-matching
    /// sentinel code when it was never indexed
    fn resolve_or_sentinel(&self, string: &str) -> i64 {
        match self.indexer.resolve(string) {
            Some(code) => code,
            None => {
                warn!(string, "string not indexed; condition will match nothing");
                UNRESOLVED_CODE
            }
        }
    }

    fn build_filter(&self, filter: &FilterExpr) -> Option<WhereClause> {
        let branches = filter
            .or
            .iter()
            .filter_map(|terms| {
                WhereClause::all(
                    terms
                        .iter()
                        .map(|term| {
                            WhereClause::Cond(Condition::eq(
                                tag_column(self.resolve_or_sentinel(&term.key)),
                                self.resolve_or_sentinel(&term.value),
                            ))
                        })
                        .collect(),
                )
            })
            .collect();
        WhereClause::any(branches)
    }

    fn build_where(&self) -> Result<Vec<WhereClause>> {
        let org_id = check_project_scope(self.projects)?;

        let metric_ids = self
            .definition
            .fields()
            .iter()
            .map(|(_, field)| self.resolve_or_sentinel(&field.metric))
            .collect();

        let mut where_clauses = vec![
            WhereClause::Cond(Condition::eq("org_id", org_id as i64)),
            WhereClause::Cond(Condition::is_in(
                "project_id",
                self.projects.iter().map(|p| p.id as i64).collect(),
            )),
            WhereClause::Cond(Condition::is_in(METRIC_ID_COL, metric_ids)),
            WhereClause::Cond(Condition::time_gte(TS_COL_QUERY, self.definition.start())),
            WhereClause::Cond(Condition::time_lt(TS_COL_QUERY, self.definition.end())),
        ];

        if let Some(filter) = self.definition.parsed_query() {
            if let Some(clause) = self.build_filter(filter) {
                where_clauses.push(clause);
            }
        }

        Ok(where_clauses)
    }

    fn build_groupby(&self) -> Result<Vec<String>> {
        let mut groupby = vec![METRIC_ID_COL.to_string()];
        for tag in self.definition.groupby() {
            // Unlike filter terms, a group-by tag becomes a result column
            // whose code must reverse-resolve during conversion; an unindexed
            // tag can only produce a broken column, so reject it here.
            let code = self
                .indexer
                .resolve(tag)
                .ok_or_else(|| QueryError::InvalidParams(format!("Unknown tag '{}'", tag)))?;
            groupby.push(tag_column(code));
        }
        Ok(groupby)
    }

    fn build_select(&self, entity: EntityKey, fields: &[&MetricField]) -> Result<Vec<AggregateExpr>> {
        let mut select: Vec<AggregateExpr> = Vec::with_capacity(fields.len());
        for field in fields {
            let agg = catalog::aggregate_field(entity, field.operation).ok_or_else(|| {
                QueryError::InvalidParams(format!(
                    "Invalid operation '{}' for metric '{}'",
                    field.operation.as_str(),
                    field.metric
                ))
            })?;
            // The five percentiles share one array-returning call; emit it once
            if select.iter().any(|expr| expr.alias == agg.alias) {
                continue;
            }
            select.push(AggregateExpr {
                function: agg.function.to_string(),
                column: "value".to_string(),
                alias: agg.alias.to_string(),
            });
        }
        Ok(select)
    }

    fn build_orderby(&self, entity: EntityKey) -> Result<Option<OrderBy>> {
        let order = match self.definition.orderby() {
            None => return Ok(None),
            Some(order) => order,
        };
        let agg = catalog::aggregate_field(entity, order.field.operation).ok_or_else(|| {
            QueryError::InvalidParams(format!(
                "Invalid operation '{}' for metric '{}'",
                order.field.operation.as_str(),
                order.field.metric
            ))
        })?;
        Ok(Some(OrderBy {
            alias: agg.alias.to_string(),
            direction: order.direction,
        }))
    }

    fn build_entity_queries(
        &self,
        entity: EntityKey,
        fields: &[&MetricField],
        where_clauses: &[WhereClause],
        groupby: &[String],
    ) -> Result<EntityQueries> {
        let totals = BackendQuery {
            entity,
            select: self.build_select(entity, fields)?,
            where_clauses: where_clauses.to_vec(),
            groupby: groupby.to_vec(),
            orderby: self.build_orderby(entity)?,
            limit: self.definition.limit().unwrap_or(MAX_POINTS),
            offset: 0,
            granularity: self.definition.rollup(),
        };

        let series = if totals.orderby.is_none() {
            let mut series = totals.clone();
            series.groupby.push(TS_COL_GROUP.to_string());
            Some(series)
        } else {
            None
        };

        Ok(EntityQueries { totals, series })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompareOp, ConditionValue};
    use crate::indexer::MemoryIndexer;
    use crate::query::definition::QueryParams;

    fn projects() -> Vec<Project> {
        vec![Project { id: 1, org_id: 42 }]
    }

    fn definition(pairs: Vec<(&str, &str)>) -> QueryDefinition {
        let mut all = vec![
            ("interval", "1h"),
            ("start", "2021-08-24T00:00:00+00:00"),
            ("end", "2021-08-25T00:00:00+00:00"),
        ];
        all.extend(pairs);
        QueryDefinition::from_params(&QueryParams::from_pairs(all)).unwrap()
    }

    #[test]
    fn test_single_entity_totals_and_series() {
        let indexer = MemoryIndexer::new();
        indexer.intern("session");
        indexer.intern("environment");

        let def = definition(vec![("field", "sum(session)"), ("groupBy", "environment")]);
        let projects = projects();
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();

        assert_eq!(queries.len(), 1);
        let (entity, pair) = &queries[0];
        assert_eq!(*entity, EntityKey::MetricsCounters);

        assert_eq!(pair.totals.select.len(), 1);
        assert_eq!(pair.totals.select[0].function, "sum");
        assert_eq!(pair.totals.select[0].alias, "value");
        assert_eq!(pair.totals.granularity, 3600);
        assert_eq!(pair.totals.limit, MAX_POINTS);
        assert_eq!(
            pair.totals.groupby,
            vec![
                METRIC_ID_COL.to_string(),
                tag_column(indexer.resolve("environment").unwrap())
            ]
        );

        let series = pair.series.as_ref().expect("series query present");
        assert_eq!(
            series.groupby.last().map(String::as_str),
            Some(TS_COL_GROUP)
        );
        assert_eq!(series.select, pair.totals.select);
    }

    #[test]
    fn test_orderby_suppresses_series() {
        let indexer = MemoryIndexer::new();
        indexer.intern("session");

        let def = definition(vec![
            ("field", "sum(session)"),
            ("orderBy", "sum(session)"),
            ("limit", "1"),
        ]);
        let projects = projects();
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();

        let (_, pair) = &queries[0];
        assert!(pair.series.is_none());
        let order = pair.totals.orderby.as_ref().unwrap();
        assert_eq!(order.alias, "value");
        assert_eq!(pair.totals.limit, 1);
    }

    #[test]
    fn test_fields_grouped_by_entity_in_first_appearance_order() {
        let indexer = MemoryIndexer::new();
        let def = definition(vec![
            ("field", "count_unique(user)"),
            ("field", "sum(session)"),
            ("field", "p50(session.duration)"),
        ]);
        let projects = projects();
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();

        let entities: Vec<EntityKey> = queries.iter().map(|(e, _)| *e).collect();
        assert_eq!(
            entities,
            vec![
                EntityKey::MetricsSets,
                EntityKey::MetricsCounters,
                EntityKey::MetricsDistributions,
            ]
        );
    }

    #[test]
    fn test_percentile_select_deduplicated() {
        let indexer = MemoryIndexer::new();
        let def = definition(vec![
            ("field", "p50(session.duration)"),
            ("field", "p99(session.duration)"),
            ("field", "max(session.duration)"),
        ]);
        let projects = projects();
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();

        let (_, pair) = &queries[0];
        let aliases: Vec<&str> = pair
            .totals
            .select
            .iter()
            .map(|expr| expr.alias.as_str())
            .collect();
        assert_eq!(aliases, vec!["percentiles", "max"]);
    }

    #[test]
    fn test_unindexed_groupby_tag_fails() {
        let indexer = MemoryIndexer::new();
        indexer.intern("session");
        // "environment" was never indexed; there is nothing to group by

        let def = definition(vec![("field", "sum(session)"), ("groupBy", "environment")]);
        let projects = projects();
        let err = QueryBuilder::new(&projects, &def, &indexer)
            .build()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidParams(_)));
    }

    #[test]
    fn test_unknown_metric_fails() {
        let indexer = MemoryIndexer::new();
        let def = definition(vec![("field", "sum(unheard_of)")]);
        let projects = projects();
        let err = QueryBuilder::new(&projects, &def, &indexer)
            .build()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidParams(_)));
    }

    #[test]
    fn test_operation_type_mismatch_fails() {
        let indexer = MemoryIndexer::new();
        // `user` is a set metric; `sum` only applies to counters
        let def = definition(vec![("field", "sum(user)")]);
        let projects = projects();
        let err = QueryBuilder::new(&projects, &def, &indexer)
            .build()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidParams(_)));
    }

    #[test]
    fn test_unindexed_filter_matches_nothing() {
        let indexer = MemoryIndexer::new();
        indexer.intern("session");
        // Neither the tag key nor the value is indexed

        let def = definition(vec![
            ("field", "sum(session)"),
            ("query", "environment:production"),
        ]);
        let projects = projects();
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();

        let (_, pair) = &queries[0];
        let filter = pair.totals.where_clauses.last().unwrap();
        match filter {
            WhereClause::Cond(cond) => {
                assert_eq!(cond.column, tag_column(UNRESOLVED_CODE));
                assert_eq!(cond.op, CompareOp::Eq);
                assert_eq!(cond.value, ConditionValue::Int(UNRESOLVED_CODE));
            }
            other => panic!("expected sentinel condition, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_builds_or_of_ands() {
        let indexer = MemoryIndexer::new();
        for s in [
            "session",
            "release",
            "myapp@2.0.0",
            "environment",
            "production",
            "session.status",
            "healthy",
        ] {
            indexer.intern(s);
        }

        let def = definition(vec![
            ("field", "sum(session)"),
            (
                "query",
                "release:myapp@2.0.0 and environment:production or session.status:healthy",
            ),
        ]);
        let projects = projects();
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();

        let (_, pair) = &queries[0];
        match pair.totals.where_clauses.last().unwrap() {
            WhereClause::Or(branches) => {
                assert_eq!(branches.len(), 2);
                assert!(matches!(branches[0], WhereClause::And(ref terms) if terms.len() == 2));
                assert!(matches!(branches[1], WhereClause::Cond(_)));
            }
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_where_scope() {
        let indexer = MemoryIndexer::new();
        indexer.intern("session");
        let def = definition(vec![("field", "sum(session)")]);
        let projects = vec![
            Project { id: 1, org_id: 42 },
            Project { id: 2, org_id: 42 },
        ];
        let queries = QueryBuilder::new(&projects, &def, &indexer).build().unwrap();
        let (_, pair) = &queries[0];

        // org eq, project in, metric_id in, time gte, time lt
        assert_eq!(pair.totals.where_clauses.len(), 5);
        match &pair.totals.where_clauses[1] {
            WhereClause::Cond(cond) => {
                assert_eq!(cond.column, "project_id");
                assert_eq!(cond.value, ConditionValue::Ints(vec![1, 2]));
            }
            other => panic!("expected project condition, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_organizations_fail_fast() {
        let indexer = MemoryIndexer::new();
        let def = definition(vec![("field", "sum(session)")]);
        let projects = vec![
            Project { id: 1, org_id: 42 },
            Project { id: 2, org_id: 43 },
        ];
        let err = QueryBuilder::new(&projects, &def, &indexer)
            .build()
            .unwrap_err();
        assert!(matches!(err, QueryError::Inconsistent(_)));
    }
}
