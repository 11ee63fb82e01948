//! Kuba Metrics - Query engine for tag-indexed metrics on a columnar store
//!
//! This library translates high-level metrics queries (aggregation fields,
//! group-by tags, a boolean tag filter and a time window) into per-entity
//! queries against a columnar time-series backend, then reassembles the raw
//! result rows into densely indexed series/totals groups:
//! - Field and filter-expression parsing into an immutable query definition
//! - A static catalog mapping operations to backend aggregate functions
//! - A query compiler producing totals and time-bucketed series queries
//! - A result converter producing gap-filled, interval-aligned groups
//! - Metadata discovery (metric names, types, tag vocabularies) by sampling
//!   recent data
//!
//! Metric names, tag keys and tag values are stored as integer codes assigned
//! by an external string-interning indexer; all resolution goes through the
//! [`indexer::StringIndexer`] seam.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod indexer;
pub mod types;

/// Metadata discovery by sampling the most recent data window
pub mod meta;

/// Query pipeline: filter parsing, query definition, compilation, conversion
pub mod query;

/// Data source facade: live backend pipeline and catalog-backed mock
pub mod source;

// Re-export main types
pub use backend::{BackendQuery, Datum, MetricsBackend, Row};
pub use error::{QueryError, Result};
pub use indexer::{MemoryIndexer, StringIndexer};
pub use query::{FilterExpr, QueryDefinition, QueryParams};
pub use source::{DataSource, LiveDataSource, MockDataSource};
pub use types::{
    EntityKey, GroupResult, MetricMeta, MetricMetaWithTagKeys, MetricType, Operation, Project,
    SeriesResult, Tag, TagValue,
};
