//! Data source facade
//!
//! A [`DataSource`] answers metadata questions and series queries for a
//! project scope. Two implementations exist:
//! - [`LiveDataSource`] runs the full pipeline against a real backend:
//!   compile, fan out per entity, convert.
//! - [`MockDataSource`] answers from the static catalog with deterministic
//!   generated series, for development and API tests without a backend.

mod live;
mod mock;

pub use live::LiveDataSource;
pub use mock::MockDataSource;

use async_trait::async_trait;

use crate::error::Result;
use crate::query::QueryDefinition;
use crate::types::{MetricMeta, MetricMetaWithTagKeys, Project, SeriesResult, Tag, TagValue};

/// Answers metrics metadata and series queries for a project scope
#[async_trait]
pub trait DataSource: Send + Sync {
    /// All known metrics, without tag information
    async fn get_metrics(&self, projects: &[Project]) -> Result<Vec<MetricMeta>>;

    /// One metric's metadata including its tag keys, without tag values
    async fn get_single_metric(
        &self,
        projects: &[Project],
        metric_name: &str,
    ) -> Result<MetricMetaWithTagKeys>;

    /// Known tag keys; with a metric scope, only keys appearing in *all*
    /// named metrics
    async fn get_tags(
        &self,
        projects: &[Project],
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<Tag>>;

    /// Known values of one tag, optionally scoped the same way as
    /// [`DataSource::get_tags`]
    async fn get_tag_values(
        &self,
        projects: &[Project],
        tag_name: &str,
        metric_names: Option<&[&str]>,
    ) -> Result<Vec<TagValue>>;

    /// Execute a series query and return the interval-aligned result envelope
    async fn get_series(
        &self,
        projects: &[Project],
        definition: &QueryDefinition,
    ) -> Result<SeriesResult>;
}
