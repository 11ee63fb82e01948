//! Query definition: validated, immutable form of a metrics query request
//!
//! Raw multi-valued request parameters are validated once, at construction.
//! Everything downstream (compiler, converter, data sources) reads from the
//! resulting [`QueryDefinition`] and can rely on its invariants:
//!
//! - at least one field was requested
//! - `limit` is only present together with `orderBy`
//! - `orderBy` names one of the requested fields, the field set is a
//!   singleton, and the operation is not a percentile
//! - the time window aligns to the rollup and stays within the point budget

use chrono::{DateTime, Duration, DurationRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::backend::Direction;
use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::query::filter::{parse_filter, FilterExpr};
use crate::types::{Operation, OPERATIONS};

static FIELD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\(((\w|\.|_)+)\)$").expect("valid field regex"));

/// An ordered, multi-valued key/value collection of raw query parameters
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Build from `(key, value)` pairs, preserving order
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// First value for a key, if any
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a key, in request order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// An (operation, metric name) pair parsed from a field expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricField {
    /// The aggregation operation
    pub operation: Operation,
    /// The metric the operation applies to
    pub metric: String,
}

/// Parse a field expression of the form `operation(metric_name)`
pub fn parse_field(field: &str) -> Result<MetricField> {
    let captures = FIELD_REGEX.captures(field).ok_or_else(|| {
        QueryError::InvalidField(format!(
            "Failed to parse '{}'. Must be something like 'sum(my_metric)'.",
            field
        ))
    })?;

    let operation = Operation::parse(&captures[1]).ok_or_else(|| {
        QueryError::InvalidField(format!(
            "Invalid operation '{}'. Must be one of {}",
            &captures[1],
            OPERATIONS.join(", ")
        ))
    })?;

    Ok(MetricField {
        operation,
        metric: captures[2].to_string(),
    })
}

/// The requested ordering: a single field reference and a direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    /// The field to order by; must be one of the requested fields
    pub field: MetricField,
    /// Sort direction
    pub direction: Direction,
}

/// The validated, immutable definition of a metrics query
#[derive(Debug, Clone)]
pub struct QueryDefinition {
    query: String,
    parsed_query: Option<FilterExpr>,
    fields: Vec<(String, MetricField)>,
    groupby: Vec<String>,
    orderby: Option<OrderSpec>,
    limit: Option<usize>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rollup: u64,
}

impl QueryDefinition {
    /// Construct and validate a definition from raw request parameters using
    /// the default limits
    pub fn from_params(params: &QueryParams) -> Result<Self> {
        Self::from_params_with(params, &QueryConfig::default())
    }

    /// Construct and validate a definition from raw request parameters
    pub fn from_params_with(params: &QueryParams, config: &QueryConfig) -> Result<Self> {
        let query = params.get("query").unwrap_or_default().to_string();
        let parsed_query = if query.is_empty() {
            None
        } else {
            Some(parse_filter(&query)?)
        };

        let raw_fields = params.get_all("field");
        if raw_fields.is_empty() {
            return Err(QueryError::InvalidField(
                "Request is missing a \"field\"".to_string(),
            ));
        }
        let mut fields: Vec<(String, MetricField)> = Vec::with_capacity(raw_fields.len());
        for raw in raw_fields {
            if fields.iter().any(|(key, _)| key == raw) {
                continue;
            }
            fields.push((raw.to_string(), parse_field(raw)?));
        }

        let groupby = params
            .get_all("groupBy")
            .into_iter()
            .map(str::to_string)
            .collect();

        let orderby = Self::parse_orderby(params, &fields)?;
        let limit = Self::parse_limit(params, orderby.is_some())?;

        let (start, end, rollup) = resolve_time_window(params, config)?;

        Ok(Self {
            query,
            parsed_query,
            fields,
            groupby,
            orderby,
            limit,
            start,
            end,
            rollup,
        })
    }

    fn parse_orderby(
        params: &QueryParams,
        fields: &[(String, MetricField)],
    ) -> Result<Option<OrderSpec>> {
        let raw = params.get_all("orderBy");
        let raw = match raw.as_slice() {
            [] => return Ok(None),
            [one] => *one,
            _ => {
                return Err(QueryError::InvalidParams(
                    "Only one 'orderBy' is supported".to_string(),
                ))
            }
        };

        if fields.len() != 1 {
            // Ordering across multiple fields would require a second round
            // trip to fetch the non-sorted fields for the winning groups.
            return Err(QueryError::InvalidParams(
                "Cannot provide multiple 'field's when 'orderBy' is given".to_string(),
            ));
        }

        let (name, direction) = match raw.strip_prefix('-') {
            Some(stripped) => (stripped, Direction::Desc),
            None => (raw, Direction::Asc),
        };

        let field = fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, field)| field.clone())
            .ok_or_else(|| {
                QueryError::InvalidParams(
                    "'orderBy' must be one of the provided 'fields'".to_string(),
                )
            })?;

        if field.operation.is_percentile() {
            return Err(QueryError::InvalidParams(
                "'orderBy' percentiles is not yet supported".to_string(),
            ));
        }

        Ok(Some(OrderSpec { field, direction }))
    }

    fn parse_limit(params: &QueryParams, has_orderby: bool) -> Result<Option<usize>> {
        let raw = match params.get("limit") {
            None => return Ok(None),
            Some(raw) => raw,
        };
        if !has_orderby {
            return Err(QueryError::InvalidParams(
                "'limit' is only supported in combination with 'orderBy'".to_string(),
            ));
        }
        match raw.parse::<usize>() {
            Ok(limit) if limit >= 1 => Ok(Some(limit)),
            _ => Err(QueryError::InvalidParams(
                "'limit' must be integer >= 1".to_string(),
            )),
        }
    }

    /// The raw filter query string, possibly empty
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The parsed filter expression, if a filter was given
    pub fn parsed_query(&self) -> Option<&FilterExpr> {
        self.parsed_query.as_ref()
    }

    /// Requested fields keyed by their literal string form, in request order
    pub fn fields(&self) -> &[(String, MetricField)] {
        &self.fields
    }

    /// Requested group-by tag names
    pub fn groupby(&self) -> &[String] {
        &self.groupby
    }

    /// The requested ordering, if any
    pub fn orderby(&self) -> Option<&OrderSpec> {
        self.orderby.as_ref()
    }

    /// The requested row limit, if any; only present together with an order
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Window start (inclusive)
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Window end (exclusive)
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Bucket width in seconds
    pub fn rollup(&self) -> u64 {
        self.rollup
    }

    /// The dense sequence of bucket start timestamps covering the window
    pub fn intervals(&self) -> Vec<DateTime<Utc>> {
        let mut intervals = Vec::new();
        let delta = Duration::seconds(self.rollup as i64);
        let mut cursor = self.start;
        while cursor < self.end {
            intervals.push(cursor);
            cursor += delta;
        }
        intervals
    }
}

/// Parse a duration shorthand such as `90d`, `24h`, `30m` or `10s` (a bare
/// integer is taken as seconds)
pub fn parse_duration_shorthand(raw: &str) -> Result<u64> {
    let err = || QueryError::InvalidParams(format!("Invalid duration: '{}'", raw));

    let (digits, multiplier) = match raw.chars().last() {
        Some('s') => (&raw[..raw.len() - 1], 1),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('h') => (&raw[..raw.len() - 1], 3600),
        Some('d') => (&raw[..raw.len() - 1], 86400),
        Some(c) if c.is_ascii_digit() => (raw, 1),
        _ => return Err(err()),
    };

    let value: u64 = digits.parse().map_err(|_| err())?;
    if value == 0 {
        return Err(err());
    }
    Ok(value * multiplier)
}

/// Resolve the requested time window to `(start, end, rollup)`
///
/// Either an explicit RFC 3339 `start`/`end` pair (which must already align
/// to the rollup) or a `statsPeriod` shorthand anchored at the current time
/// (aligned outward to rollup boundaries). Enforces the minimum rollup and
/// the maximum point budget.
fn resolve_time_window(
    params: &QueryParams,
    config: &QueryConfig,
) -> Result<(DateTime<Utc>, DateTime<Utc>, u64)> {
    let interval = params.get("interval").unwrap_or(&config.default_interval);
    let rollup = parse_duration_shorthand(interval)?;
    if rollup < config.min_rollup_secs {
        return Err(QueryError::InvalidParams(format!(
            "The interval has to be at least {} seconds",
            config.min_rollup_secs
        )));
    }

    let (start, end) = match (params.get("start"), params.get("end")) {
        (Some(raw_start), Some(raw_end)) => {
            let start = parse_datetime(raw_start)?;
            let end = parse_datetime(raw_end)?;
            if start >= end {
                return Err(QueryError::InvalidParams(
                    "start must be before end".to_string(),
                ));
            }
            // The backend buckets on epoch-aligned boundaries; a window that
            // sits off the grid could never match any bucket timestamp.
            if start.timestamp() % rollup as i64 != 0 {
                return Err(QueryError::InvalidParams(format!(
                    "start must align to {} second buckets",
                    rollup
                )));
            }
            let span = (end - start).num_seconds() as u64;
            if span % rollup != 0 {
                return Err(QueryError::InvalidParams(format!(
                    "The interval should divide the date range without a remainder: \
                     {} seconds do not align to {} second buckets",
                    span, rollup
                )));
            }
            (start, end)
        }
        (None, None) => {
            let period = parse_duration_shorthand(
                params
                    .get("statsPeriod")
                    .unwrap_or(&config.default_stats_period),
            )?;
            let end = ceil_to_rollup(Utc::now(), rollup)?;
            let buckets = period.div_ceil(rollup);
            let start = end - Duration::seconds((buckets * rollup) as i64);
            (start, end)
        }
        _ => {
            return Err(QueryError::InvalidParams(
                "Either both or neither of 'start' and 'end' must be given".to_string(),
            ))
        }
    };

    let points = ((end - start).num_seconds() as u64) / rollup;
    if points as usize > config.max_points {
        return Err(QueryError::InvalidParams(format!(
            "Your interval and date range would create too many results ({} > {})",
            points, config.max_points
        )));
    }

    Ok((start, end, rollup))
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| QueryError::InvalidParams(format!("Invalid datetime: '{}'", raw)))
}

fn ceil_to_rollup(t: DateTime<Utc>, rollup: u64) -> Result<DateTime<Utc>> {
    let delta = Duration::seconds(rollup as i64);
    let floored = t
        .duration_trunc(delta)
        .map_err(|e| QueryError::InvalidParams(format!("Invalid rollup: {}", e)))?;
    if floored == t {
        Ok(floored)
    } else {
        Ok(floored + delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> Vec<(&'static str, &'static str)> {
        vec![
            ("field", "sum(session)"),
            ("interval", "1h"),
            ("start", "2021-08-24T00:00:00+00:00"),
            ("end", "2021-08-25T00:00:00+00:00"),
        ]
    }

    fn definition(pairs: Vec<(&str, &str)>) -> Result<QueryDefinition> {
        QueryDefinition::from_params(&QueryParams::from_pairs(pairs))
    }

    #[test]
    fn test_parse_field_ok() {
        let field = parse_field("sum(session)").unwrap();
        assert_eq!(field.operation, Operation::Sum);
        assert_eq!(field.metric, "session");

        let field = parse_field("p95(measurement.lcp)").unwrap();
        assert_eq!(field.operation, Operation::P95);
        assert_eq!(field.metric, "measurement.lcp");
    }

    #[test]
    fn test_parse_field_malformed() {
        assert!(matches!(
            parse_field("foo(session"),
            Err(QueryError::InvalidField(_))
        ));
        assert!(matches!(parse_field(""), Err(QueryError::InvalidField(_))));
    }

    #[test]
    fn test_parse_field_unknown_operation() {
        let err = parse_field("foo(session)").unwrap_err();
        assert!(matches!(err, QueryError::InvalidField(_)));
        assert!(err.to_string().contains("count_unique"));
    }

    #[test]
    fn test_missing_field_fails() {
        let err = definition(vec![("interval", "1h")]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidField(_)));
    }

    #[test]
    fn test_duplicate_fields_deduplicated() {
        let mut params = base_params();
        params.push(("field", "sum(session)"));
        let def = definition(params).unwrap();
        assert_eq!(def.fields().len(), 1);
    }

    #[test]
    fn test_limit_without_orderby_fails() {
        let mut params = base_params();
        params.push(("limit", "3"));
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_limit_must_be_positive_integer() {
        for bad in ["0", "-1", "x"] {
            let mut params = base_params();
            params.push(("orderBy", "sum(session)"));
            params.push(("limit", bad));
            assert!(matches!(
                definition(params),
                Err(QueryError::InvalidParams(_))
            ));
        }
    }

    #[test]
    fn test_orderby_with_multiple_fields_fails() {
        let mut params = base_params();
        params.push(("field", "count_unique(user)"));
        params.push(("orderBy", "sum(session)"));
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_orderby_must_name_a_field() {
        let mut params = base_params();
        params.push(("orderBy", "sum(other)"));
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_orderby_percentile_fails() {
        let params = vec![
            ("field", "p50(session.duration)"),
            ("interval", "1h"),
            ("start", "2021-08-24T00:00:00+00:00"),
            ("end", "2021-08-25T00:00:00+00:00"),
            ("orderBy", "p50(session.duration)"),
        ];
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_orderby_descending_prefix() {
        let mut params = base_params();
        params.push(("orderBy", "-sum(session)"));
        params.push(("limit", "3"));
        let def = definition(params).unwrap();
        let order = def.orderby().unwrap();
        assert_eq!(order.direction, Direction::Desc);
        assert_eq!(order.field.metric, "session");
        assert_eq!(def.limit(), Some(3));
    }

    #[test]
    fn test_empty_query_means_no_filter() {
        let def = definition(base_params()).unwrap();
        assert!(def.parsed_query().is_none());
    }

    #[test]
    fn test_malformed_filter_fails() {
        let mut params = base_params();
        params.push(("query", "%w45698u"));
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_intervals_cover_window() {
        let def = definition(base_params()).unwrap();
        let intervals = def.intervals();
        assert_eq!(intervals.len(), 24);
        assert_eq!(intervals[0], def.start());
        assert_eq!(
            intervals[23] + Duration::seconds(def.rollup() as i64),
            def.end()
        );
    }

    #[test]
    fn test_interval_below_minimum_fails() {
        let params = vec![
            ("field", "sum(session)"),
            ("interval", "5s"),
            ("start", "2021-08-24T00:00:00+00:00"),
            ("end", "2021-08-25T00:00:00+00:00"),
        ];
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_unaligned_window_fails() {
        let params = vec![
            ("field", "sum(session)"),
            ("interval", "1h"),
            ("start", "2021-08-24T00:00:00+00:00"),
            ("end", "2021-08-24T00:30:00+00:00"),
        ];
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_misaligned_explicit_window_fails() {
        // The span divides evenly into buckets, but the boundaries sit off
        // the epoch-aligned grid the backend buckets on; no series row could
        // ever land inside such a window.
        let params = vec![
            ("field", "sum(session)"),
            ("interval", "1h"),
            ("start", "2021-08-24T00:30:00+00:00"),
            ("end", "2021-08-24T02:30:00+00:00"),
        ];
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_point_budget_enforced() {
        // 90 days at 10 second resolution is far beyond 10k points
        let params = vec![
            ("field", "sum(session)"),
            ("interval", "10s"),
            ("start", "2021-06-01T00:00:00+00:00"),
            ("end", "2021-08-30T00:00:00+00:00"),
        ];
        assert!(matches!(
            definition(params),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_stats_period_window_is_aligned() {
        let params = vec![("field", "sum(session)"), ("statsPeriod", "1d")];
        let def = definition(params).unwrap();
        assert_eq!(def.rollup(), 3600);
        assert_eq!((def.end() - def.start()).num_seconds(), 86400);
        assert_eq!(def.end().timestamp() % 3600, 0);
    }

    #[test]
    fn test_duration_shorthand() {
        assert_eq!(parse_duration_shorthand("10s").unwrap(), 10);
        assert_eq!(parse_duration_shorthand("30m").unwrap(), 1800);
        assert_eq!(parse_duration_shorthand("24h").unwrap(), 86400);
        assert_eq!(parse_duration_shorthand("90d").unwrap(), 7_776_000);
        assert_eq!(parse_duration_shorthand("60").unwrap(), 60);
        assert!(parse_duration_shorthand("").is_err());
        assert!(parse_duration_shorthand("0s").is_err());
        assert!(parse_duration_shorthand("1w").is_err());
    }
}
