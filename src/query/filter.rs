//! Filter expression parser
//!
//! Parses the small textual query language used to filter series by tags:
//! `tag:value` equality terms combined with the literal connectives `" and "`
//! and `" or "`, e.g.
//!
//! ```text
//! release:myapp@2.0.0 and environment:production or session.status:healthy
//! ```
//!
//! The result is an OR-of-ANDs tree of tag-equality terms. Values may be
//! wrapped in double quotes (stripped) and may be empty; tag names are
//! restricted to word characters, dot and underscore.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{QueryError, Result};

static TAG_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w|\.|_)+$").expect("valid tag name regex"));

/// A single tag-equality term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCondition {
    /// Tag key name
    pub key: String,
    /// Expected tag value; may be empty
    pub value: String,
}

/// A boolean filter over tag equality, as a list of OR-branches each holding
/// a list of AND-terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpr {
    /// OR-branches; a row matches if all terms of at least one branch match
    pub or: Vec<Vec<TagCondition>>,
}

fn verify_tag_name(name: &str) -> Result<&str> {
    if !TAG_NAME_REGEX.is_match(name) {
        return Err(QueryError::InvalidParams(format!(
            "Invalid tag name: '{}'",
            name
        )));
    }
    Ok(name)
}

fn parse_tag(tag_string: &str) -> Result<TagCondition> {
    let (name, value) = tag_string.split_once(':').ok_or_else(|| {
        QueryError::InvalidParams(format!(
            "Expected something like 'foo:\"bar\"' for tag, got '{}'",
            tag_string
        ))
    })?;

    Ok(TagCondition {
        key: verify_tag_name(name)?.to_string(),
        value: value.trim_matches('"').to_string(),
    })
}

/// Parse a filter query string into its boolean expression tree
///
/// The caller is responsible for treating an empty query string as "no
/// filter"; an empty string passed here is a malformed term.
pub fn parse_filter(query_string: &str) -> Result<FilterExpr> {
    let or = query_string
        .split(" or ")
        .map(|or_part| or_part.split(" and ").map(parse_tag).collect())
        .collect::<Result<Vec<Vec<TagCondition>>>>()?;

    Ok(FilterExpr { or })
}
