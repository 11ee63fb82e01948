//! String-interning indexer interface
//!
//! Metric names, tag keys and tag values are stored in the backend as integer
//! codes assigned by an external indexer service. This module defines the
//! resolution seam and an in-memory implementation used by tests and the mock
//! pipeline.
//!
//! Codes are strictly positive; zero is reserved as the "no value" sentinel.
//! A filter condition against code zero can never match a row, which is how
//! unresolvable user-supplied tag names and values are compiled (the tag may
//! legitimately not have been indexed yet).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{QueryError, Result};

/// The reserved code that never matches any indexed string
pub const UNRESOLVED_CODE: i64 = 0;

/// Synchronous string-interning collaborator
///
/// `resolve` misses are expected for user-supplied strings; `reverse_resolve`
/// misses on codes coming back from backend results are invariant violations
/// (see [`reverse_resolve_known`]).
pub trait StringIndexer: Send + Sync {
    /// Look up the integer code for a string, if it was ever indexed
    fn resolve(&self, string: &str) -> Option<i64>;

    /// Look up the string a code was assigned to
    fn reverse_resolve(&self, code: i64) -> Option<String>;
}

/// Reverse-resolve a code that is known to exist in backend results
///
/// A miss here indicates indexer/backend inconsistency and aborts the request
/// loudly instead of producing partial output.
pub fn reverse_resolve_known(indexer: &dyn StringIndexer, code: i64) -> Result<String> {
    indexer.reverse_resolve(code).ok_or_else(|| {
        QueryError::Inconsistent(format!("no string indexed for known code {}", code))
    })
}

/// In-memory indexer assigning sequential codes starting at 1
#[derive(Debug, Default)]
pub struct MemoryIndexer {
    inner: RwLock<MemoryIndexerInner>,
}

#[derive(Debug, Default)]
struct MemoryIndexerInner {
    forward: HashMap<String, i64>,
    // Position i holds the string for code i + 1
    reverse: Vec<String>,
}

impl MemoryIndexer {
    /// Create an empty indexer
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, assigning a new code if it was not seen before
    pub fn intern(&self, string: &str) -> i64 {
        let mut inner = self.inner.write();
        if let Some(&code) = inner.forward.get(string) {
            return code;
        }
        inner.reverse.push(string.to_string());
        let code = inner.reverse.len() as i64;
        inner.forward.insert(string.to_string(), code);
        code
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.inner.read().reverse.len()
    }

    /// Whether nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StringIndexer for MemoryIndexer {
    fn resolve(&self, string: &str) -> Option<i64> {
        self.inner.read().forward.get(string).copied()
    }

    fn reverse_resolve(&self, code: i64) -> Option<String> {
        if code <= 0 {
            return None;
        }
        self.inner.read().reverse.get((code - 1) as usize).cloned()
    }
}
